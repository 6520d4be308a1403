//! Supervisor side of the shim protocol.
//!
//! Every container process gets a private state directory holding `process.json`, the
//! `exit`/`control` fifos and, once known, `pid`, `startTime` and `exitStatus`. A shim is
//! spawned in that directory; it launches the process through the runtime and reports the
//! pid by writing the `pid` file.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use log::LevelFilter;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::sandbox::process_state::ProcessState;
use crate::sandbox::state::ProcessStatus;
use crate::sandbox::utils::{
    WithTimeout as _, read_log_errors, read_pid_file, try_read_pid_file, write_atomic,
};
use crate::sandbox::{Error, Result};
use crate::sys::fifo::ControlPipes;
use crate::sys::liveness::{Host, ProcessIdentity, ProcessTable as _, is_alive};
use crate::sys::reaper::{ExitEvent, Monitor, Subscription};

pub const INIT_PROCESS_ID: &str = "init";
pub const PID_FILE: &str = "pid";
pub const START_TIME_FILE: &str = "startTime";
pub const EXIT_STATUS_FILE: &str = "exitStatus";
pub const SHIM_LOG_FILE: &str = "shim-log.json";
pub const RUNTIME_LOG_FILE: &str = "log.json";

const PID_POLL_INTERVAL: Duration = Duration::from_millis(15);
const SHIM_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns shims and reloads the processes they manage.
#[derive(Clone)]
pub struct ShimDriver {
    binary: PathBuf,
    runtime: String,
    log_level: Option<LevelFilter>,
    monitor: Monitor,
    timeout: Duration,
}

pub struct NewProcessOpts {
    pub container_id: String,
    pub bundle: PathBuf,
    /// Private state directory of the process. Must not exist yet.
    pub dir: PathBuf,
    pub state: ProcessState,
}

/// A running shim and the reap events that will report its exit.
pub struct ShimHandle {
    pub pid: i32,
    pub subscription: Subscription,
    /// Set when the shim already exited while the pid was being discovered.
    pub exited: Option<ExitEvent>,
}

/// A freshly spawned process.
pub struct SpawnedProcess {
    pub pipes: ControlPipes,
    pub identity: ProcessIdentity,
    pub status: ProcessStatus,
    pub shim: ShimHandle,
}

/// A process recovered from its state directory.
pub struct LoadedProcess {
    pub state: ProcessState,
    pub pipes: ControlPipes,
    pub identity: ProcessIdentity,
    pub status: ProcessStatus,
}

impl ShimDriver {
    /// `runtime` is handed to every shim as the runtime binary to invoke.
    pub fn new(
        binary: impl Into<PathBuf>,
        runtime: impl Into<String>,
        monitor: Monitor,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            runtime: runtime.into(),
            log_level: None,
            monitor,
            timeout,
        }
    }

    /// Passed to every shim as `--log-level`. Shims default to `info`.
    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Spawns a shim for a new process and waits until it reports the pid.
    ///
    /// On failure the shim is killed and reaped and the state directory removed.
    pub async fn new_process(
        &self,
        opts: NewProcessOpts,
        cancel: &CancellationToken,
    ) -> Result<SpawnedProcess> {
        match fs::create_dir(&opts.dir) {
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(opts.dir.display().to_string()));
            }
            res => res?,
        }

        let res = self.spawn(&opts, cancel).await;
        if res.is_err() {
            if let Err(err) = fs::remove_dir_all(&opts.dir) {
                log::warn!("failed to remove {}: {err}", opts.dir.display());
            }
        }
        res
    }

    async fn spawn(
        &self,
        opts: &NewProcessOpts,
        cancel: &CancellationToken,
    ) -> Result<SpawnedProcess> {
        let dir = &opts.dir;
        let pipes = ControlPipes::create(dir)?;
        opts.state.save(dir)?;

        let log = fs::File::create(dir.join(SHIM_LOG_FILE))?;
        let mut cmd = Command::new(&self.binary);
        cmd.arg(&opts.container_id)
            .arg(&opts.bundle)
            .arg(&self.runtime);
        if let Some(level) = self.log_level {
            cmd.arg("--log-level").arg(level.as_str().to_lowercase());
        }
        cmd.current_dir(dir)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log);

        let (pid, mut subscription) = self.monitor.spawn(cmd).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                Error::Others(format!(
                    "{} is not installed on the system",
                    self.binary.display()
                ))
            } else {
                err.into()
            }
        })?;
        log::debug!(
            "spawned shim {pid} for {} in {}",
            opts.container_id,
            dir.display()
        );

        let mut exited = None;
        match wait_for_pid(dir, pid, &mut subscription, &mut exited, cancel, self.timeout).await
        {
            Ok((identity, status)) => Ok(SpawnedProcess {
                pipes,
                identity,
                status,
                shim: ShimHandle {
                    pid,
                    subscription,
                    exited,
                },
            }),
            Err(err) => {
                if exited.is_none() {
                    kill_shim(pid, &mut subscription).await;
                }
                drop(pipes);
                Err(err)
            }
        }
    }

    /// Rebuilds a process from its state directory without spawning anything.
    ///
    /// Must be called from within a tokio runtime.
    pub fn load_process(dir: &Path) -> Result<LoadedProcess> {
        let state = ProcessState::load(dir)?;
        let pid = read_pid_file(&dir.join(PID_FILE))?;
        let start_time = match fs::read_to_string(dir.join(START_TIME_FILE)) {
            Ok(start_time) => Some(start_time),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        let pipes = ControlPipes::open(dir)?;

        // without a recorded start time the pid can't be trusted
        let alive = start_time
            .as_deref()
            .is_some_and(|start_time| is_alive(&Host, pid, start_time));
        let status = if alive {
            ProcessStatus::Running
        } else {
            ProcessStatus::Stopped
        };

        Ok(LoadedProcess {
            state,
            pipes,
            identity: ProcessIdentity {
                pid,
                start_time: start_time.unwrap_or_default(),
            },
            status,
        })
    }
}

async fn wait_for_pid(
    dir: &Path,
    shim_pid: i32,
    subscription: &mut Subscription,
    shim_exited: &mut Option<ExitEvent>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<(ProcessIdentity, ProcessStatus)> {
    let pid_file = dir.join(PID_FILE);
    let mut ticker = tokio::time::interval(PID_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let pid = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Canceled("waiting for the container pid".to_string()));
            }
            _ = &mut deadline => {
                return Err(Error::Canceled(format!(
                    "shim did not report a container pid within {timeout:?}"
                )));
            }
            Some(event) = subscription.wait_for(shim_pid), if shim_exited.is_none() => {
                *shim_exited = Some(event);
                // the process may have come and gone before the next tick
                if event.success() {
                    if let Some(pid) = try_read_pid_file(&pid_file)? {
                        break pid;
                    }
                }
                return Err(shim_exited_error(dir, &event));
            }
            _ = ticker.tick() => {
                if let Some(pid) = try_read_pid_file(&pid_file)? {
                    break pid;
                }
            }
        }
    };

    let start_time_file = dir.join(START_TIME_FILE);
    let (status, start_time) = match Host.start_time(pid) {
        Err(err) if err.kind() == ErrorKind::NotFound => (ProcessStatus::Stopped, String::new()),
        Err(err) => return Err(err.into()),
        Ok(current) => match fs::read_to_string(&start_time_file) {
            Ok(recorded) if recorded != current => (ProcessStatus::Stopped, recorded),
            Ok(recorded) => (ProcessStatus::Created, recorded),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                write_atomic(&start_time_file, &current)?;
                (ProcessStatus::Created, current)
            }
            Err(err) => return Err(err.into()),
        },
    };

    log::debug!("shim {shim_pid} reported pid {pid} ({status})");
    Ok((ProcessIdentity { pid, start_time }, status))
}

fn shim_exited_error(dir: &Path, event: &ExitEvent) -> Error {
    let logged: Vec<String> = [SHIM_LOG_FILE, RUNTIME_LOG_FILE]
        .iter()
        .flat_map(|file| read_log_errors(&dir.join(file)))
        .collect();
    if logged.is_empty() {
        Error::ShimExited(event.to_string())
    } else {
        Error::ShimExited(format!("{event}: {}", logged.join("; ")))
    }
}

/// Kills the shim's process group and waits for the shim to be reaped.
async fn kill_shim(pid: i32, subscription: &mut Subscription) {
    if subscription.try_wait_for(pid).is_some() {
        return;
    }
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => log::warn!("failed to kill shim {pid}: {err}"),
    }
    let reaped = subscription
        .wait_for(pid)
        .with_timeout(SHIM_KILL_TIMEOUT)
        .await
        .flatten();
    if reaped.is_none() {
        log::warn!("shim {pid} was not reaped after being killed");
    }
}

/// Reads the exit status the shim (or the reaper) persisted for the process.
pub fn read_exit_status(dir: &Path) -> Result<u32> {
    let path = dir.join(EXIT_STATUS_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(Error::IndeterminateExit(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Err(err) => return Err(err.into()),
    };
    let contents = contents.trim();
    if contents.is_empty() {
        return Err(Error::IndeterminateExit(format!(
            "{} is empty",
            path.display()
        )));
    }
    contents.parse::<i32>().map(|code| code as u32).map_err(|_| {
        Error::IndeterminateExit(format!(
            "{}: {contents:?} is not an exit status",
            path.display()
        ))
    })
}

pub fn write_exit_status(dir: &Path, code: i32) -> Result<()> {
    write_atomic(&dir.join(EXIT_STATUS_FILE), code.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use oci_spec::runtime::Process;
    use tempfile::tempdir;

    use super::*;
    use crate::sandbox::process_state::Stdio as ProcessStdio;
    use crate::sandbox::utils::WithTimeout as _;
    use crate::sys::liveness::ProcessTable as _;
    use crate::sandbox::testing::{self, FakeShim};

    fn opts(dir: &Path) -> NewProcessOpts {
        let stdio = ProcessStdio::null();
        NewProcessOpts {
            container_id: "c1".to_string(),
            bundle: dir.join("bundle"),
            dir: dir.join("init"),
            state: ProcessState {
                process: Process::default(),
                exec: false,
                stdin: stdio.stdin,
                stdout: stdio.stdout,
                stderr: stdio.stderr,
                runtime_args: vec![],
                no_pivot_root: false,
                checkpoint: String::new(),
                root_uid: 0,
                root_gid: 0,
            },
        }
    }

    fn driver(shim: FakeShim) -> ShimDriver {
        ShimDriver::new(
            testing::fake_shim(shim),
            "runc",
            testing::monitor(),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_new_process() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let opts = opts(dir.path());
        let state_dir = opts.dir.clone();
        let spawned = driver(FakeShim::Normal)
            .new_process(opts, &CancellationToken::new())
            .await?;

        assert_eq!(spawned.status, ProcessStatus::Created);
        assert!(spawned.identity.is_alive());
        assert_eq!(
            fs::read_to_string(state_dir.join(START_TIME_FILE))?,
            spawned.identity.start_time
        );
        assert!(state_dir.join("process.json").exists());
        assert!(spawned.shim.exited.is_none());

        nix::sys::signal::kill(Pid::from_raw(spawned.identity.pid), Signal::SIGKILL)?;
        spawned
            .pipes
            .exit
            .closed()
            .with_timeout(Duration::from_secs(10))
            .await
            .expect("shim did not exit")?;
        assert_eq!(read_exit_status(&state_dir)?, 137);
        Ok(())
    }

    #[tokio::test]
    async fn test_shim_dies_before_pid() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let opts = opts(dir.path());
        let state_dir = opts.dir.clone();
        let err = driver(FakeShim::DiesBeforePid)
            .new_process(opts, &CancellationToken::new())
            .with_timeout(Duration::from_secs(10))
            .await
            .expect("new_process hung")
            .err()
            .expect("new_process succeeded");

        match err {
            Error::ShimExited(msg) => {
                assert!(msg.contains("SIGKILL"), "{msg}");
                assert!(msg.contains("boom"), "{msg}");
            }
            err => panic!("unexpected error: {err}"),
        }
        assert!(!state_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_kills_shim() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let opts = opts(dir.path());
        let state_dir = opts.dir.clone();
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });
        }

        let err = driver(FakeShim::NeverReports)
            .new_process(opts, &cancel)
            .with_timeout(Duration::from_secs(10))
            .await
            .expect("new_process hung")
            .err()
            .expect("new_process succeeded");
        assert!(matches!(err, Error::Canceled(_)), "{err}");
        assert!(!state_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let driver = ShimDriver::new(
            testing::fake_shim(FakeShim::NeverReports),
            "runc",
            testing::monitor(),
            Duration::from_millis(100),
        );
        let err = driver
            .new_process(opts(dir.path()), &CancellationToken::new())
            .await
            .err()
            .expect("new_process succeeded");
        assert!(matches!(err, Error::Canceled(_)), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_shim_binary() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let driver = ShimDriver::new(
            "/nonexistent/shim",
            "runc",
            testing::monitor(),
            Duration::from_secs(1),
        );
        let err = driver
            .new_process(opts(dir.path()), &CancellationToken::new())
            .await
            .err()
            .expect("new_process succeeded");
        assert!(err.to_string().contains("not installed"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_state_dir() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let opts = opts(dir.path());
        fs::create_dir(&opts.dir)?;
        let err = driver(FakeShim::Normal)
            .new_process(opts, &CancellationToken::new())
            .await
            .err()
            .expect("new_process succeeded");
        assert!(matches!(err, Error::AlreadyExists(_)), "{err}");
        Ok(())
    }

    /// Lays out a state directory as if a shim had run there.
    fn persisted(dir: &Path, pid: i32, start_time: Option<&str>) -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        opts(dir).state.save(dir)?;
        fs::write(dir.join(PID_FILE), pid.to_string())?;
        if let Some(start_time) = start_time {
            fs::write(dir.join(START_TIME_FILE), start_time)?;
        }
        ControlPipes::create(dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn test_load_exited_process() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let event = testing::monitor().status(Command::new("true")).await?;

        persisted(dir.path(), event.pid, Some("1"))?;
        let loaded = ShimDriver::load_process(dir.path())?;
        assert_eq!(loaded.status, ProcessStatus::Stopped);
        assert_eq!(loaded.identity.pid, event.pid);
        assert!(!dir.path().join(SHIM_LOG_FILE).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_load_live_process() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let pid = std::process::id() as i32;
        let start_time = Host.start_time(pid)?;

        persisted(dir.path(), pid, Some(&start_time))?;
        let loaded = ShimDriver::load_process(dir.path())?;
        assert_eq!(loaded.status, ProcessStatus::Running);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_recycled_pid() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let pid = std::process::id() as i32;
        persisted(dir.path(), pid, Some("not-the-start-time"))?;
        assert_eq!(
            ShimDriver::load_process(dir.path())?.status,
            ProcessStatus::Stopped
        );

        let dir = tempdir()?;
        persisted(dir.path(), pid, None)?;
        assert_eq!(
            ShimDriver::load_process(dir.path())?.status,
            ProcessStatus::Stopped
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_load_errors() -> anyhow::Result<()> {
        let dir = tempdir()?;
        assert!(ShimDriver::load_process(dir.path()).is_err());

        persisted(dir.path(), 1, Some("1"))?;
        fs::write(dir.path().join(PID_FILE), "garbage")?;
        assert!(matches!(
            ShimDriver::load_process(dir.path()),
            Err(Error::PidFile(_))
        ));
        Ok(())
    }

    #[test]
    fn test_exit_status_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        assert!(matches!(
            read_exit_status(dir.path()),
            Err(Error::IndeterminateExit(_))
        ));
        fs::write(dir.path().join(EXIT_STATUS_FILE), "")?;
        assert!(matches!(
            read_exit_status(dir.path()),
            Err(Error::IndeterminateExit(_))
        ));
        write_exit_status(dir.path(), 143)?;
        assert_eq!(read_exit_status(dir.path())?, 143);
        Ok(())
    }
}
