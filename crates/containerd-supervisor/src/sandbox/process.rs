//! A single supervised process: its identity, status and exit status.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::sandbox::checkpoint::InFlight;
use crate::sandbox::process_state::Stdio;
use crate::sandbox::state::ProcessStatus;
use crate::sandbox::sync::{ExitLatch, ExitSource};
use crate::sandbox::utils::{WithTimeout as _, write_atomic};
use crate::sandbox::{Error, Result};
use crate::sys::fifo::{ControlMessage, ControlPipe, ExitPipe};
use crate::sys::liveness::ProcessIdentity;
use crate::sys::pidfd::PidFd;
use crate::sys::reaper::{ExitEvent, Monitor, Subscription};
use crate::sys::shim::{
    EXIT_STATUS_FILE, LoadedProcess, SpawnedProcess, read_exit_status, write_exit_status,
};

/// How long to wait for the shim after the process itself is gone.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// The operations callers need on a supervised process, independent of how it is run.
#[trait_variant::make(Send)]
pub trait ProcessHandle {
    fn id(&self) -> &str;

    fn pid(&self) -> i32;

    /// Waits for the process to exit and returns its exit status.
    async fn wait(&self) -> Result<u32>;

    fn signal(&self, signal: Signal) -> Result<()>;
}

pub struct Process {
    id: String,
    container_id: String,
    exec: bool,
    stdio: Stdio,
    dir: PathBuf,
    identity: ProcessIdentity,
    status: RwLock<ProcessStatus>,
    control: Mutex<Option<ControlPipe>>,
    exited: ExitLatch,
    exit_code: OnceLock<u32>,
    wait_lock: tokio::sync::Mutex<()>,
    checkpoints: InFlight,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("container_id", &self.container_id)
            .field("pid", &self.identity.pid)
            .field("status", &self.status())
            .finish()
    }
}

pub(crate) struct ProcessOpts {
    pub id: String,
    pub container_id: String,
    pub exec: bool,
    pub stdio: Stdio,
    pub dir: PathBuf,
    pub checkpoints: InFlight,
}

impl Process {
    /// Wraps a process a shim just reported and starts watching for its exit.
    pub(crate) fn spawned(opts: ProcessOpts, spawned: SpawnedProcess) -> Arc<Self> {
        let SpawnedProcess {
            pipes,
            identity,
            status,
            shim,
        } = spawned;
        let process = Arc::new(Self::new(opts, identity, status, pipes.control));

        if shim.exited.is_some() {
            // the shim is already gone, nothing is left to watch
            process.exited.close(ExitSource::Reaped);
        } else {
            tokio::spawn(watch(
                process.exited.clone(),
                process.dir.clone(),
                process.identity.clone(),
                pipes.exit,
                shim.subscription,
                Some(shim.pid),
            ));
        }
        process
    }

    /// Wraps a process recovered from disk. `status` overrides the status seen on disk.
    pub(crate) fn loaded(
        opts: ProcessOpts,
        loaded: LoadedProcess,
        status: ProcessStatus,
        monitor: &Monitor,
    ) -> Arc<Self> {
        let LoadedProcess {
            pipes, identity, ..
        } = loaded;
        let process = Arc::new(Self::new(opts, identity, status, pipes.control));

        if status == ProcessStatus::Stopped {
            process.exited.close(ExitSource::Recovered);
        } else {
            tokio::spawn(watch(
                process.exited.clone(),
                process.dir.clone(),
                process.identity.clone(),
                pipes.exit,
                monitor.subscribe(),
                None,
            ));
        }
        process
    }

    fn new(
        opts: ProcessOpts,
        identity: ProcessIdentity,
        status: ProcessStatus,
        control: ControlPipe,
    ) -> Self {
        Self {
            id: opts.id,
            container_id: opts.container_id,
            exec: opts.exec,
            stdio: opts.stdio,
            dir: opts.dir,
            identity,
            status: RwLock::new(status),
            control: Mutex::new(Some(control)),
            exited: ExitLatch::new(),
            exit_code: OnceLock::new(),
            wait_lock: tokio::sync::Mutex::new(()),
            checkpoints: opts.checkpoints,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn pid(&self) -> i32 {
        self.identity.pid
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    pub fn is_exec(&self) -> bool {
        self.exec
    }

    pub fn stdio(&self) -> &Stdio {
        &self.stdio
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    /// The exit status, once a call to [`Process::wait`] determined it.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code.get().copied()
    }

    /// Closed once the shim is gone.
    pub fn exited(&self) -> &ExitLatch {
        &self.exited
    }

    /// Moves a created process to running. A process that already stopped stays stopped.
    pub(crate) fn mark_running(&self) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        if *status == ProcessStatus::Created {
            *status = ProcessStatus::Running;
        }
    }

    fn mark_stopped(&self) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = status.transition(ProcessStatus::Stopped) {
            log::warn!("{err}");
        }
    }

    fn stopped(&self, code: u32) -> u32 {
        let code = *self.exit_code.get_or_init(|| code);
        self.mark_stopped();
        code
    }

    fn close_pipes(&self) {
        self.control.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Waits for the shim to go away and determines the exit status of the process.
    ///
    /// Concurrent callers are serialized and all observe the same exit status.
    pub async fn wait(&self) -> Result<u32> {
        let source = self.exited.wait().await;
        let _serial = self.wait_lock.lock().await;
        if let Some(code) = self.exit_code.get() {
            return Ok(*code);
        }
        self.close_pipes();
        log::debug!(
            "process {} of container {} is gone ({source:?})",
            self.id,
            self.container_id
        );

        if self.identity.is_alive() {
            if self.checkpoints.is_active() {
                return Err(Error::IndeterminateExit(format!(
                    "shim of process {} exited during a checkpoint, leaving pid {} alone",
                    self.id, self.identity.pid
                )));
            }
            log::warn!(
                "process {} of container {} outlived its shim, killing pid {}",
                self.id,
                self.container_id,
                self.identity.pid
            );
            match kill(Pid::from_raw(self.identity.pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => return Err(err.into()),
            }
            let code = 128 + Signal::SIGKILL as i32;
            write_exit_status(&self.dir, code)?;
            return Ok(self.stopped(code as u32));
        }

        match read_exit_status(&self.dir) {
            Ok(code) => Ok(self.stopped(code)),
            Err(err) => {
                self.mark_stopped();
                Err(err)
            }
        }
    }

    /// Sends `signal` to the process, unless it is gone or its pid now belongs to someone else.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let not_found = || {
            Error::ProcessNotFound(format!(
                "process {} of container {} (pid {})",
                self.id, self.container_id, self.identity.pid
            ))
        };
        if self.status() == ProcessStatus::Stopped || !self.identity.is_alive() {
            return Err(not_found());
        }
        match kill(Pid::from_raw(self.identity.pid), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(not_found()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn close_stdin(&self) -> Result<()> {
        self.send(ControlMessage::CloseStdin)
    }

    /// Forwarded to the shim, which ignores it as terminals are not supported.
    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        self.send(ControlMessage::Resize { width, height })
    }

    fn send(&self, msg: ControlMessage) -> Result<()> {
        let control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        match control.as_ref() {
            Some(pipe) => Ok(pipe.send(msg)?),
            None => Err(Error::FailedPrecondition(format!(
                "process {} has exited",
                self.id
            ))),
        }
    }

    /// Drops the pipes and removes the state directory of a stopped process.
    pub(crate) fn remove(&self) -> Result<()> {
        if self.status() != ProcessStatus::Stopped {
            return Err(Error::FailedPrecondition(format!(
                "cannot delete process {} in the '{}' state",
                self.id,
                self.status()
            )));
        }
        self.close_pipes();
        match fs::remove_dir_all(&self.dir) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

impl ProcessHandle for Process {
    fn id(&self) -> &str {
        Process::id(self)
    }

    fn pid(&self) -> i32 {
        Process::pid(self)
    }

    async fn wait(&self) -> Result<u32> {
        Process::wait(self).await
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        Process::signal(self, signal)
    }
}

/// Closes `exited` with whichever of the exit notifications fires first.
async fn watch(
    exited: ExitLatch,
    dir: PathBuf,
    identity: ProcessIdentity,
    exit: ExitPipe,
    mut subscription: Subscription,
    shim_pid: Option<i32>,
) {
    let _guard = exited.close_guard(ExitSource::Aborted);

    let pid = identity.pid;
    let mut pids = vec![pid];
    pids.extend(shim_pid);

    // a shim we spawned is watched through its fifo and its reap event; the pidfd is only
    // for recovered processes whose shim is not our child, and only if it was opened for
    // the process we know
    let pidfd = match shim_pid {
        Some(_) => None,
        None => PidFd::new(pid).ok().filter(|_| identity.is_alive()),
    };

    let fifo = exit.closed();
    tokio::pin!(fifo);
    let reaped = async {
        match subscription.wait_any(&pids).await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(reaped);
    let pidfd_exited = async {
        match &pidfd {
            Some(pidfd) => (pidfd.pid(), pidfd.exited().await),
            None => std::future::pending().await,
        }
    };

    let source = tokio::select! {
        res = &mut fifo => {
            log_fifo(&dir, res);
            ExitSource::Fifo
        }
        event = &mut reaped => {
            persist_reaped(&dir, pid, &event);
            ExitSource::Reaped
        }
        (exited_pid, res) = pidfd_exited => {
            if let Err(err) = res {
                log::warn!("polling the pidfd of {exited_pid} failed: {err}");
            }
            // give the shim a moment to record the exit status
            let grace = async {
                tokio::select! {
                    res = &mut fifo => log_fifo(&dir, res),
                    event = &mut reaped => persist_reaped(&dir, pid, &event),
                }
            };
            if grace.with_timeout(EXIT_GRACE).await.is_none() {
                log::debug!("pid {exited_pid} exited but its shim is still around");
            }
            ExitSource::PidFd
        }
    };
    exited.close(source);
}

fn log_fifo(dir: &Path, res: std::io::Result<()>) {
    if let Err(err) = res {
        log::warn!("watching the exit fifo in {} failed: {err}", dir.display());
    }
}

/// Records the exit status of a process we reaped ourselves, as its shim can no longer see it.
fn persist_reaped(dir: &Path, pid: i32, event: &ExitEvent) {
    if event.pid != pid {
        return;
    }
    let path = dir.join(EXIT_STATUS_FILE);
    if path.exists() {
        return;
    }
    if let Err(err) = write_atomic(&path, event.code.to_string()) {
        log::error!("failed to record the exit status of pid {pid}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use oci_spec::runtime::Process as ProcessSpec;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::sandbox::process_state::ProcessState;
    use crate::sandbox::testing::{self, FakeShim};
    use crate::sandbox::utils::WithTimeout as _;
    use crate::sys::shim::{NewProcessOpts, ShimDriver};

    async fn spawn(dir: &Path, shim: FakeShim, checkpoints: InFlight) -> Result<Arc<Process>> {
        let bundle = testing::create_bundle(&dir.join("bundle"), None)?;
        let driver = ShimDriver::new(
            testing::fake_shim(shim),
            "runc",
            testing::monitor(),
            Duration::from_secs(10),
        );
        let stdio = Stdio::null();
        let state_dir = dir.join("init");
        let spawned = driver
            .new_process(
                NewProcessOpts {
                    container_id: "c1".to_string(),
                    bundle,
                    dir: state_dir.clone(),
                    state: ProcessState {
                        process: ProcessSpec::default(),
                        exec: false,
                        stdin: stdio.stdin.clone(),
                        stdout: stdio.stdout.clone(),
                        stderr: stdio.stderr.clone(),
                        runtime_args: vec![],
                        no_pivot_root: false,
                        checkpoint: String::new(),
                        root_uid: 0,
                        root_gid: 0,
                    },
                },
                &CancellationToken::new(),
            )
            .await?;
        Ok(Process::spawned(
            ProcessOpts {
                id: "init".to_string(),
                container_id: "c1".to_string(),
                exec: false,
                stdio,
                dir: state_dir,
                checkpoints,
            },
            spawned,
        ))
    }

    async fn wait(process: &Process) -> Result<u32> {
        process
            .wait()
            .with_timeout(Duration::from_secs(10))
            .await
            .expect("wait did not return")
    }

    #[tokio::test]
    async fn test_signal_and_wait() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let process = spawn(dir.path(), FakeShim::Normal, InFlight::default()).await?;
        assert_eq!(process.status(), ProcessStatus::Created);
        process.mark_running();
        assert_eq!(process.status(), ProcessStatus::Running);

        process.signal(Signal::SIGTERM)?;
        assert_eq!(wait(&process).await?, 143);
        assert_eq!(process.status(), ProcessStatus::Stopped);
        assert_eq!(process.exit_code(), Some(143));

        // the process is gone, signaling it must not hit whatever reuses the pid
        assert!(matches!(
            process.signal(Signal::SIGKILL),
            Err(Error::ProcessNotFound(_))
        ));
        assert!(process.close_stdin().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_slow_shim() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let process = spawn(dir.path(), FakeShim::SlowExit, InFlight::default()).await?;

        process.signal(Signal::SIGTERM)?;
        assert_eq!(wait(&process).await?, 143);
        assert_ne!(process.exited().try_wait(), Some(ExitSource::PidFd));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_waiters() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let process = spawn(dir.path(), FakeShim::Normal, InFlight::default()).await?;

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let process = process.clone();
                tokio::spawn(async move { wait(&process).await })
            })
            .collect();

        process.signal(Signal::SIGKILL)?;
        for waiter in waiters {
            assert_eq!(waiter.await??, 137);
        }
        // every waiter returned after the exit status hit the disk
        assert_eq!(read_exit_status(process.dir())?, 137);
        Ok(())
    }

    #[tokio::test]
    async fn test_shim_dies_after_pid() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let process = spawn(dir.path(), FakeShim::DiesAfterPid, InFlight::default()).await?;
        assert!(process.identity().is_alive());

        assert_eq!(wait(&process).await?, 137);
        assert_eq!(read_exit_status(process.dir())?, 137);
        Ok(())
    }

    #[tokio::test]
    async fn test_shim_dies_during_checkpoint() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let checkpoints = InFlight::default();
        let process = spawn(dir.path(), FakeShim::DiesAfterPid, checkpoints.clone()).await?;

        let guard = checkpoints.enter();
        let err = wait(&process).await.unwrap_err();
        assert!(matches!(err, Error::IndeterminateExit(_)), "{err}");
        assert!(process.identity().is_alive());
        drop(guard);

        assert_eq!(wait(&process).await?, 137);
        Ok(())
    }

    #[tokio::test]
    async fn test_resize_and_close_stdin() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let process = spawn(dir.path(), FakeShim::Normal, InFlight::default()).await?;
        process.resize(80, 24)?;
        process.close_stdin()?;

        assert!(matches!(process.remove(), Err(Error::FailedPrecondition(_))));
        process.signal(Signal::SIGKILL)?;
        wait(&process).await?;
        process.remove()?;
        assert!(!process.dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_loaded_stopped_process() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let process = spawn(dir.path(), FakeShim::Normal, InFlight::default()).await?;
        process.signal(Signal::SIGKILL)?;
        wait(&process).await?;

        let loaded = ShimDriver::load_process(process.dir())?;
        assert_eq!(loaded.status, ProcessStatus::Stopped);
        let status = loaded.status;
        let recovered = Process::loaded(
            ProcessOpts {
                id: "init".to_string(),
                container_id: "c1".to_string(),
                exec: false,
                stdio: Stdio::null(),
                dir: process.dir().to_path_buf(),
                checkpoints: InFlight::default(),
            },
            loaded,
            status,
            &testing::monitor(),
        );
        assert_eq!(recovered.exited().try_wait(), Some(ExitSource::Recovered));
        assert_eq!(wait(&recovered).await?, 137);
        Ok(())
    }

    #[tokio::test]
    async fn test_process_handle() -> anyhow::Result<()> {
        async fn kill_and_wait(handle: &impl ProcessHandle) -> Result<u32> {
            handle.signal(Signal::SIGUSR1)?;
            handle.wait().await
        }

        let dir = tempdir()?;
        let process = spawn(dir.path(), FakeShim::Normal, InFlight::default()).await?;
        assert_eq!(ProcessHandle::id(process.as_ref()), "init");
        assert_eq!(kill_and_wait(process.as_ref()).await?, 138);
        Ok(())
    }
}
