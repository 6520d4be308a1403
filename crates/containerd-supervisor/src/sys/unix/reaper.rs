//! Subreaper setup, the SIGCHLD reap loop, and the exit-event monitor fed by it.
//!
//! Once [`init`] has run, this process collects the exit status of *every* child and of every
//! orphaned descendant reparented to it. Nothing else in the process may call `wait` on its
//! children, so all spawning goes through [`Monitor`], which subscribes to exit events before
//! forking and hands the caller a [`Subscription`] to wait on.

use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read as _};
use std::os::fd::OwnedFd;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::sandbox::{Error, Result};

static REAPER: OnceLock<Monitor> = OnceLock::new();

/// A child process that was reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: i32,
    /// Exit code, or `128 + signal` when the process was killed by a signal.
    pub code: i32,
    pub signal: Option<Signal>,
}

impl ExitEvent {
    fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(pid, code) => Some(Self {
                pid: pid.as_raw(),
                code,
                signal: None,
            }),
            WaitStatus::Signaled(pid, signal, _) => Some(Self {
                pid: pid.as_raw(),
                code: 128 + signal as i32,
                signal: Some(signal),
            }),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl std::fmt::Display for ExitEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.signal {
            Some(signal) => write!(f, "signal: {signal}"),
            None => write!(f, "exit status {}", self.code),
        }
    }
}

/// Marks this process as the subreaper for its descendants and starts the reap loop.
///
/// This must be called exactly once, before anything is spawned. A second call fails with
/// [`Error::FailedPrecondition`]; use [`monitor`] to get hold of the running instance.
pub fn init() -> Result<Monitor> {
    let mut fresh = false;
    let monitor = REAPER.get_or_init(|| {
        fresh = true;
        start()
    });
    if !fresh {
        return Err(Error::FailedPrecondition(
            "the reaper is already initialized".to_string(),
        ));
    }
    Ok(monitor.clone())
}

/// The monitor started by [`init`], if any.
pub fn monitor() -> Option<Monitor> {
    REAPER.get().cloned()
}

fn start() -> Monitor {
    if let Err(err) = nix::sys::prctl::set_child_subreaper(true) {
        log::error!("failed to become a subreaper: {err}");
    }

    let monitor = Monitor::default();
    let reaper = monitor.clone();

    // The reap loop outlives any runtime the caller may tear down, so it gets its own.
    let spawned = std::thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    log::error!("failed to start the reaper runtime: {err}");
                    return;
                }
            };
            rt.block_on(reap_loop(reaper));
        });

    if let Err(err) = spawned {
        log::error!("failed to spawn the reaper thread: {err}");
    }

    monitor
}

async fn reap_loop(monitor: Monitor) {
    let mut sigchld = match signal(SignalKind::child()) {
        Ok(sigchld) => sigchld,
        Err(err) => {
            log::error!("failed to register for SIGCHLD: {err}");
            return;
        }
    };

    loop {
        // pending SIGCHLDs coalesce, so drain everything that is reapable
        for event in reap_children() {
            log::debug!("reaped pid {} ({event})", event.pid);
            monitor.notify(event);
        }
        if sigchld.recv().await.is_none() {
            log::error!("SIGCHLD stream closed, reap loop exiting");
            return;
        }
    }
}

fn reap_children() -> Vec<ExitEvent> {
    let mut events = vec![];
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(status) => events.extend(ExitEvent::from_wait_status(status)),
            Err(Errno::EINTR) => continue,
            Err(err) => {
                log::error!("wait4 failed: {err}");
                break;
            }
        }
    }
    events
}

/// Fans reaped exit events out to every live [`Subscription`].
#[derive(Clone, Default)]
pub struct Monitor {
    inner: Arc<MonitorImpl>,
}

#[derive(Default)]
struct MonitorImpl {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, UnboundedSender<ExitEvent>>>,
}

impl Monitor {
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        self.subscribers().insert(id, tx);
        Subscription {
            id,
            rx,
            monitor: self.clone(),
        }
    }

    fn notify(&self, event: ExitEvent) {
        self.subscribers()
            .retain(|_, tx| tx.send(event).is_ok());
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, UnboundedSender<ExitEvent>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns `cmd` and returns its pid together with a subscription taken before the fork.
    /// The command is consumed so that any pipe ends it holds are closed in this process.
    ///
    /// The program is looked up first. When std falls back to fork and exec, a failed exec
    /// makes it wait on the child, and the reap loop may already have collected it.
    pub fn spawn(&self, mut cmd: Command) -> std::io::Result<(i32, Subscription)> {
        if let Err(err) = which::which(cmd.get_program()) {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{}: {err}", cmd.get_program().to_string_lossy()),
            ));
        }
        let subscription = self.subscribe();
        let child = cmd.spawn()?;
        // the reap loop owns the exit status; never call wait on `child`
        Ok((child.id() as i32, subscription))
    }

    /// Runs `cmd` to completion.
    pub async fn status(&self, cmd: Command) -> std::io::Result<ExitEvent> {
        let (pid, mut subscription) = self.spawn(cmd)?;
        subscription.wait_for(pid).await.ok_or_else(closed)
    }

    /// Runs `cmd` to completion capturing stdout and stderr into a single buffer.
    pub async fn output(&self, mut cmd: Command) -> std::io::Result<(ExitEvent, Vec<u8>)> {
        let (reader, writer) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        let writer_err: OwnedFd = writer.try_clone()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err));

        let (pid, mut subscription) = self.spawn(cmd)?;

        let read = tokio::task::spawn_blocking(move || {
            let mut buf = vec![];
            File::from(reader).read_to_end(&mut buf).map(|_| buf)
        });

        let (event, output) = tokio::join!(subscription.wait_for(pid), read);
        let output = output.map_err(std::io::Error::other)??;
        Ok((event.ok_or_else(closed)?, output))
    }
}

fn closed() -> std::io::Error {
    std::io::Error::other("the reaper stopped delivering exit events")
}

/// A stream of every exit event reaped after it was created.
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<ExitEvent>,
    monitor: Monitor,
}

impl Subscription {
    /// Waits until `pid` is reaped. Events for other pids are discarded.
    /// Cancel safe.
    pub async fn wait_for(&mut self, pid: i32) -> Option<ExitEvent> {
        self.wait_any(&[pid]).await
    }

    /// Waits until any of `pids` is reaped.
    pub async fn wait_any(&mut self, pids: &[i32]) -> Option<ExitEvent> {
        while let Some(event) = self.rx.recv().await {
            if pids.contains(&event.pid) {
                return Some(event);
            }
        }
        None
    }

    /// Returns an already delivered exit of `pid` without waiting.
    pub fn try_wait_for(&mut self, pid: i32) -> Option<ExitEvent> {
        while let Ok(event) = self.rx.try_recv() {
            if event.pid == pid {
                return Some(event);
            }
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.monitor.subscribers().remove(&self.id);
    }
}
