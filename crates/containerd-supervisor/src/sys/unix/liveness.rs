//! Pid-reuse safe liveness checks.
//!
//! A pid alone does not identify a process across supervisor restarts: the kernel recycles
//! pids. A process is identified by its pid together with the start time the kernel reports
//! for it (field 22 of `/proc/<pid>/stat`), recorded when the process was first observed.

use std::io::ErrorKind;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// The bits of the process table the liveness check needs.
pub trait ProcessTable {
    /// Sends signal 0 to `pid`.
    fn probe(&self, pid: i32) -> nix::Result<()>;
    /// The kernel-reported start time of `pid`, as an opaque string.
    fn start_time(&self, pid: i32) -> std::io::Result<String>;
}

/// The host's process table, read through `kill(2)` and procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Host;

impl ProcessTable for Host {
    fn probe(&self, pid: i32) -> nix::Result<()> {
        kill(Pid::from_raw(pid), None)
    }

    fn start_time(&self, pid: i32) -> std::io::Result<String> {
        let stat = procfs::process::Process::new(pid)
            .and_then(|process| process.stat())
            .map_err(|err| match err {
                procfs::ProcError::NotFound(_) => {
                    std::io::Error::new(ErrorKind::NotFound, format!("pid {pid} not found"))
                }
                procfs::ProcError::Io(err, _) => err,
                err => std::io::Error::other(err),
            })?;
        Ok(stat.starttime.to_string())
    }
}

/// Reports whether `pid` still refers to the process that was recorded with `start_time`.
pub fn is_alive(table: &impl ProcessTable, pid: i32, start_time: &str) -> bool {
    match table.probe(pid) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return false,
        Err(err) => {
            log::warn!("probing pid {pid} failed, assuming it is gone: {err}");
            return false;
        }
    }

    match table.start_time(pid) {
        Ok(current) => current == start_time,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            log::warn!("reading the start time of pid {pid} failed, assuming it is gone: {err}");
            false
        }
    }
}

/// The external reference to a supervised process: compared, never closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: i32,
    pub start_time: String,
}

impl ProcessIdentity {
    pub fn is_alive(&self) -> bool {
        is_alive(&Host, self.pid, &self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;

    /// A process table where pids can be handed out again with a new start time.
    #[derive(Default)]
    struct FakeTable {
        clock: RefCell<u64>,
        processes: RefCell<HashMap<i32, u64>>,
        probe_error: Option<Errno>,
    }

    impl FakeTable {
        fn spawn(&self, pid: i32) -> String {
            let mut clock = self.clock.borrow_mut();
            *clock += 1;
            self.processes.borrow_mut().insert(pid, *clock);
            clock.to_string()
        }

        fn exit(&self, pid: i32) {
            self.processes.borrow_mut().remove(&pid);
        }
    }

    impl ProcessTable for FakeTable {
        fn probe(&self, pid: i32) -> nix::Result<()> {
            if let Some(err) = self.probe_error {
                return Err(err);
            }
            match self.processes.borrow().contains_key(&pid) {
                true => Ok(()),
                false => Err(Errno::ESRCH),
            }
        }

        fn start_time(&self, pid: i32) -> std::io::Result<String> {
            self.processes
                .borrow()
                .get(&pid)
                .map(|t| t.to_string())
                .ok_or_else(|| ErrorKind::NotFound.into())
        }
    }

    #[test]
    fn test_alive() {
        let table = FakeTable::default();
        let start = table.spawn(100);
        assert!(is_alive(&table, 100, &start));
    }

    #[test]
    fn test_exited() {
        let table = FakeTable::default();
        let start = table.spawn(100);
        table.exit(100);
        assert!(!is_alive(&table, 100, &start));
    }

    #[test]
    fn test_pid_reused() {
        let table = FakeTable::default();
        let start = table.spawn(100);
        table.exit(100);
        let reused = table.spawn(100);
        assert_ne!(start, reused);
        assert!(!is_alive(&table, 100, &start));
        assert!(is_alive(&table, 100, &reused));
    }

    #[test]
    fn test_probe_error_is_not_alive() {
        let mut table = FakeTable::default();
        let start = table.spawn(100);
        table.probe_error = Some(Errno::EPERM);
        assert!(!is_alive(&table, 100, &start));
    }

    #[test]
    fn test_host_self() -> anyhow::Result<()> {
        let pid = std::process::id() as i32;
        let start = Host.start_time(pid)?;
        assert!(is_alive(&Host, pid, &start));
        assert!(!is_alive(&Host, pid, "0"));
        Ok(())
    }

    #[test]
    fn test_host_missing() {
        // pid_max is at most 2^22
        let err = Host.start_time(i32::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
