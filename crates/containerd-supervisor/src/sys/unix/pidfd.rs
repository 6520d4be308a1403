use std::fs::File;
use std::os::fd::{FromRawFd, RawFd};

use tokio::io::unix::AsyncFd;

/// A pidfd for a process that is not necessarily our child.
/// It becomes readable once the process has exited.
pub struct PidFd {
    pid: i32,
    fd: AsyncFd<File>,
}

impl PidFd {
    pub fn new(pid: i32) -> std::io::Result<Self> {
        use libc::{PIDFD_NONBLOCK, SYS_pidfd_open, syscall};
        let pidfd = unsafe { syscall(SYS_pidfd_open, pid, PIDFD_NONBLOCK) };
        if pidfd == -1 {
            return Err(std::io::Error::last_os_error());
        }
        let fd = AsyncFd::new(unsafe { File::from_raw_fd(pidfd as RawFd) })?;
        Ok(Self { pid, fd })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Resolves once the process has exited. Reaping is left to whoever is its parent.
    pub async fn exited(&self) -> std::io::Result<()> {
        let _ = self.fd.readable().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::time::Duration;

    use super::*;
    use crate::sandbox::testing;
    use crate::sandbox::utils::WithTimeout as _;

    #[tokio::test]
    async fn test_exited() -> anyhow::Result<()> {
        let monitor = testing::monitor();
        let mut cmd = Command::new("sleep");
        cmd.arg("0.5");
        let (pid, _subscription) = monitor.spawn(cmd)?;

        let pidfd = PidFd::new(pid)?;
        assert_eq!(pidfd.pid(), pid);
        let res = pidfd.exited().with_timeout(Duration::from_secs(10)).await;
        assert!(matches!(res, Some(Ok(()))));
        Ok(())
    }

    #[tokio::test]
    async fn test_running() -> anyhow::Result<()> {
        let pidfd = PidFd::new(std::process::id() as i32)?;
        let res = pidfd.exited().with_timeout(Duration::from_millis(10)).await;
        assert!(res.is_none());
        Ok(())
    }
}
