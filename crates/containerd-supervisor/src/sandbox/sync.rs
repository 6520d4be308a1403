use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;

/// What told the supervisor that a process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSource {
    /// The shim closed its end of the `exit` fifo.
    Fifo,
    /// The reap loop collected the shim or the container process.
    Reaped,
    /// The container's pidfd became readable.
    PidFd,
    /// The process was already gone when its state was loaded from disk.
    Recovered,
    /// The monitoring task went away without observing an exit.
    Aborted,
}

/// A latch that is closed exactly once, by whichever exit notification fires first.
///
/// Waiters are woken when the latch closes and observe the source that closed it.
/// Later calls to [`ExitLatch::close`] are no-ops.
#[derive(Clone, Default)]
pub struct ExitLatch {
    inner: Arc<ExitLatchImpl>,
}

#[derive(Default)]
struct ExitLatchImpl {
    notify: Notify,
    source: OnceLock<ExitSource>,
}

impl ExitLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the latch. Returns `false` if it was already closed.
    pub fn close(&self, source: ExitSource) -> bool {
        let closed = self.inner.source.set(source).is_ok();
        if closed {
            self.inner.notify.notify_waiters();
        }
        closed
    }

    /// Returns a guard that closes the latch with `source` when dropped,
    /// unless something else closed it first. Also fires on unwind.
    pub fn close_guard(&self, source: ExitSource) -> impl Drop + use<> {
        CloseGuard {
            latch: self.clone(),
            source,
        }
    }

    pub async fn wait(&self) -> ExitSource {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent close can't slip in between
            notified.as_mut().enable();
            if let Some(source) = self.inner.source.get() {
                return *source;
            }
            notified.await;
        }
    }

    pub fn try_wait(&self) -> Option<ExitSource> {
        self.inner.source.get().copied()
    }

    /// Returns None if the latch is still open after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ExitSource> {
        if timeout.is_zero() {
            self.try_wait()
        } else {
            tokio::time::timeout(timeout, self.wait()).await.ok()
        }
    }
}

struct CloseGuard {
    latch: ExitLatch,
    source: ExitSource,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.latch.close(self.source);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{ExitLatch, ExitSource};

    #[tokio::test]
    async fn basic() {
        let latch = ExitLatch::new();
        assert!(latch.close(ExitSource::Fifo));
        assert_eq!(ExitSource::Fifo, latch.wait().await);
    }

    #[tokio::test]
    async fn first_close_wins() {
        let latch = ExitLatch::new();
        assert!(latch.close(ExitSource::Reaped));
        assert!(!latch.close(ExitSource::Fifo));
        assert_eq!(Some(ExitSource::Reaped), latch.try_wait());
    }

    #[tokio::test]
    async fn open_timeout() {
        let latch = ExitLatch::new();
        assert_eq!(None, latch.wait_timeout(Duration::ZERO).await);
        assert_eq!(None, latch.wait_timeout(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn many_waiters() {
        let latch = ExitLatch::new();
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let latch = latch.clone();
                tokio::spawn(async move { latch.wait().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(1)).await;
        latch.close(ExitSource::Fifo);
        for waiter in waiters {
            assert_eq!(ExitSource::Fifo, waiter.await.unwrap());
        }
    }

    #[tokio::test]
    async fn guard() {
        let latch = ExitLatch::new();
        {
            let _guard = latch.close_guard(ExitSource::Aborted);
        }
        assert_eq!(ExitSource::Aborted, latch.wait().await);
    }

    #[tokio::test]
    async fn guard_no_op() {
        let latch = ExitLatch::new();
        {
            let _guard = latch.close_guard(ExitSource::Aborted);
            latch.close(ExitSource::Reaped);
        }
        assert_eq!(ExitSource::Reaped, latch.wait().await);
    }
}
