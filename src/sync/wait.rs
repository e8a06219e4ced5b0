//! Wait Group with Timeout
//!
//! A scoped counter in the spirit of a wait group, with one addition: waiting
//! can carry a deadline. Connections count their in-flight writes with it so
//! that close can drain pending sends without hanging forever, and the TCP
//! server counts live connection tasks with it during shutdown.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// An awaitable counter that releases waiters when it reaches zero.
#[derive(Debug, Default)]
pub struct Wait {
    count: AtomicI32,
    notify: Notify,
}

impl Wait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` (which may be negative) to the counter.
    pub fn add(&self, delta: i32) {
        if self.count.fetch_add(delta, Ordering::AcqRel) + delta <= 0 {
            self.notify.notify_waiters();
        }
    }

    /// Decrements the counter by one.
    pub fn done(&self) {
        self.add(-1);
    }

    /// Current counter value.
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    /// Waits until the counter reaches zero.
    pub async fn wait(&self) {
        loop {
            if self.count() <= 0 {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering so a release between the first
            // check and registration is not missed.
            if self.count() <= 0 {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the counter reaches zero or `timeout` elapses.
    ///
    /// Returns `true` if the deadline was hit with the counter still
    /// non-zero.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_on_zero_returns_immediately() {
        let wait = Wait::new();
        assert!(!wait.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_done() {
        let wait = Arc::new(Wait::new());
        wait.add(2);

        let waiter = Arc::clone(&wait);
        let handle = tokio::spawn(async move { waiter.wait().await });

        wait.done();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        wait.done();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should be released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_timeout_reports_deadline() {
        let wait = Wait::new();
        wait.add(1);
        assert!(wait.wait_timeout(Duration::from_millis(20)).await);
        wait.done();
        assert!(!wait.wait_timeout(Duration::from_millis(20)).await);
    }
}
