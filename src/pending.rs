//! Pending-work accounting for in-flight feedback messages.
//!
//! The consumer increments the counter before publishing a message and the
//! component that finishes with the message decrements it exactly once.
//! Graceful shutdown waits for the counter to reach zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

/// Shared counter of messages read from the queue but not yet fully
/// processed.
#[derive(Debug, Default)]
pub struct PendingWork {
    count: AtomicUsize,
    notify: Notify,
}

impl PendingWork {
    /// Create a new counter handle starting at zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `n` additional units of in-flight work.
    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Retire one unit of work. Must be called exactly once per `add(1)`.
    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pending-work counter underflow");
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Current number of in-flight units.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until the counter reaches zero.
    pub async fn wait(&self) {
        loop {
            // Arm the notification before checking, so a decrement between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for the counter to reach zero, up to `duration`.
    ///
    /// Returns `true` if the wait timed out. The wait future is dropped on
    /// timeout, so nothing outlives the deadline.
    pub async fn wait_timeout(&self, duration: Duration) -> bool {
        timeout(duration, self.wait()).await.is_err()
    }
}
