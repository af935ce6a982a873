//! One-shot expiry timers.
//!
//! A timer is a spawned task that sleeps and then reports an `Expiry` to the
//! driver. Dropping the `Timer` aborts the task, so clearing a timer and
//! removing the entry that owns it are the same operation.

use crate::protocol::CorrelationKey;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a fired timer refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// A pending request. The ticket identifies the registration, so a stale
    /// expiry never hits a newer entry that reuses the same key.
    Request { key: CorrelationKey, ticket: u64 },
    /// The readiness handshake.
    Handshake,
}

/// Handle to a running expiry timer. Dropping cancels it.
#[derive(Debug)]
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Start a timer that sends `expiry` on `tx` after `after` elapses.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(after: Duration, expiry: Expiry, tx: mpsc::UnboundedSender<Expiry>) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(expiry);
        });
        Self { handle }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_duration() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = tokio::time::Instant::now();
        let _timer = Timer::start(Duration::from_millis(50), Expiry::Handshake, tx);

        let expiry = rx.recv().await.unwrap();
        assert_eq!(expiry, Expiry::Handshake);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = Timer::start(Duration::from_millis(50), Expiry::Handshake, tx);
        drop(timer);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // The aborted task dropped its sender, so the channel is closed and empty.
        assert!(rx.recv().await.is_none());
    }
}
