//! Run-level cancellation flag.
//!
//! A thin wrapper around a `tokio::sync::watch` channel holding a `bool`.
//! Clones share the same flag, so the presentation layer can keep one handle
//! while the sequencer and watcher observe another.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cloneable cancellation flag shared between a run and its controller.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    /// Handle in the not-cancelled state.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.sender.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_completes_when_not_cancelled() {
        let cancel = CancelHandle::new();
        assert!(cancel.sleep(Duration::from_millis(10)).await);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let cancel = CancelHandle::new();
        let remote = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.cancel();
        });

        let start = Instant::now();
        assert!(!cancel.sleep(Duration::from_secs(10)).await);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        assert!(!cancel.sleep(Duration::from_secs(10)).await);
    }
}
