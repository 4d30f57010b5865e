//! Shared shutdown signal for the daemon's tasks.
//!
//! The accept loop, every connection handler and the background sweep hold a
//! `ShutdownListener`. Triggering the signal once stops all of them.
//!
//! # Example
//!
//! ```
//! use editor_registry::shutdown::ShutdownSignal;
//!
//! let signal = ShutdownSignal::new();
//! let listener = signal.subscribe();
//!
//! signal.trigger();
//! assert!(listener.is_triggered());
//! ```

use std::sync::Arc;
use tokio::sync::watch;

/// Owner side of the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request shutdown. Calling this more than once has no further effect.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving side; resolves `wait` once shutdown has been requested.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until shutdown is requested.
    ///
    /// Returns immediately if it already was, including before this listener
    /// was created.
    pub async fn wait(&mut self) {
        // An error means every sender is gone, which is as final as a trigger.
        let _ = self.receiver.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_signal_not_triggered() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(!signal.subscribe().is_triggered());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut late = signal.subscribe();
        tokio::time::timeout(Duration::from_secs(1), late.wait())
            .await
            .expect("listener created after trigger must not block");
    }

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let mut listener = signal.subscribe();
            waiters.push(tokio::spawn(async move { listener.wait().await }));
        }

        signal.clone().trigger();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_dropped_signal_releases_waiters() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();
        drop(signal);
        tokio::time::timeout(Duration::from_secs(1), listener.wait())
            .await
            .unwrap();
    }
}
