//! Graceful shutdown handling.
//!
//! Listens for SIGTERM and SIGINT signals and coordinates shutdown.

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

/// Shutdown coordinator.
///
/// A one-shot closable signal: the owner triggers it once, every subscriber
/// holds a read-only handle.
pub struct ShutdownHandler {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownHandler {
    /// Create a new shutdown handler.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Get a receiver for shutdown signals.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }

    /// Trigger a shutdown. Idempotent.
    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for a shutdown signal (SIGTERM or SIGINT).
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let mut stop = self.subscribe();

        tokio::select! {
            _ = ctrl_c => {
                info!(signal = "SIGINT", "terminating due to caught signal");
            }
            _ = terminate => {
                info!(signal = "SIGTERM", "terminating due to caught signal");
            }
            _ = stop.changed() => {
                info!("stop signal closed");
            }
        }

        self.trigger();
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_handler() {
        let handler = ShutdownHandler::new();
        let mut receiver = handler.subscribe();

        // Initially not shutdown
        assert!(!*receiver.borrow());
        assert!(!handler.is_triggered());

        // Trigger shutdown
        handler.trigger();

        // Should be marked as shutdown
        receiver.changed().await.unwrap();
        assert!(*receiver.borrow());
        assert!(handler.is_triggered());
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let handler = ShutdownHandler::new();
        let mut rx1 = handler.subscribe();
        let mut rx2 = handler.subscribe();

        handler.trigger();

        rx1.changed().await.unwrap();
        rx2.changed().await.unwrap();

        assert!(*rx1.borrow());
        assert!(*rx2.borrow());
    }

    #[tokio::test]
    async fn test_trigger_multiple_times() {
        let handler = ShutdownHandler::new();
        let mut receiver = handler.subscribe();

        // Trigger multiple times - should be idempotent
        handler.trigger();
        handler.trigger();
        handler.trigger();

        receiver.changed().await.unwrap();
        assert!(*receiver.borrow());
    }

    #[tokio::test]
    async fn test_subscribe_before_and_after_trigger() {
        let handler = ShutdownHandler::new();

        let mut rx_before = handler.subscribe();
        assert!(!*rx_before.borrow());

        handler.trigger();

        let rx_after = handler.subscribe();
        assert!(*rx_after.borrow());

        rx_before.changed().await.unwrap();
        assert!(*rx_before.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_signal_returns_on_trigger() {
        let handler = ShutdownHandler::new();
        handler.trigger();

        // An already-triggered handler must not block on OS signals.
        tokio::time::timeout(std::time::Duration::from_secs(1), handler.wait_for_signal())
            .await
            .unwrap();
    }
}
