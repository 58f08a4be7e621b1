/*!
 * @file shutdown.rs
 * @brief Process-wide shutdown broadcast and signal handling
 */

use tokio::sync::broadcast;
use tracing::{info, warn};

/// Fans the shutdown decision out to the listener, the connection handlers
/// and the background tasks. The first SIGTERM/SIGINT broadcasts; a second
/// one terminates the process immediately.
pub struct ShutdownManager {
    tx: broadcast::Sender<()>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    pub fn install_signal_handlers(&self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("failed to register SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
                _ = sigint.recv() => info!("received SIGINT, starting graceful shutdown"),
            }
            let _ = tx.send(());

            tokio::select! {
                _ = sigterm.recv() => {},
                _ = sigint.recv() => {},
            }
            warn!("second shutdown signal received, terminating immediately");
            std::process::exit(130);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_all_subscribers() {
        let manager = ShutdownManager::new();
        let mut a = manager.subscribe();
        let mut b = manager.subscribe();
        manager.trigger();
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
