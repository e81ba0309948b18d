//! Graceful Shutdown Handling
//!
//! SIGTERM/SIGINT/Ctrl-C are broadcast to the accept loops, which stop
//! taking new connections; open sessions get a bounded time to drain.

use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::Result;

pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Receiver that fires once shutdown starts
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Start shutdown without waiting for a signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown triggered with no listeners");
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl-C, then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
                _ = signal::ctrl_c() => info!("Received Ctrl+C, initiating graceful shutdown"),
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Poll `active` until it reaches zero or the shutdown timeout passes.
    /// Returns the count still open when giving up.
    pub async fn drain<F>(&self, active: F) -> usize
    where
        F: Fn() -> usize,
    {
        let start = Instant::now();
        let mut last = active();
        if last > 0 {
            info!("Waiting for {} active sessions to close (timeout: {:?})", last, self.timeout);
        }

        while last > 0 && start.elapsed() < self.timeout {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let current = active();
            if current != last {
                debug!("Active sessions: {} -> {}", last, current);
                last = current;
            }
        }

        if last == 0 {
            info!("All sessions closed in {:?}", start.elapsed());
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} sessions still active",
                start.elapsed(),
                last
            );
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut a = coordinator.subscribe();
        let mut b = coordinator.subscribe();
        coordinator.trigger();
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_waits_for_sessions() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(2));

        let closer = active.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            closer.store(0, Ordering::SeqCst);
        });

        let left = coordinator.drain(|| active.load(Ordering::SeqCst)).await;
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_timeout() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(200));
        let left = coordinator.drain(|| 3).await;
        assert_eq!(left, 3);
    }
}
