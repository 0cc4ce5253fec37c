//! Graceful shutdown handling.
//!
//! A single broadcast signal reaches the HTTP server and every live
//! connection. Connections cancel their decode workers when it fires; the
//! process then waits a bounded grace period for them to drain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Handle for managing graceful shutdown.
#[derive(Debug, Clone)]
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    /// Set before the broadcast so late subscribers can still see it.
    fired: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Get a receiver for shutdown signals.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.fired.store(true, Ordering::SeqCst);
        if self.shutdown_tx.send(()).is_err() {
            debug!("No shutdown subscribers");
        }
    }

    /// Resolves once a shutdown has been triggered, including one triggered
    /// before this call.
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        if self.is_triggered() {
            return;
        }
        match rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }

    /// Trigger shutdown on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) {
        let handle = self.clone();

        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    error!(error = %e, "Failed to install Ctrl+C handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C signal"),
                _ = terminate => info!("Received SIGTERM signal"),
            }
            handle.shutdown();
        });
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until `active` drops to zero or `grace_period` elapses.
///
/// Returns the number of sessions still running when the wait ended.
pub async fn drain_sessions(active: Arc<AtomicUsize>, grace_period: Duration) -> usize {
    let start = Instant::now();
    loop {
        let remaining = active.load(Ordering::SeqCst);
        if remaining == 0 {
            info!("All sessions drained");
            return 0;
        }
        if start.elapsed() >= grace_period {
            warn!(
                remaining,
                grace_ms = grace_period.as_millis() as u64,
                "Grace period exceeded with sessions still active"
            );
            return remaining;
        }
        debug!(remaining, "Waiting for sessions to finish");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
