//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every consumer task. Once triggered,
//! by Ctrl-C, SIGTERM or [`ShutdownSignal::trigger`], consumers finish the
//! batch in hand and stop receiving.
//!
//! # Example
//!
//! ```rust,ignore
//! use shutter::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let worker_shutdown = shutdown.clone();
//!
//! tokio::spawn(async move {
//!     loop {
//!         tokio::select! {
//!             _ = worker_shutdown.cancelled() => break,
//!             // ... receive and process
//!         }
//!     }
//! });
//!
//! shutdown.wait().await;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Default shutdown timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A cloneable, level-triggered shutdown flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    /// How long the runner waits for consumers after shutdown starts
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGTERM or Ctrl-C, then trigger shutdown.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
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
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.cancelled() => return,
        }

        self.sender.send_replace(true);
    }

    /// Receiver that observes the flag flipping to `true`.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Trigger shutdown manually (tests, programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.sender.send_replace(true);
    }

    /// Resolves once shutdown has been triggered, immediately if it already was.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
