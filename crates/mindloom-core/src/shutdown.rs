//! Graceful shutdown utilities.
//!
//! Services and background loops (outbox relay, consumers, monitor) share a
//! [`GracefulShutdown`] handle. Triggering it flips a watch channel that
//! every loop selects on; in-flight work is awaited up to a grace period,
//! then cancelled.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::watch;

/// A token that observes shutdown state.
#[derive(Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Check whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until shutdown is requested.
    pub async fn cancelled(&mut self) {
        let _ = self.receiver.wait_for(|v| *v).await;
    }
}

/// Graceful shutdown handle.
pub struct GracefulShutdown {
    grace: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl GracefulShutdown {
    /// Create a handle with the default 30s grace period.
    pub fn new() -> Self {
        Self::with_grace(Duration::from_secs(30))
    }

    /// Create a handle with a custom grace period for draining work.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            grace,
            shutdown_tx: watch::channel(false).0,
        }
    }

    /// The grace period in-flight handlers get before cancellation.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Get a token that observes this handle.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.shutdown_tx.subscribe(),
        }
    }

    /// Request shutdown. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Block until SIGINT or SIGTERM, then request shutdown.
    pub async fn wait_for_signal(&self) {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        self.shutdown();
    }

    /// Spawn a named task that is cancelled when shutdown fires.
    pub fn spawn<F, Fut>(&self, task_name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut token = self.token();
        let task_name = task_name.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = future() => {
                    tracing::debug!(task = %task_name, "task completed");
                }
                _ = token.cancelled() => {
                    tracing::info!(task = %task_name, "task cancelled due to shutdown");
                }
            }
        })
    }

    /// Await `handle` up to the grace period, then abort it.
    pub async fn drain(&self, mut handle: tokio::task::JoinHandle<()>) {
        if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
            tracing::warn!(grace = ?self.grace, "task did not drain within grace period");
            handle.abort();
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared shutdown handle, the form services actually pass around.
pub type SharedShutdown = Arc<GracefulShutdown>;

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to register Ctrl+C handler");
    }
}
