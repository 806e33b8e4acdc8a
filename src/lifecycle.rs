//! Lifecycle Manager - connect before serving, disconnect before exiting.
//!
//! Services register with a [`Lifecycle`] in dependency order. `start` brings
//! them up in that order; `shutdown` takes them down in reverse, bounded by a
//! grace period. Once shutdown begins the shared [`CancellationToken`] is
//! cancelled, so serving loops stop accepting new work.
//!
//! ## Example
//!
//! ```ignore
//! let lifecycle = Lifecycle::new(Duration::from_secs(10))
//!     .with_service(publisher.clone())
//!     .with_service(mailer);
//!
//! lifecycle
//!     .run_until(|token| async move { serve_http(token).await })
//!     .await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DEFAULT_SHUTDOWN_GRACE;
use crate::error::BusError;

/// Something with a connection that must be opened before use and closed before exit.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Stable name for logs and shutdown reports.
    fn name(&self) -> &str;

    /// Establish connections and begin work.
    async fn start(&self) -> Result<(), BusError>;

    /// Finish in-flight work and release connections.
    async fn stop(&self) -> Result<(), BusError>;
}

/// Coordinates startup and graceful shutdown of a process's services.
pub struct Lifecycle {
    grace: Duration,
    services: Vec<Arc<dyn Service>>,
    /// Services that started successfully, in start order
    started: Mutex<Vec<Arc<dyn Service>>>,
    token: CancellationToken,
    shutting_down: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_GRACE)
    }
}

impl Lifecycle {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            services: Vec::new(),
            started: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register a service. Services start in registration order and stop in reverse.
    pub fn with_service<S: Service>(mut self, service: Arc<S>) -> Self {
        self.services.push(service);
        self
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start every service in order.
    ///
    /// If one fails, those already started are stopped again (in reverse)
    /// and the failure is returned.
    pub async fn start(&self) -> Result<(), BusError> {
        for service in &self.services {
            if self.is_shutting_down() {
                return Err(BusError::ShuttingDown(service.name().to_string()));
            }
            info!(service = service.name(), "Starting");
            match service.start().await {
                Ok(()) => self.started.lock().push(service.clone()),
                Err(e) => {
                    error!(service = service.name(), error = %e, "Start failed");
                    let started: Vec<_> = self.started.lock().drain(..).collect();
                    for running in started.iter().rev() {
                        if let Err(stop_err) = running.stop().await {
                            warn!(service = running.name(), error = %stop_err, "Stop after failed start failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        info!(services = self.services.len(), "All services started");
        Ok(())
    }

    /// Start everything, drive `serve` until it finishes, a termination
    /// signal arrives or the token is cancelled, then shut down.
    ///
    /// `serve` receives the lifecycle's token and is expected to wind down
    /// once it is cancelled. Returns what `serve` produced, or `None` if it
    /// did not finish within the grace period.
    pub async fn run_until<F, Fut, T>(&self, serve: F) -> Result<Option<T>, BusError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        self.start().await?;

        let serving = serve(self.token.clone());
        tokio::pin!(serving);

        let mut stuck = Vec::new();
        let (output, deadline) = tokio::select! {
            output = &mut serving => (Some(output), Instant::now() + self.grace),
            _ = shutdown_requested(&self.token) => {
                let deadline = Instant::now() + self.grace;
                self.begin_shutdown();
                match tokio::time::timeout_at(deadline, &mut serving).await {
                    Ok(output) => (Some(output), deadline),
                    Err(_) => {
                        warn!("Serving did not wind down within the grace period");
                        stuck.push("serve".to_string());
                        (None, deadline)
                    }
                }
            }
        };

        self.shutdown_by(deadline, stuck).await?;
        Ok(output)
    }

    /// Stop every started service in reverse order within the grace period.
    ///
    /// Calling it again after a completed shutdown does nothing.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        self.shutdown_by(Instant::now() + self.grace, Vec::new()).await
    }

    fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!(grace = ?self.grace, "Shutdown started");
        }
        self.token.cancel();
    }

    async fn shutdown_by(&self, deadline: Instant, mut stuck: Vec<String>) -> Result<(), BusError> {
        self.begin_shutdown();

        let started: Vec<_> = self.started.lock().drain(..).collect();
        let remaining = Mutex::new(
            started
                .iter()
                .map(|s| s.name().to_string())
                .collect::<Vec<_>>(),
        );

        let stop_all = async {
            for service in started.iter().rev() {
                match service.stop().await {
                    Ok(()) => info!(service = service.name(), "Stopped"),
                    Err(e) => error!(service = service.name(), error = %e, "Stop failed"),
                }
                remaining.lock().retain(|name| name != service.name());
            }
        };

        if tokio::time::timeout_at(deadline, stop_all).await.is_err() {
            stuck.extend(remaining.lock().drain(..));
        }

        if stuck.is_empty() {
            info!("All services stopped within grace period");
            Ok(())
        } else {
            error!(stuck = ?stuck, grace = ?self.grace, "Grace period exceeded");
            Err(BusError::ShutdownTimeout {
                grace: self.grace,
                stuck,
            })
        }
    }
}

async fn shutdown_requested(token: &CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        result = wait_for_shutdown_signal() => {
            match result {
                Ok(()) => info!("Termination signal received"),
                Err(e) => {
                    error!(error = %e, "Signal handlers could not be installed; waiting for cancellation");
                    token.cancelled().await;
                }
            }
        }
    }
}

/// Wait for SIGINT, SIGTERM, SIGQUIT or Ctrl-C.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Process exit code for a shutdown result: 0 when clean, 1 otherwise.
pub fn exit_code(result: &Result<(), BusError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
