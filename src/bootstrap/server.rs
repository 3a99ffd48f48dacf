use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, span, warn, Level};

use crate::config::{Config, ConfigWatcher};
use crate::store::create_storage;
use crate::telemetry::{counters, Metrics, MetricsConfig};

use super::shutdown::{Shutdown, ShutdownState};
use super::state::ServiceState;

/// How often storage readiness is re-checked.
const STORAGE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Main dispatchd server
///
/// Components:
/// - Main task: signal handling, drain orchestration
/// - Admin server: Prometheus metrics, health, readiness, stats
/// - Ingress server: message-request events and vendor webhooks
/// - Config watcher: hot reload of vendor selector weights
/// - Storage poll: keeps the readiness dependency current
pub struct Server {
    /// Configuration
    config: Arc<Config>,

    /// Config file path (for hot reload)
    config_path: PathBuf,

    /// Shutdown state machine
    shutdown: Arc<Shutdown>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        let shutdown = Shutdown::new(config.settings.shutdown.drain_timeout);

        Self {
            config: Arc::new(config),
            config_path,
            shutdown,
        }
    }

    /// Run the server until shutdown
    pub async fn run(self) -> Result<()> {
        let span = span!(Level::INFO, "dispatchd", version = env!("CARGO_PKG_VERSION"));
        let _enter = span.enter();

        info!(
            vendors = self.config.vendors.len(),
            templates = self.config.templates.len(),
            store = ?self.config.store.backend,
            "starting dispatchd server"
        );

        let metrics = Metrics::new(&MetricsConfig {
            address: self.config.admin.address,
        })?;
        counters::init(&metrics.meter("dispatchd"));

        let store = create_storage(&self.config.store).await?;
        let state = Arc::new(ServiceState::new(
            self.config.clone(),
            store,
            metrics.admin_state(),
            self.shutdown.clone(),
        )?);

        let servers = CancellationToken::new();

        let admin_handle = if self.config.admin.metrics || self.config.admin.health {
            let token = servers.clone();
            let metrics = metrics.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = metrics.serve(token).await {
                    error!(error = %e, "admin server failed");
                }
            }))
        } else {
            None
        };

        let ingress_handle = {
            let token = servers.clone();
            let state = state.clone();
            let address = self.config.ingress.address;
            tokio::spawn(async move {
                if let Err(e) = crate::ingress::serve(state, address, token).await {
                    error!(error = %e, "ingress server failed");
                }
            })
        };

        let storage_poll = {
            let state = state.clone();
            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STORAGE_POLL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if !state.check_storage() {
                                warn!("storage not ready");
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() != ShutdownState::Running {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let watcher_handle = if self.config.settings.hot_reload {
            let mut watcher = ConfigWatcher::new(&self.config_path, self.config.clone())?;
            watcher.start()?;
            let selector = state.selector.clone();
            let shutdown_rx = self.shutdown.subscribe();
            Some(tokio::spawn(async move {
                watcher.run(selector, shutdown_rx).await;
            }))
        } else {
            None
        };

        info!(
            admin_address = %self.config.admin.address,
            ingress_address = %self.config.ingress.address,
            hot_reload = self.config.settings.hot_reload,
            drain_timeout_secs = self.config.settings.shutdown.drain_timeout.as_secs(),
            "dispatchd server started"
        );

        // Wait for shutdown signal
        wait_for_signal().await;

        info!("shutdown signal received, starting graceful shutdown");

        // Stop taking new work; in-flight dispatches keep running
        self.shutdown.start_drain();
        state.admin.set_draining();

        let drained = state
            .dispatcher
            .drain(self.shutdown.drain_timeout())
            .await;
        if !drained {
            warn!("drain timeout reached, outstanding attempts were cancelled");
        }

        self.shutdown.terminate();

        if let Some(handle) = watcher_handle {
            let _ = handle.await;
        }
        let _ = storage_poll.await;

        servers.cancel();
        let servers_stopped = futures::future::join_all(
            std::iter::once(ingress_handle).chain(admin_handle),
        )
        .await;
        for result in servers_stopped {
            if let Err(e) = result {
                warn!(error = %e, "server task ended abnormally");
            }
        }

        if let Err(e) = state.store.flush() {
            error!(error = %e, "failed to flush storage");
        }

        // Flush tracing
        crate::telemetry::shutdown_tracing();

        info!("dispatchd server stopped");

        Ok(())
    }

    /// Get shutdown handle
    pub fn shutdown(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
