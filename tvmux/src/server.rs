//! Service wiring and server lifecycle
//!
//! Builds the orchestrator from configuration, runs the background workers
//! (health monitor, shared stream reaper) and the HTTP control API, and
//! stops every local relay on shutdown.

use anyhow::Result;
use redis::aio::ConnectionManager as RedisConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tvmux_core::{Config, KeyBuilder, ProbeMethod};
use tvmux_orchestrator::monitor::MonitorReceiver;
use tvmux_orchestrator::quota::{InMemoryQuotaStore, QuotaStore, RedisQuotaStore};
use tvmux_orchestrator::shared::{ControllerBackend, InMemorySharedStreamStore, RedisSharedStreamStore};
use tvmux_orchestrator::{
    CatalogChainResolver, Collaborators, FailoverController, FfmpegLauncher, FfprobeProbe, HealthMonitor, HttpProbe,
    InMemorySessionRegistry, LocalMonitorQueue, PreflightProbe, QuotaGate, RedisSessionRegistry, SessionRegistry,
    SharedStreamMultiplexer, SharedStreamStore, StaticCatalog, StatusService,
};

use crate::api::{self, AppState};

/// Everything the HTTP layer and background workers share.
pub struct Services {
    pub controller: Arc<FailoverController>,
    pub monitor: Arc<HealthMonitor>,
    pub multiplexer: Option<SharedStreamMultiplexer>,
    pub status: Arc<StatusService>,
    monitor_rx: Option<MonitorReceiver>,
}

impl Services {
    pub async fn build(config: &Config, redis: Option<RedisConnectionManager>, node_id: String) -> Result<Self> {
        let keys = KeyBuilder::from_config(config);
        let (quota, sessions, shared_store): (
            Arc<dyn QuotaStore>,
            Arc<dyn SessionRegistry>,
            Arc<dyn SharedStreamStore>,
        ) = match redis {
            Some(conn) => (
                Arc::new(RedisQuotaStore::new(conn.clone(), keys.clone())),
                Arc::new(RedisSessionRegistry::new(conn.clone(), keys.clone())),
                Arc::new(RedisSharedStreamStore::new(conn, keys)),
            ),
            None => (
                Arc::new(InMemoryQuotaStore::new()),
                Arc::new(InMemorySessionRegistry::new()),
                Arc::new(InMemorySharedStreamStore::new()),
            ),
        };

        let catalog = match &config.catalog_path {
            Some(path) => {
                let catalog = StaticCatalog::load(path).await?;
                info!(path = %path, sources = catalog.len(), "Source catalog loaded");
                catalog
            }
            None => {
                warn!("No catalog_path configured; every play request will report an unknown source");
                StaticCatalog::new()
            }
        };

        let orchestrator = &config.orchestrator;
        let probe: Arc<dyn PreflightProbe> = match orchestrator.probe_method {
            ProbeMethod::Ffprobe => Arc::new(FfprobeProbe::new(orchestrator.ffprobe_path.clone())),
            ProbeMethod::Http => Arc::new(HttpProbe::new()),
        };
        info!(probe_method = ?orchestrator.probe_method, "Preflight probe selected");

        let (queue, monitor_rx) = LocalMonitorQueue::new();
        let queue = Arc::new(queue);

        let controller = Arc::new(FailoverController::new(
            Collaborators {
                gate: Arc::new(QuotaGate::new(quota)),
                probe,
                launcher: Arc::new(FfmpegLauncher::from_config(orchestrator)),
                resolver: Arc::new(CatalogChainResolver::new(catalog)),
                sessions,
                monitor_queue: queue.clone(),
            },
            orchestrator.clone(),
            node_id.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&controller),
            queue,
            orchestrator.monitor_interval(),
        ));

        let multiplexer = if config.shared.enabled {
            Some(SharedStreamMultiplexer::new(
                shared_store,
                Arc::new(ControllerBackend::new(Arc::clone(&controller))),
                config.shared.clone(),
                node_id,
            ))
        } else {
            info!("Shared stream mode disabled");
            None
        };

        let status = Arc::new(StatusService::new(Arc::clone(&controller), multiplexer.clone()));

        Ok(Self {
            controller,
            monitor,
            multiplexer,
            status,
            monitor_rx: Some(monitor_rx),
        })
    }

    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState {
            controller: Arc::clone(&self.controller),
            status: Arc::clone(&self.status),
            multiplexer: self.multiplexer.clone(),
        }
    }
}

pub struct Server {
    config: Config,
    services: Services,
}

impl Server {
    pub const fn new(config: Config, services: Services) -> Self {
        Self { config, services }
    }

    /// Start workers and the HTTP server, and wait for a shutdown signal
    pub async fn start(mut self) -> Result<()> {
        let cancel = CancellationToken::new();

        let monitor_rx = self
            .services
            .monitor_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("monitor receiver already taken"))?;
        let monitor_handle = tokio::spawn(Arc::clone(&self.services.monitor).run(monitor_rx, cancel.clone()));

        let reaper_handle = self
            .services
            .multiplexer
            .clone()
            .map(|multiplexer| tokio::spawn(multiplexer.run_reaper(cancel.clone())));

        let router = api::create_router(self.services.app_state());
        let address = self.config.http_address();
        let listener = TcpListener::bind(&address).await?;
        info!("HTTP server listening on {}", address);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Shutting down tvmux...");
        cancel.cancel();
        self.shutdown().await;

        if let Err(e) = monitor_handle.await {
            error!("Health monitor task failed: {}", e);
        }
        if let Some(handle) = reaper_handle {
            if let Err(e) = handle.await {
                error!("Reaper task failed: {}", e);
            }
        }
        info!("tvmux stopped");
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(multiplexer) = &self.services.multiplexer {
            match multiplexer.shutdown().await {
                Ok(count) => info!("Released {} shared stream(s)", count),
                Err(e) => error!("Failed to release shared streams: {}", e),
            }
        }

        let local = self.services.controller.local_process_count();
        info!("Stopping {} local relay process(es)...", local);
        self.services.controller.shutdown().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
