use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::BlobStorage;
use tokio::{self, signal, sync::watch};
use tracing::{error, info};

use super::routes::RouteState;
use crate::{
    background::BackgroundTasks,
    cache::EndpointCache,
    config::ServerConfig,
    dispatch::Dispatcher,
    health::HealthGate,
    lifecycle::{IdleMonitor, LifecycleManager},
    packager::ArchivePackager,
    restore::RestoreEngine,
    routes::create_routes,
    sandbox::{HostSandboxProvider, SandboxProvider},
    snapshots::SnapshotStore,
    supervisor::ProcessSupervisor,
    transfer::Transfer,
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub store: Arc<SnapshotStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub idle: Arc<IdleMonitor>,
    pub background: BackgroundTasks,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );
        let provider: Arc<dyn SandboxProvider> = Arc::new(
            HostSandboxProvider::new(config.sandboxes.base_dir.clone())
                .context("error initializing sandbox provider")?,
        );

        let health = HealthGate::new(&config.health);
        let store = Arc::new(SnapshotStore::new(
            blob_storage,
            ArchivePackager::new(&config.archive),
            Transfer::new(&config.transfer),
        ));
        let restore = Arc::new(RestoreEngine::new(store.clone(), health.clone()));
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.supervisor.clone(),
            restore.clone(),
        ));
        let cache = Arc::new(EndpointCache::new(Duration::from_secs(
            config.cache.endpoint_ttl_secs,
        )));

        let lifecycle = Arc::new(LifecycleManager::new(
            provider,
            health,
            store.clone(),
            restore,
            supervisor,
            cache.clone(),
        ));
        let idle = Arc::new(IdleMonitor::new(Duration::from_secs(
            config.idle.idle_after_secs,
        )));
        let dispatcher = Arc::new(Dispatcher::new(
            lifecycle.clone(),
            cache,
            idle.clone(),
            config.supervisor.clone(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            store,
            lifecycle,
            dispatcher,
            idle,
            background: BackgroundTasks::new(),
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.config.idle.enabled {
            let idle = self.idle.clone();
            let lifecycle = self.lifecycle.clone();
            let background = self.background.clone();
            let sweep_interval = Duration::from_secs(self.config.idle.sweep_interval_secs);
            let shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                idle.run(lifecycle, background, sweep_interval, shutdown_rx)
                    .await;
            });
        }

        let route_state = RouteState {
            store: self.store.clone(),
            lifecycle: self.lifecycle.clone(),
            dispatcher: self.dispatcher.clone(),
            idle: self.idle.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {:?}", e);
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
                error!("failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}
