use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use clearscan_core::orchestration::{JobLifecycle, ResultsMerger};
use clearscan_core::{
    HttpScanWorker, InMemoryScanStore, InProcQueueEventBus, JobStatusBoard, LocalObjectStorage,
    ObjectStorage, PostgresScanStore, QueueEventSync, ReconciliationSweeper, ScanRuntime,
    ScanService, ScanStore, ScanWorker,
};

use crate::infra::config::{Config, DatabaseConfig};
use crate::infra::queue_events::RedisQueueEventForwarder;

/// Opens the configured store. Migrations are applied before the store is
/// handed out.
pub async fn connect_store(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn ScanStore>> {
    let Some(url) = config.url.as_deref() else {
        warn!("running on the in-memory scan store; state is lost on restart");
        return Ok(Arc::new(InMemoryScanStore::new()));
    };
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    clearscan_core::MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    let store = PostgresScanStore::new(pool)
        .await
        .context("scan store health check failed")?;
    Ok(Arc::new(store))
}

/// Everything the process runs, wired from one [`Config`].
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn ScanStore>,
    pub service: Arc<ScanService>,
    pub bus: Arc<InProcQueueEventBus>,
    pub runtime: Arc<ScanRuntime>,
    forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("service", &self.service)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub async fn build(config: Config, store: Arc<dyn ScanStore>) -> anyhow::Result<Self> {
        let storage: Arc<dyn ObjectStorage> = Arc::new(
            LocalObjectStorage::new(&config.storage.root)
                .await
                .with_context(|| {
                    format!(
                        "failed to prepare object store at {}",
                        config.storage.root.display()
                    )
                })?,
        );
        let worker: Arc<dyn ScanWorker> = Arc::new(
            HttpScanWorker::new(&config.orchestrator.worker)
                .context("invalid scanner worker configuration")?,
        );
        let status = JobStatusBoard::new();
        let orchestrator = &config.orchestrator;

        let service = ScanService::new(
            store.clone(),
            storage,
            worker.clone(),
            status.clone(),
            orchestrator,
        );
        let sync = QueueEventSync::new(
            JobLifecycle::new(store.clone()),
            ResultsMerger::new(store.clone(), orchestrator.merge),
            worker.clone(),
            status,
        );
        let sweeper = ReconciliationSweeper::new(store.clone(), worker, orchestrator.sweeper);
        let bus = Arc::new(InProcQueueEventBus::new(orchestrator.events.capacity));
        let runtime = ScanRuntime::new(sync, sweeper, bus.clone());

        Ok(Self {
            config: Arc::new(config),
            store,
            service: Arc::new(service),
            bus,
            runtime: Arc::new(runtime),
            forwarder: std::sync::Mutex::new(None),
        })
    }

    /// Recovers interrupted jobs, starts the background loops, then attaches
    /// the Redis subscription when one is configured.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.runtime
            .start()
            .await
            .context("failed to start scan runtime")?;

        if let Some(redis) = &self.config.redis {
            let forwarder =
                RedisQueueEventForwarder::new(&redis.url, redis.channel.clone(), self.bus.clone())?;
            let cancel = self.runtime.shutdown_token();
            let handle = tokio::spawn(forwarder.run(cancel));
            if let Ok(mut slot) = self.forwarder.lock() {
                *slot = Some(handle);
            }
        }
        info!(
            sweep_interval_secs = self.config.orchestrator.sweeper.interval_secs,
            redis = self.config.redis.is_some(),
            "clearscan started"
        );
        Ok(())
    }

    /// Stops the loops, then waits for in-flight ingests.
    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
        let forwarder = self.forwarder.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = forwarder {
            if let Err(err) = handle.await {
                warn!(error = %err, "queue event forwarder panicked");
            }
        }
        self.service.drain().await;
        info!("clearscan stopped");
    }
}
