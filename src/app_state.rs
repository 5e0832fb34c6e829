use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ConfigError, StorageBackend};
use crate::db::{self, queries::PgJobStore};
use crate::services::{
    detector::{ChatCompletionsClient, DetectorError},
    gateway::JobGateway,
    hub::SubscriptionHub,
    job_store::{JobStore, MemoryJobStore},
    maintenance::{self, ScalingMonitor},
    queue::{MemoryWorkQueue, QueueError, RedisWorkQueue, WorkQueue},
    registry::{MemoryWorkerRegistry, RedisWorkerRegistry, WorkerRegistry},
    relay::{EventRelay, LocalRelay, RedisRelay, RelayError},
    storage::{BlobStore, MemoryBlobStore, R2Client, StorageError},
    webhook::{WebhookError, WebhookNotifier},
    worker::WorkerPool,
};

/// Lease reaper cadence.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<JobGateway>,
    pub hub: Arc<SubscriptionHub>,
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
}

impl AppState {
    pub fn new(backends: &Backends, gateway: JobGateway, hub: Arc<SubscriptionHub>) -> Self {
        Self {
            gateway: Arc::new(gateway),
            hub,
            jobs: Arc::clone(&backends.jobs),
            queue: Arc::clone(&backends.queue),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

/// The collaborators every process needs, chosen by `STORAGE_BACKEND`.
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub relay: Arc<dyn EventRelay>,
    pub registry: Arc<dyn WorkerRegistry>,
    /// Present only for the remote backend.
    pub db: Option<PgPool>,
}

impl Backends {
    pub async fn connect(config: &AppConfig) -> Result<Self, StartupError> {
        match config.storage_backend {
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory backends; state is lost on restart");
                Ok(Self::in_memory(config))
            }
            StorageBackend::Remote => {
                tracing::info!("Connecting to PostgreSQL");
                let pool = db::init_pool(
                    config.require(&config.database_url, "DATABASE_URL")?,
                    config.database_max_connections,
                )
                .await?;

                tracing::info!("Initializing object storage client");
                let blobs = R2Client::new(
                    config.require(&config.s3_bucket, "S3_BUCKET")?,
                    config.require(&config.s3_endpoint, "S3_ENDPOINT")?,
                    &config.s3_region,
                    config.require(&config.s3_access_key, "S3_ACCESS_KEY")?,
                    config.require(&config.s3_secret_key, "S3_SECRET_KEY")?,
                )?;

                tracing::info!("Connecting to Redis");
                let redis_url = config.require(&config.redis_url, "REDIS_URL")?;
                let queue = RedisWorkQueue::new(redis_url, config.queue_settings())?;
                let relay = RedisRelay::new(redis_url)?;
                let registry = RedisWorkerRegistry::new(redis_url)?;

                Ok(Self {
                    jobs: Arc::new(PgJobStore::new(pool.clone())),
                    blobs: Arc::new(blobs),
                    queue: Arc::new(queue),
                    relay: Arc::new(relay),
                    registry: Arc::new(registry),
                    db: Some(pool),
                })
            }
        }
    }

    pub fn in_memory(config: &AppConfig) -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            queue: Arc::new(MemoryWorkQueue::new(config.queue_settings())),
            relay: Arc::new(LocalRelay::default()),
            registry: Arc::new(MemoryWorkerRegistry::new()),
            db: None,
        }
    }

    pub fn gateway(&self, config: &AppConfig) -> JobGateway {
        JobGateway::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.blobs),
            Arc::clone(&self.queue),
            config.model_catalog(),
            config.max_upload_bytes,
        )
    }

    pub fn worker_pool(&self, config: &AppConfig) -> Result<Arc<WorkerPool>, StartupError> {
        let detector = ChatCompletionsClient::new(
            &config.detector_base_url,
            config.require(&config.detector_api_key, "DETECTOR_API_KEY")?,
        )?;
        let webhooks = WebhookNotifier::new(Duration::from_secs(config.webhook_timeout_secs))?;

        let pool = WorkerPool::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.blobs),
            Arc::clone(&self.queue),
            Arc::new(detector),
            Arc::clone(&self.relay),
            config.pool_settings(),
        )
        .with_webhooks(Arc::new(webhooks));
        Ok(Arc::new(pool))
    }

    /// Start the consumer loops plus the lease reaper, scaling monitor and
    /// retention sweep.
    pub fn spawn_workers(
        &self,
        config: &AppConfig,
        pool: &Arc<WorkerPool>,
        cancel: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = pool.start(cancel.clone());

        handles.push(tokio::spawn(maintenance::run_lease_reaper(
            Arc::clone(pool),
            REAPER_INTERVAL,
            cancel.clone(),
        )));

        let monitor = Arc::new(ScalingMonitor::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            pool.stats().slots,
            config.scaling_thresholds(),
            Duration::from_secs(config.monitor_interval_secs),
        ));
        handles.push(tokio::spawn(monitor.run(cancel.clone())));
        handles.push(tokio::spawn(maintenance::run_sweeper(
            Arc::clone(&self.jobs),
            Arc::clone(&self.blobs),
            config.retention(),
            Duration::from_secs(config.sweep_interval_secs),
            cancel.clone(),
        )));

        handles
    }
}
