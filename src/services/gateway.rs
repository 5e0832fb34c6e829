use std::sync::Arc;

use chrono::Utc;
use garde::Validate;
use uuid::Uuid;

use crate::models::detection::ResultPayload;
use crate::models::job::{Job, JobStatus, JobView, NewJob};
use crate::models::upload::Upload;
use crate::services::detector::ModelCatalog;
use crate::services::job_store::{JobStore, StoreError};
use crate::services::queue::{ExecutionMessage, QueueError, WorkQueue};
use crate::services::storage::{BlobStore, StorageError};

/// Default upload ceiling: 10 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job is not completed. Current status: {0}")]
    NotReady(JobStatus),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Persistence error: {0}")]
    Persistence(StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => GatewayError::NotFound(id),
            other => GatewayError::Persistence(other),
        }
    }
}

/// Synchronous entry point of the pipeline: accepts submissions and answers
/// status and result queries.
pub struct JobGateway {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn WorkQueue>,
    catalog: ModelCatalog,
    max_upload_bytes: usize,
}

impl JobGateway {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn WorkQueue>,
        catalog: ModelCatalog,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            jobs,
            blobs,
            queue,
            catalog,
            max_upload_bytes,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Validate, store the image, record the job, then enqueue it.
    ///
    /// The order guarantees a job exists before a worker can see its message
    /// and that the image exists before the job references it. A failure at a
    /// later step undoes the earlier ones so nothing is left stranded.
    pub async fn submit(&self, upload: Upload) -> Result<Job, GatewayError> {
        let model_name = self.validate(&upload)?;

        let image_ref = self
            .blobs
            .put(
                &upload.bytes,
                &upload.content_type,
                upload.original_filename.as_deref(),
            )
            .await?;

        let job = Job::new(
            NewJob {
                model_name,
                image_ref,
                content_type: upload.content_type,
                file_size: upload.bytes.len() as i64,
                original_filename: upload.original_filename,
                callback_target: upload.callback_target,
            },
            Utc::now(),
        );

        if let Err(e) = self.jobs.create(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to create job record");
            self.discard_blob(&job).await;
            return Err(GatewayError::Persistence(e));
        }

        let message = ExecutionMessage {
            job_id: job.id,
            image_ref: job.image_ref.clone(),
            model_name: job.model_name.clone(),
        };
        let token = match self.queue.enqueue(&message).await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue job");
                if let Err(e) = self.jobs.delete(job.id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to remove unqueued job");
                }
                self.discard_blob(&job).await;
                return Err(GatewayError::Queue(e));
            }
        };

        metrics::counter!("jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            token = %token,
            model = %job.model_name,
            file_size = job.file_size,
            "Job submitted"
        );
        Ok(job)
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobView, GatewayError> {
        let job = self.jobs.get(job_id).await?;
        Ok(JobView::from(&job))
    }

    pub async fn get_result(&self, job_id: Uuid) -> Result<ResultPayload, GatewayError> {
        let job = self.jobs.get(job_id).await?;
        match (job.status, job.result_payload) {
            (JobStatus::Completed, Some(payload)) => Ok(payload),
            (JobStatus::Completed, None) => Err(GatewayError::Persistence(StoreError::Corrupt(
                format!("completed job {job_id} has no result payload"),
            ))),
            (status, _) => Err(GatewayError::NotReady(status)),
        }
    }

    /// Returns the resolved model name.
    fn validate(&self, upload: &Upload) -> Result<String, GatewayError> {
        upload
            .validate()
            .map_err(|report| GatewayError::Validation(report.to_string()))?;

        if !upload.content_type.starts_with("image/") {
            return Err(GatewayError::Validation("File must be an image".to_string()));
        }
        if upload.bytes.is_empty() {
            return Err(GatewayError::Validation("File is empty".to_string()));
        }
        if upload.bytes.len() > self.max_upload_bytes {
            return Err(GatewayError::Validation(format!(
                "File size exceeds {}MB limit",
                self.max_upload_bytes / (1024 * 1024)
            )));
        }

        if let Some(target) = &upload.callback_target {
            let url = reqwest::Url::parse(target)
                .map_err(|_| GatewayError::Validation("Callback URL is not a valid URL".to_string()))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(GatewayError::Validation(
                    "Callback URL must use http or https".to_string(),
                ));
            }
        }

        self.catalog
            .resolve(upload.model_name.as_deref())
            .map_err(|e| GatewayError::Validation(e.to_string()))
    }

    async fn discard_blob(&self, job: &Job) {
        if let Err(e) = self.blobs.delete(&job.image_ref).await {
            tracing::warn!(job_id = %job.id, key = %job.image_ref, error = %e, "Failed to remove orphaned image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::job_store::MemoryJobStore;
    use crate::services::queue::MemoryWorkQueue;
    use crate::services::storage::MemoryBlobStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Harness {
        jobs: Arc<MemoryJobStore>,
        blobs: Arc<MemoryBlobStore>,
        queue: Arc<MemoryWorkQueue>,
        gateway: JobGateway,
    }

    fn harness() -> Harness {
        let jobs = Arc::new(MemoryJobStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(MemoryWorkQueue::default());
        let gateway = JobGateway::new(
            jobs.clone(),
            blobs.clone(),
            queue.clone(),
            ModelCatalog::new(["gpt-4o", "claude-sonnet"]),
            1024,
        );
        Harness {
            jobs,
            blobs,
            queue,
            gateway,
        }
    }

    fn upload(bytes: &[u8]) -> Upload {
        Upload {
            bytes: bytes.to_vec(),
            content_type: "image/png".to_string(),
            original_filename: Some("screen.png".to_string()),
            model_name: None,
            callback_target: None,
        }
    }

    #[tokio::test]
    async fn test_submit_stores_blob_creates_job_and_enqueues() {
        let h = harness();
        let job = h.gateway.submit(upload(b"png")).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.model_name, "gpt-4o");
        assert!(h.blobs.contains(&job.image_ref).await);
        assert_eq!(h.jobs.get(job.id).await.unwrap(), job);

        let dequeued = h.queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(dequeued.delivery.message.job_id, job.id);
        assert_eq!(dequeued.delivery.message.image_ref, job.image_ref);
    }

    #[tokio::test]
    async fn test_non_image_rejected_without_side_effects() {
        let h = harness();
        let mut bad = upload(b"%PDF");
        bad.content_type = "application/pdf".to_string();

        let err = h.gateway.submit(bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(ref m) if m == "File must be an image"));
        assert_eq!(h.jobs.len().await, 0);
        assert_eq!(h.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversize_upload_rejected() {
        let h = harness();
        let err = h.gateway.submit(upload(&[0u8; 1025])).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(h.jobs.len().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_model_suggests_closest() {
        let h = harness();
        let mut req = upload(b"png");
        req.model_name = Some("gpt-4".to_string());

        let err = h.gateway.submit(req).await.unwrap_err();
        let GatewayError::Validation(message) = err else {
            panic!("expected validation error");
        };
        assert!(message.contains("gpt-4o"));
        assert_eq!(h.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_callback_rejected() {
        let h = harness();
        let mut req = upload(b"png");
        req.callback_target = Some("ftp://example.com/hook".to_string());
        assert!(matches!(
            h.gateway.submit(req).await,
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let h = harness();
        let id = Uuid::new_v4();
        assert!(matches!(h.gateway.get_status(id).await, Err(GatewayError::NotFound(got)) if got == id));
        assert!(matches!(h.gateway.get_result(id).await, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_result_of_pending_job_is_not_ready() {
        let h = harness();
        let job = h.gateway.submit(upload(b"png")).await.unwrap();
        let err = h.gateway.get_result(job.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotReady(JobStatus::Pending)));
        assert_eq!(err.to_string(), "Job is not completed. Current status: pending");
    }

    struct BrokenQueue;

    #[async_trait]
    impl WorkQueue for BrokenQueue {
        async fn enqueue(&self, _: &ExecutionMessage) -> Result<String, QueueError> {
            Err(QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }
        async fn dequeue(
            &self,
            _: Duration,
        ) -> Result<Option<crate::services::queue::Dequeued>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _: &crate::services::queue::AckHandle) -> Result<(), QueueError> {
            Ok(())
        }
        async fn nack(
            &self,
            _: &crate::services::queue::AckHandle,
        ) -> Result<crate::services::queue::NackOutcome, QueueError> {
            Ok(crate::services::queue::NackOutcome::NotInFlight)
        }
        async fn requeue_expired(
            &self,
        ) -> Result<crate::services::queue::ExpiredLeases, QueueError> {
            Ok(Default::default())
        }
        async fn size(&self) -> Result<u64, QueueError> {
            Ok(0)
        }
        async fn in_flight(&self) -> Result<u64, QueueError> {
            Ok(0)
        }
        async fn health_check(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_enqueue_failure_rolls_back_job_and_blob() {
        let jobs = Arc::new(MemoryJobStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let gateway = JobGateway::new(
            jobs.clone(),
            blobs.clone(),
            Arc::new(BrokenQueue),
            ModelCatalog::new(["gpt-4o"]),
            1024,
        );

        let err = gateway.submit(upload(b"png")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Queue(_)));
        assert_eq!(jobs.len().await, 0);
        assert_eq!(blobs.len().await, 0);
    }
}
