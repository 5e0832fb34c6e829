//! Queue consumer that drives each job through the state machine.
//!
//! One [`WorkerPool`] runs a fixed number of consumer loops. Every delivery is
//! executed in its own task so a panic is contained to that delivery and the
//! message is handed back to the queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::detection::{Detection, ResultPayload};
use crate::models::job::{Job, JobStatus, JobTransition};
use crate::models::notification::NotificationEvent;
use crate::services::detector::{detect_with_retry, read_dimensions, Detector, DetectorError, RetryPolicy};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::queue::{AckHandle, Dequeued, NackOutcome, QueueError, WorkQueue};
use crate::services::relay::EventRelay;
use crate::services::storage::{BlobStore, StorageError};
use crate::services::webhook::{WebhookNotifier, WebhookPayload};

/// Pause after a failed dequeue before trying again.
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Recorded on jobs whose delivery ran out of attempts.
pub const DEAD_LETTER_ERROR: &str = "Exceeded maximum delivery attempts";

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Concurrent executions in this process.
    pub concurrency: usize,
    /// Executions running longer than this give the message back.
    pub soft_deadline: Duration,
    /// How long one dequeue blocks waiting for work.
    pub dequeue_wait: Duration,
    pub retry: RetryPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            soft_deadline: Duration::from_secs(240),
            dequeue_wait: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    /// Handed back to the queue (soft deadline, store outage, panic).
    Requeued,
    /// Out of attempts; the job was failed and the message parked.
    DeadLettered,
    /// Nothing to do: the job is gone or already terminal.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub slots: usize,
    pub active: usize,
}

#[derive(Debug, thiserror::Error)]
enum ExecutionError {
    #[error("Failed to fetch image: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Detector(#[from] DetectorError),
}

pub struct WorkerPool {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn WorkQueue>,
    detector: Arc<dyn Detector>,
    relay: Arc<dyn EventRelay>,
    webhooks: Option<Arc<WebhookNotifier>>,
    settings: PoolSettings,
    active: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn WorkQueue>,
        detector: Arc<dyn Detector>,
        relay: Arc<dyn EventRelay>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            jobs,
            blobs,
            queue,
            detector,
            relay,
            webhooks: None,
            settings,
            active: AtomicUsize::new(0),
        }
    }

    pub fn with_webhooks(mut self, notifier: Arc<WebhookNotifier>) -> Self {
        self.webhooks = Some(notifier);
        self
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slots: self.settings.concurrency,
            active: self.active.load(Ordering::Relaxed),
        }
    }

    /// Spawn the consumer loops. They stop taking new work once `cancel`
    /// fires; executions already running are allowed to finish.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        tracing::info!(
            concurrency = self.settings.concurrency,
            soft_deadline_secs = self.settings.soft_deadline.as_secs(),
            "Worker pool starting"
        );
        (0..self.settings.concurrency.max(1))
            .map(|slot| {
                let pool = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.consume(slot, cancel).await })
            })
            .collect()
    }

    async fn consume(self: Arc<Self>, slot: usize, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.dequeue(self.settings.dequeue_wait) => next,
            };

            match next {
                Ok(Some(dequeued)) => {
                    self.run_isolated(dequeued).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(slot, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(DEQUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::info!(slot, "Worker slot stopped");
    }

    /// Run one delivery in its own task, nacking it if the task panics.
    pub async fn run_isolated(self: &Arc<Self>, dequeued: Dequeued) -> ExecutionOutcome {
        let job_id = dequeued.delivery.message.job_id;
        let handle = dequeued.handle.clone();

        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("active_executions").set(active as f64);

        let pool = Arc::clone(self);
        let outcome = match tokio::spawn(async move { pool.run(dequeued).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(%job_id, token = %handle.token, error = %e, "Execution aborted");
                self.give_back(job_id, &handle).await
            }
        };

        let active = self.active.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("active_executions").set(active as f64);
        outcome
    }

    /// Execute one delivery end to end.
    pub async fn run(&self, dequeued: Dequeued) -> ExecutionOutcome {
        let Dequeued { delivery, handle } = dequeued;
        let job_id = delivery.message.job_id;

        let job = match self.jobs.get(job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                tracing::error!(%job_id, "Delivery references a missing job, discarding");
                self.ack(job_id, &handle).await;
                return ExecutionOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Failed to load job");
                return self.give_back(job_id, &handle).await;
            }
        };

        if job.status.is_terminal() {
            tracing::info!(%job_id, status = %job.status, "Job already finished, acknowledging duplicate delivery");
            self.ack(job_id, &handle).await;
            return ExecutionOutcome::Skipped;
        }

        let started = Instant::now();
        let job = match self
            .jobs
            .update(
                job_id,
                JobTransition::Start {
                    worker_token: handle.token.clone(),
                    at: Utc::now(),
                },
            )
            .await
        {
            Ok(job) => job,
            Err(StoreError::Transition(e)) => {
                // Lost a race with another attempt that already finished.
                tracing::info!(%job_id, error = %e, "Job finished concurrently, acknowledging");
                self.ack(job_id, &handle).await;
                return ExecutionOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Failed to mark job processing");
                return self.give_back(job_id, &handle).await;
            }
        };

        tracing::info!(
            %job_id,
            token = %handle.token,
            attempt = delivery.attempt,
            model = %job.model_name,
            "Processing detection job"
        );
        if let Some(started_at) = job.started_at {
            self.publish(NotificationEvent::processing(job_id, started_at)).await;
        }

        let detected = tokio::time::timeout(self.settings.soft_deadline, self.detect(&job)).await;

        let transition = match detected {
            Err(_) => {
                tracing::warn!(
                    %job_id,
                    soft_deadline_secs = self.settings.soft_deadline.as_secs(),
                    "Soft deadline exceeded, handing job back"
                );
                return self.give_back(job_id, &handle).await;
            }
            Ok(Ok(detection)) => {
                let elapsed = started.elapsed().as_secs_f64();
                let now = Utc::now();
                JobTransition::Complete {
                    payload: ResultPayload::new(
                        detection.annotations,
                        detection.dimensions,
                        &job.model_name,
                        elapsed,
                        now,
                    ),
                    at: now,
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(%job_id, error = %e, "Detection failed");
                JobTransition::Fail {
                    error: e.to_string(),
                    at: Utc::now(),
                }
            }
        };

        let finished = match self.jobs.update(job_id, transition).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Failed to persist job outcome");
                return self.give_back(job_id, &handle).await;
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        metrics::histogram!("job_processing_seconds").record(elapsed);

        let (outcome, event) = match (&finished.result_payload, &finished.error_detail) {
            (Some(payload), _) => {
                metrics::counter!("jobs_completed_total").increment(1);
                tracing::info!(
                    %job_id,
                    total_elements = payload.total_elements,
                    processing_secs = elapsed,
                    "Job completed"
                );
                (
                    ExecutionOutcome::Completed,
                    NotificationEvent::completed(job_id, payload.clone()),
                )
            }
            (None, error) => {
                let error = error.clone().unwrap_or_default();
                metrics::counter!("jobs_failed_total").increment(1);
                tracing::warn!(%job_id, error = %error, "Job failed");
                (ExecutionOutcome::Failed, NotificationEvent::failed(job_id, error))
            }
        };

        self.publish(event).await;
        self.ack(job_id, &handle).await;
        self.notify_callback(&finished);
        outcome
    }

    async fn detect(&self, job: &Job) -> Result<Detection, ExecutionError> {
        let image = self.blobs.get(&job.image_ref).await?;
        let mut detection = detect_with_retry(
            self.detector.as_ref(),
            &image,
            &job.content_type,
            &job.model_name,
            &self.settings.retry,
        )
        .await?;

        if detection.dimensions.is_none() {
            detection.dimensions = read_dimensions(&image);
        }
        Ok(detection)
    }

    async fn publish(&self, event: NotificationEvent) {
        if let Err(e) = self.relay.publish(&event).await {
            tracing::warn!(job_id = %event.job_id, status = %event.status, error = %e, "Failed to publish job update");
        }
    }

    async fn ack(&self, job_id: Uuid, handle: &AckHandle) {
        // The lease reaper redelivers anything left unacked; the duplicate is skipped.
        if let Err(e) = self.queue.ack(handle).await {
            tracing::error!(%job_id, token = %handle.token, error = %e, "Failed to ack delivery");
        }
    }

    async fn give_back(&self, job_id: Uuid, handle: &AckHandle) -> ExecutionOutcome {
        match self.queue.nack(handle).await {
            Ok(NackOutcome::Requeued) => {
                metrics::counter!("jobs_requeued_total").increment(1);
                tracing::info!(%job_id, token = %handle.token, "Delivery requeued");
            }
            Ok(NackOutcome::DeadLettered) => {
                tracing::error!(%job_id, token = %handle.token, "Delivery dead-lettered");
                self.fail_dead_lettered(job_id, &handle.token).await;
                return ExecutionOutcome::DeadLettered;
            }
            Ok(NackOutcome::NotInFlight) => {
                tracing::warn!(%job_id, token = %handle.token, "Delivery was no longer in flight");
            }
            Err(e) => {
                tracing::error!(%job_id, token = %handle.token, error = %e, "Failed to nack delivery");
            }
        }
        ExecutionOutcome::Requeued
    }

    /// Release deliveries past their hard deadline and fail the jobs of any
    /// that ran out of attempts. Returns how many were requeued.
    pub async fn reap_expired_leases(&self) -> Result<usize, QueueError> {
        let expired = self.queue.requeue_expired().await?;
        for delivery in &expired.dead_lettered {
            self.fail_dead_lettered(delivery.message.job_id, &delivery.token())
                .await;
        }
        Ok(expired.requeued)
    }

    /// Give a job whose message was dead-lettered its terminal FAILED state.
    async fn fail_dead_lettered(&self, job_id: Uuid, token: &str) {
        let job = match self.jobs.get(job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return,
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Failed to load dead-lettered job");
                return;
            }
        };

        match job.status {
            JobStatus::Completed | JobStatus::Failed => return,
            JobStatus::Processing => {}
            JobStatus::Pending => {
                // Never started: FAILED is only reachable through PROCESSING.
                match self
                    .jobs
                    .update(
                        job_id,
                        JobTransition::Start {
                            worker_token: token.to_string(),
                            at: Utc::now(),
                        },
                    )
                    .await
                {
                    Ok(job) => {
                        if let Some(started_at) = job.started_at {
                            self.publish(NotificationEvent::processing(job_id, started_at))
                                .await;
                        }
                    }
                    Err(e) => {
                        tracing::error!(%job_id, error = %e, "Failed to mark dead-lettered job processing");
                        return;
                    }
                }
            }
        }

        let failed = match self
            .jobs
            .update(
                job_id,
                JobTransition::Fail {
                    error: DEAD_LETTER_ERROR.to_string(),
                    at: Utc::now(),
                },
            )
            .await
        {
            Ok(job) => job,
            Err(StoreError::Transition(_)) => return,
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Failed to fail dead-lettered job");
                return;
            }
        };

        metrics::counter!("jobs_failed_total").increment(1);
        tracing::warn!(%job_id, token, "Job failed after exhausting deliveries");
        self.publish(NotificationEvent::failed(job_id, DEAD_LETTER_ERROR.to_string()))
            .await;
        self.notify_callback(&failed);
    }

    fn notify_callback(&self, job: &Job) {
        let (Some(notifier), Some(url)) = (&self.webhooks, &job.callback_target) else {
            return;
        };
        if let Some(payload) = WebhookPayload::for_job(job) {
            notifier.spawn_send(url.clone(), payload);
        }
    }
}
