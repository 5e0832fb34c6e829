//! Periodic housekeeping loops run next to the worker pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::services::job_store::{JobFilter, JobStore, StoreError};
use crate::services::queue::{QueueError, WorkQueue};
use crate::services::registry::WorkerRegistry;
use crate::services::storage::BlobStore;
use crate::services::worker::WorkerPool;

/// Heartbeats missed before a worker process stops counting toward the fleet.
const MISSED_HEARTBEATS: u32 = 3;

/// Result of one retention sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed: usize,
    pub cutoff: DateTime<Utc>,
}

/// Delete terminal jobs that finished before `now - retention`, blob first.
///
/// A failure on one job is logged and the sweep moves on; the job is picked
/// up again on the next run.
pub async fn sweep_expired(
    jobs: &dyn JobStore,
    blobs: &dyn BlobStore,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<SweepReport, StoreError> {
    let cutoff = now - retention;
    let expired = jobs.list_by(&JobFilter::expired(cutoff)).await?;

    let mut report = SweepReport {
        deleted: 0,
        failed: 0,
        cutoff,
    };

    for job in expired {
        if let Err(e) = blobs.delete(&job.image_ref).await {
            tracing::warn!(job_id = %job.id, key = %job.image_ref, error = %e, "Failed to delete expired image");
            report.failed += 1;
            continue;
        }
        match jobs.delete(job.id).await {
            Ok(()) | Err(StoreError::NotFound(_)) => report.deleted += 1,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to delete expired job");
                report.failed += 1;
            }
        }
    }

    metrics::counter!("sweep_deleted_total").increment(report.deleted as u64);
    Ok(report)
}

/// Recommendation emitted by the scaling monitor. Nothing acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingSignal {
    ScaleUp,
    ScaleDown,
    Hold,
}

impl ScalingSignal {
    /// Gauge encoding: +1 up, -1 down, 0 hold.
    pub fn as_gauge(self) -> f64 {
        match self {
            ScalingSignal::ScaleUp => 1.0,
            ScalingSignal::ScaleDown => -1.0,
            ScalingSignal::Hold => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScalingThresholds {
    pub scale_up_depth: u64,
    pub scale_down_depth: u64,
    pub min_workers: usize,
    pub max_workers: usize,
}

impl Default for ScalingThresholds {
    fn default() -> Self {
        Self {
            scale_up_depth: 100,
            scale_down_depth: 10,
            min_workers: 2,
            max_workers: 20,
        }
    }
}

pub fn evaluate_scaling(depth: u64, workers: usize, t: &ScalingThresholds) -> ScalingSignal {
    if depth > t.scale_up_depth && workers < t.max_workers {
        ScalingSignal::ScaleUp
    } else if depth < t.scale_down_depth && workers > t.min_workers {
        ScalingSignal::ScaleDown
    } else {
        ScalingSignal::Hold
    }
}

/// Run the retention sweep every `interval`, starting immediately.
pub async fn run_sweeper(
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    retention: chrono::Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_days = retention.num_days(),
        interval_secs = interval.as_secs(),
        "Retention sweep started"
    );
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Retention sweep stopping");
                break;
            }
            _ = ticker.tick() => {
                match sweep_expired(jobs.as_ref(), blobs.as_ref(), retention, Utc::now()).await {
                    Ok(report) if report.deleted > 0 || report.failed > 0 => {
                        tracing::info!(
                            deleted = report.deleted,
                            failed = report.failed,
                            cutoff = %report.cutoff,
                            "Retention sweep finished"
                        );
                    }
                    Ok(_) => tracing::debug!("Retention sweep: nothing to delete"),
                    Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
                }
            }
        }
    }
}

/// Redeliver in-flight messages whose hard deadline has passed, failing the
/// jobs of any that have no attempts left.
pub async fn run_lease_reaper(
    pool: Arc<WorkerPool>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Lease reaper stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = pool.reap_expired_leases().await {
                    tracing::error!(error = %e, "Lease reaper cycle failed");
                }
            }
        }
    }
}

/// One observation of the scaling monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScalingSample {
    pub depth: u64,
    /// Worker slots across every live process.
    pub workers: usize,
    pub signal: ScalingSignal,
}

/// Samples queue depth and fleet size, then logs and exports a
/// [`ScalingSignal`].
///
/// Each monitor also heartbeats its own process's slots into the registry, so
/// every running worker process is counted while it is alive.
pub struct ScalingMonitor {
    queue: Arc<dyn WorkQueue>,
    registry: Arc<dyn WorkerRegistry>,
    process_id: String,
    local_slots: usize,
    thresholds: ScalingThresholds,
    interval: Duration,
    latest: watch::Sender<Option<ScalingSample>>,
}

impl ScalingMonitor {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        registry: Arc<dyn WorkerRegistry>,
        local_slots: usize,
        thresholds: ScalingThresholds,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            process_id: Uuid::new_v4().to_string(),
            local_slots,
            thresholds,
            interval,
            latest: watch::channel(None).0,
        }
    }

    /// Follow the samples as they are taken.
    pub fn watch(&self) -> watch::Receiver<Option<ScalingSample>> {
        self.latest.subscribe()
    }

    pub async fn sample(&self) -> Result<ScalingSample, QueueError> {
        self.registry
            .heartbeat(
                &self.process_id,
                self.local_slots,
                self.interval * MISSED_HEARTBEATS,
            )
            .await?;
        let workers = self.registry.active_workers().await?;
        let depth = self.queue.size().await?;
        Ok(ScalingSample {
            depth,
            workers,
            signal: evaluate_scaling(depth, workers, &self.thresholds),
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            process_id = %self.process_id,
            slots = self.local_slots,
            interval_secs = self.interval.as_secs(),
            "Scaling monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sample = match self.sample().await {
                        Ok(sample) => sample,
                        Err(e) => {
                            tracing::error!(error = %e, "Scaling sample failed");
                            continue;
                        }
                    };

                    metrics::gauge!("queue_depth").set(sample.depth as f64);
                    metrics::gauge!("fleet_workers").set(sample.workers as f64);
                    metrics::gauge!("scaling_recommendation").set(sample.signal.as_gauge());

                    match sample.signal {
                        ScalingSignal::Hold => {
                            tracing::debug!(depth = sample.depth, workers = sample.workers, "Scaling: hold");
                        }
                        ScalingSignal::ScaleUp | ScalingSignal::ScaleDown => {
                            tracing::info!(
                                depth = sample.depth,
                                workers = sample.workers,
                                signal = ?sample.signal,
                                "Scaling recommendation"
                            );
                        }
                    }
                    self.latest.send_replace(Some(sample));
                }
            }
        }

        if let Err(e) = self.registry.deregister(&self.process_id).await {
            tracing::warn!(error = %e, "Failed to deregister worker process");
        }
        tracing::info!("Scaling monitor stopping");
    }
}
