use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::detection::ResultPayload;

/// Status of a detection job in the async pipeline.
///
/// The only legal path is `Pending -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            JobStatus::Completed | JobStatus::Failed => true,
            JobStatus::Pending | JobStatus::Processing => false,
        }
    }

    /// Whether `self -> next` is an edge of the job state machine.
    ///
    /// Processing -> Processing is a re-claim by a redelivered attempt, and a
    /// terminal status may be re-applied to itself by a duplicate delivery.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Processing, JobStatus::Processing) => true,
            (JobStatus::Processing, JobStatus::Completed | JobStatus::Failed) => true,
            (JobStatus::Completed, JobStatus::Completed) => true,
            (JobStatus::Failed, JobStatus::Failed) => true,
            (_, JobStatus::Pending) => false,
            (JobStatus::Pending, JobStatus::Completed | JobStatus::Failed) => false,
            (JobStatus::Completed, JobStatus::Processing | JobStatus::Failed) => false,
            (JobStatus::Failed, JobStatus::Processing | JobStatus::Completed) => false,
        }
    }
}

/// Metadata captured at submission time. Immutable for the job's lifetime.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub model_name: String,
    pub image_ref: String,
    pub content_type: String,
    pub file_size: i64,
    pub original_filename: Option<String>,
    pub callback_target: Option<String>,
}

/// A UI element detection job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub model_name: String,
    pub image_ref: String,
    pub content_type: String,
    pub file_size: i64,
    pub original_filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_payload: Option<ResultPayload>,
    pub error_detail: Option<String>,
    pub worker_token: Option<String>,
    pub callback_target: Option<String>,
}

/// A single step of the job state machine, applied atomically by the store.
#[derive(Debug, Clone)]
pub enum JobTransition {
    Start {
        worker_token: String,
        at: DateTime<Utc>,
    },
    Complete {
        payload: ResultPayload,
        at: DateTime<Utc>,
    },
    Fail {
        error: String,
        at: DateTime<Utc>,
    },
}

impl JobTransition {
    pub fn target(&self) -> JobStatus {
        match self {
            JobTransition::Start { .. } => JobStatus::Processing,
            JobTransition::Complete { .. } => JobStatus::Completed,
            JobTransition::Fail { .. } => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl Job {
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            model_name: new.model_name,
            image_ref: new.image_ref,
            content_type: new.content_type,
            file_size: new.file_size,
            original_filename: new.original_filename,
            created_at: now,
            started_at: None,
            completed_at: None,
            result_payload: None,
            error_detail: None,
            worker_token: None,
            callback_target: new.callback_target,
        }
    }

    /// Apply a transition in place, rejecting any edge outside the state machine.
    ///
    /// `started_at` and `completed_at` are only ever written once; re-applying a
    /// terminal status replaces the payload but keeps the original timestamp.
    pub fn apply(&mut self, transition: JobTransition) -> Result<(), TransitionError> {
        let to = transition.target();
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }

        match transition {
            JobTransition::Start { worker_token, at } => {
                self.started_at.get_or_insert(at);
                self.worker_token = Some(worker_token);
            }
            JobTransition::Complete { payload, at } => {
                self.result_payload = Some(payload);
                self.error_detail = None;
                self.mark_completed_at(at);
            }
            JobTransition::Fail { error, at } => {
                self.error_detail = Some(error);
                self.result_payload = None;
                self.mark_completed_at(at);
            }
        }

        self.status = to;
        Ok(())
    }

    fn mark_completed_at(&mut self, at: DateTime<Utc>) {
        if self.completed_at.is_none() {
            // Clocks differ across worker hosts; never finish before starting.
            let at = match self.started_at {
                Some(started) if started > at => started,
                _ => at,
            };
            self.completed_at = Some(at);
        }
    }

    /// Seconds between start and completion, when both are known.
    pub fn processing_time_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Status view returned by `GET /status/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_secs: Option<f64>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let mut view = JobView {
            job_id: job.id,
            status: job.status,
            model_name: job.model_name.clone(),
            created_at: job.created_at,
            progress: None,
            message: None,
            error: None,
            started_at: None,
            completed_at: None,
            processing_time_secs: None,
        };

        match job.status {
            JobStatus::Pending => {}
            JobStatus::Processing => {
                view.progress = Some("AI analyzing image...".to_string());
                view.started_at = job.started_at;
            }
            JobStatus::Completed => {
                view.message = Some("Analysis complete".to_string());
                view.started_at = job.started_at;
                view.completed_at = job.completed_at;
                view.processing_time_secs = job.processing_time_secs();
            }
            JobStatus::Failed => {
                view.error = job.error_detail.clone();
                view.completed_at = job.completed_at;
            }
        }

        view
    }
}
