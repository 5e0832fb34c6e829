use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::detection::ResultPayload;
use crate::models::job::JobStatus;

/// Published once per persisted job transition. Never persisted, never replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub detail: EventDetail,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventDetail {
    pub status: JobStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotificationEvent {
    pub fn processing(job_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self::new(
            job_id,
            EventDetail {
                status: JobStatus::Processing,
                message: "AI analyzing image...".to_string(),
                started_at: Some(started_at),
                results: None,
                error: None,
            },
        )
    }

    pub fn completed(job_id: Uuid, results: ResultPayload) -> Self {
        Self::new(
            job_id,
            EventDetail {
                status: JobStatus::Completed,
                message: "Analysis complete".to_string(),
                started_at: None,
                results: Some(results),
                error: None,
            },
        )
    }

    pub fn failed(job_id: Uuid, error: impl Into<String>) -> Self {
        Self::new(
            job_id,
            EventDetail {
                status: JobStatus::Failed,
                message: "Processing failed".to_string(),
                started_at: None,
                results: None,
                error: Some(error.into()),
            },
        )
    }

    fn new(job_id: Uuid, detail: EventDetail) -> Self {
        Self {
            job_id,
            status: detail.status,
            detail,
            published_at: Utc::now(),
        }
    }
}

/// Frames a client sends over the live channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { job_ids: Vec<Uuid> },
    Unsubscribe { job_ids: Vec<Uuid> },
    Ping,
}

/// Frames the server pushes over the live channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JobUpdate { job_id: Uuid, data: EventDetail },
    Subscribed { job_ids: Vec<Uuid> },
    Unsubscribed { job_ids: Vec<Uuid> },
    Pong,
    Error { message: String },
}

impl From<NotificationEvent> for ServerMessage {
    fn from(event: NotificationEvent) -> Self {
        ServerMessage::JobUpdate {
            job_id: event.job_id,
            data: event.detail,
        }
    }
}
