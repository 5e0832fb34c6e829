//! Best-effort callback delivery.
//!
//! One POST per terminal transition, bounded by a timeout, never retried.
//! A failed callback is logged and counted; it never touches the job.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::detection::ResultPayload;
use crate::models::job::{Job, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Network, DNS, timeout, etc.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

/// Body POSTed to a job's `callback_target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookPayload {
    /// `None` unless the job is terminal.
    pub fn for_job(job: &Job) -> Option<Self> {
        if !job.status.is_terminal() {
            return None;
        }
        Some(Self {
            job_id: job.id,
            status: job.status,
            results: job.result_payload.clone(),
            error: job.error_detail.clone(),
        })
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Single attempt; any non-2xx status is an error.
    pub async fn send(&self, url: &str, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let response = self.client.post(url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }

    /// Send in a detached task so the caller never waits on the remote end.
    pub fn spawn_send(self: &Arc<Self>, url: String, payload: WebhookPayload) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            match notifier.send(&url, &payload).await {
                Ok(()) => {
                    tracing::info!(job_id = %payload.job_id, url, "Webhook delivered");
                }
                Err(e) => {
                    metrics::counter!("webhook_failures_total").increment(1);
                    tracing::warn!(job_id = %payload.job_id, url, error = %e, "Webhook delivery failed");
                }
            }
        });
    }
}
