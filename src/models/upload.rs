use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::JobStatus;

/// An image submission, as received by the gateway.
#[derive(Debug, Clone, Validate)]
pub struct Upload {
    #[garde(skip)]
    pub bytes: Vec<u8>,

    #[garde(length(min = 1, max = 100))]
    pub content_type: String,

    #[garde(length(max = 500))]
    pub original_filename: Option<String>,

    #[garde(length(min = 1, max = 100))]
    pub model_name: Option<String>,

    #[garde(length(min = 1, max = 1000))]
    pub callback_target: Option<String>,
}

/// Response after submitting an image (`202 Accepted`).
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub default: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}
