use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::services::gateway::GatewayError;

/// Error type for HTTP handlers. Renders `{"error": ..., "code": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A path id that cannot name any job.
    #[error("Unknown job id: {0}")]
    UnknownJobId(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Gateway(err) => match err {
                GatewayError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                GatewayError::NotReady(_) => (StatusCode::BAD_REQUEST, "NOT_READY", err.to_string()),
                GatewayError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", "Job not found".to_string())
                }
                GatewayError::Storage(e) => {
                    tracing::error!(error = %e, "Object storage error");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "STORAGE_UNAVAILABLE",
                        "Image storage is unavailable".to_string(),
                    )
                }
                GatewayError::Queue(e) => {
                    tracing::error!(error = %e, "Work queue error");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "QUEUE_UNAVAILABLE",
                        "Job queue is unavailable".to_string(),
                    )
                }
                GatewayError::Persistence(e) => {
                    tracing::error!(error = %e, "Job store error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::UnknownJobId(_) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", "Job not found".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let body = json!({
            "error": message,
            "code": code,
        });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;
    use crate::services::job_store::StoreError;
    use uuid::Uuid;

    fn status_of(err: GatewayError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(GatewayError::Validation("File must be an image".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(GatewayError::NotReady(JobStatus::Processing)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(GatewayError::NotFound(Uuid::new_v4())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(GatewayError::Persistence(StoreError::Corrupt("x".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(GatewayError::Storage(crate::services::storage::StorageError::Status(500))),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_unparseable_job_id_reads_as_not_found() {
        let err = ApiError::UnknownJobId("abc".into());
        let (status, code, message) = err.parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "NOT_FOUND");
        assert_eq!(message, "Job not found");
    }

    #[test]
    fn test_internal_details_are_not_leaked() {
        let err = ApiError::from(GatewayError::Persistence(StoreError::Corrupt(
            "secret row detail".into(),
        )));
        let (_, code, message) = err.parts();
        assert_eq!(code, "INTERNAL_ERROR");
        assert!(!message.contains("secret"));
    }
}
