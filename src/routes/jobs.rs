use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::detection::ResultPayload;
use crate::models::job::JobView;
use crate::models::upload::{ModelInfo, ModelsResponse, Upload, UploadResponse};

const CALLBACK_HEADER: &str = "x-callback-url";

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub model_name: Option<String>,
}

/// POST /api/v1/upload: submit an image for asynchronous detection.
///
/// Multipart field `file` carries the image; `model_name` may come as a text
/// field or a query parameter. `X-Callback-URL` registers a webhook.
pub async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let mut file: Option<(Vec<u8>, String, Option<String>)> = None;
    let mut model_name = params.model_name;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let filename = field.file_name().map(str::to_string);
                let data = field.bytes().await?;
                file = Some((data.to_vec(), content_type, filename));
            }
            Some("model_name") => {
                let text = field.text().await?;
                if !text.trim().is_empty() {
                    model_name = Some(text.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let (bytes, content_type, original_filename) =
        file.ok_or_else(|| ApiError::BadRequest("Missing multipart field 'file'".to_string()))?;

    let callback_target = headers
        .get(CALLBACK_HEADER)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| ApiError::BadRequest("X-Callback-URL is not valid text".to_string()))
        })
        .transpose()?;

    let job = state
        .gateway
        .submit(Upload {
            bytes,
            content_type,
            original_filename,
            model_name,
            callback_target,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            job_id: job.id,
            status: job.status,
            message: "Image uploaded successfully".to_string(),
            created_at: job.created_at,
        }),
    ))
}

/// GET /api/v1/status/{job_id}
pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.gateway.get_status(job_id).await?))
}

/// GET /api/v1/results/{job_id}
pub async fn results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ResultPayload>> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.gateway.get_result(job_id).await?))
}

/// Ids that are not UUIDs can never match a job, so they read as unknown.
fn parse_job_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::UnknownJobId(raw.to_string()))
}

/// GET /api/v1/models
pub async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let catalog = state.gateway.catalog();
    let default = catalog.default_model();
    Json(ModelsResponse {
        models: catalog
            .models()
            .iter()
            .map(|id| ModelInfo {
                id: id.clone(),
                default: Some(id.as_str()) == default,
            })
            .collect(),
    })
}
