//! Test helper utilities shared by the HTTP-level tests

use std::time::Duration;

use reqwest::multipart;
use tokio::time::sleep;
use ui_detect::models::detection::ResultPayload;
use ui_detect::models::job::{JobStatus, JobView};
use ui_detect::models::upload::UploadResponse;
use uuid::Uuid;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Error body rendered by the API: `{"error": ..., "code": ...}`.
#[derive(Debug, serde::Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// Build the multipart body for `POST /api/v1/upload`.
pub fn upload_form(
    bytes: Vec<u8>,
    filename: &str,
    mime: &str,
    model_name: Option<&str>,
) -> TestResult<multipart::Form> {
    let mut form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)?,
    );
    if let Some(model) = model_name {
        form = form.text("model_name", model.to_string());
    }
    Ok(form)
}

/// Upload an image and return the accepted job.
pub async fn upload_image(
    client: &reqwest::Client,
    base_url: &str,
    bytes: Vec<u8>,
    filename: &str,
    model_name: Option<&str>,
    callback_url: Option<&str>,
) -> TestResult<UploadResponse> {
    let form = upload_form(bytes, filename, "image/png", model_name)?;

    let mut request = client
        .post(format!("{}/api/v1/upload", base_url))
        .multipart(form);
    if let Some(url) = callback_url {
        request = request.header("X-Callback-URL", url);
    }
    let response = request.send().await?;

    let status = response.status();
    if status != reqwest::StatusCode::ACCEPTED {
        let error_text = response.text().await?;
        return Err(format!("Upload failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<UploadResponse>().await?)
}

pub async fn get_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
) -> TestResult<JobView> {
    let response = client
        .get(format!("{}/api/v1/status/{}", base_url, job_id))
        .send()
        .await?;

    if !response.status().is_success() {
        let error_text = response.text().await?;
        return Err(format!("Status check failed: {}", error_text).into());
    }
    Ok(response.json::<JobView>().await?)
}

pub async fn get_results(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
) -> TestResult<ResultPayload> {
    let response = client
        .get(format!("{}/api/v1/results/{}", base_url, job_id))
        .send()
        .await?;

    if !response.status().is_success() {
        let error_text = response.text().await?;
        return Err(format!("Results fetch failed: {}", error_text).into());
    }
    Ok(response.json::<ResultPayload>().await?)
}

/// Poll job status until completed or failed (with timeout)
pub async fn poll_until_terminal(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
    timeout: Duration,
) -> TestResult<JobView> {
    let interval = Duration::from_millis(50);
    let max_attempts = (timeout.as_millis() / interval.as_millis()).max(1);

    for _ in 0..max_attempts {
        let view = get_status(client, base_url, job_id).await?;
        match view.status {
            JobStatus::Completed | JobStatus::Failed => return Ok(view),
            JobStatus::Pending | JobStatus::Processing => sleep(interval).await,
        }
    }

    Err(format!("Job {} did not finish within {:?}", job_id, timeout).into())
}
