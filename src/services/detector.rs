use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use garde::Validate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::models::detection::{Annotation, Detection, ImageDimensions};

const SYSTEM_PROMPT: &str = concat!(
    "You are a multimodal assistant that identifies user-interface elements in an image. ",
    "Given an image of a web or mobile UI, detect up to 20 elements of the following types: ",
    "button, input, radio, dropdown. For every detected element, output a JSON object with the ",
    "keys: x, y, width, height, tag. The (x, y) represent the top-left corner in pixels, ",
    "width and height are in pixels, tag is one of: button, input, radio, dropdown. ",
    "Return your response as a JSON object with a key 'annotations' containing an array of ",
    "detected elements and, if known, a key 'dimensions' with the image width and height. ",
    "Example: {\"annotations\": [{\"x\": 100, \"y\": 200, \"width\": 100, \"height\": 50, \"tag\": \"button\"}]}"
);

const USER_PROMPT: &str = "Here is the image";

/// HTTP timeout for a single model call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Black-box UI element detector.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: &[u8], mime: &str, model: &str)
        -> Result<Detection, DetectorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    /// Rate limits, 5xx responses and network blips. Worth retrying.
    #[error("Transient detector error: {0}")]
    Transient(String),

    /// The model answered, but not with usable annotations.
    #[error("Malformed detector response: {0}")]
    Malformed(String),

    /// The provider refused the request (bad model name, auth, payload).
    #[error("Detector rejected request with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl DetectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DetectorError::Transient(_))
    }
}

impl From<reqwest::Error> for DetectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            DetectorError::Malformed(e.to_string())
        } else {
            DetectorError::Transient(e.to_string())
        }
    }
}

/// Bounded exponential backoff for transient detector failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Call the detector, retrying transient errors per `policy`.
pub async fn detect_with_retry(
    detector: &dyn Detector,
    image: &[u8],
    mime: &str,
    model: &str,
    policy: &RetryPolicy,
) -> Result<Detection, DetectorError> {
    let mut attempt = 1;
    loop {
        match detector.detect(image, mime, model).await {
            Ok(detection) => return Ok(detection),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient detector error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Parse the model's text output into validated annotations.
pub fn parse_detection(content: &str) -> Result<Detection, DetectorError> {
    let body = strip_code_fence(content.trim());
    if body.is_empty() {
        return Err(DetectorError::Malformed(
            "Model returned empty response".to_string(),
        ));
    }

    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| DetectorError::Malformed(format!("invalid JSON: {e}")))?;

    let raw_annotations = match value.get("annotations") {
        Some(serde_json::Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(DetectorError::Malformed(
                "Annotations must be a list".to_string(),
            ))
        }
        None => Vec::new(),
    };

    let mut annotations = Vec::with_capacity(raw_annotations.len());
    for (i, raw) in raw_annotations.into_iter().enumerate() {
        let ann: Annotation = serde_json::from_value(raw)
            .map_err(|e| DetectorError::Malformed(format!("annotation {i}: {e}")))?;
        ann.validate()
            .map_err(|e| DetectorError::Malformed(format!("annotation {i}: {e}")))?;
        annotations.push(ann);
    }

    let dimensions = value
        .get("dimensions")
        .and_then(|d| serde_json::from_value::<ImageDimensions>(d.clone()).ok());

    Ok(Detection {
        annotations,
        dimensions,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop an optional language tag on the opening fence.
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Read width and height from the image header, if the format is recognized.
pub fn read_dimensions(image: &[u8]) -> Option<ImageDimensions> {
    let (width, height) = image::ImageReader::new(Cursor::new(image))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()?;
    Some(ImageDimensions { width, height })
}

/// Client for an OpenAI-compatible chat-completions endpoint serving
/// multimodal models (Cloudflare Workers AI, OpenRouter, vLLM, ...).
pub struct ChatCompletionsClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl ChatCompletionsClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, DetectorError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DetectorError::Transient(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl Detector for ChatCompletionsClient {
    async fn detect(
        &self,
        image: &[u8],
        mime: &str,
        model: &str,
    ) -> Result<Detection, DetectorError> {
        let url = format!("{}/chat/completions", self.base_url);
        let data_uri = format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(image)
        );

        let request_body = serde_json::json!({
            "model": model,
            "temperature": 0.1,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": USER_PROMPT },
                        { "type": "image_url", "image_url": { "url": data_uri } }
                    ]
                }
            ]
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(DetectorError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        parse_detection(&content)
    }
}

/// The set of model names the gateway accepts.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("No detector models configured")]
    Empty,

    #[error("Model '{name}' not found{}", suggestion_hint(.suggestion))]
    Unknown {
        name: String,
        suggestion: Option<String>,
    },
}

fn suggestion_hint(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{s}'?)"),
        None => String::new(),
    }
}

/// Minimum Jaro-Winkler similarity for a "did you mean" hint.
const SUGGESTION_THRESHOLD: f64 = 0.8;

impl ModelCatalog {
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = Vec::new();
        for m in models {
            let m: String = m.into();
            let m = m.trim().to_string();
            if !m.is_empty() && !seen.contains(&m) {
                seen.push(m);
            }
        }
        Self { models: seen }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// The first configured model is used when a submission names none.
    pub fn default_model(&self) -> Option<&str> {
        self.models.first().map(String::as_str)
    }

    pub fn resolve(&self, requested: Option<&str>) -> Result<String, CatalogError> {
        let Some(name) = requested.map(str::trim).filter(|n| !n.is_empty()) else {
            return self
                .default_model()
                .map(str::to_string)
                .ok_or(CatalogError::Empty);
        };

        if self.models.iter().any(|m| m == name) {
            return Ok(name.to_string());
        }

        let suggestion = self
            .models
            .iter()
            .map(|m| (m, strsim::jaro_winkler(&m.to_lowercase(), &name.to_lowercase())))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(m, _)| m.clone());

        Err(CatalogError::Unknown {
            name: name.to_string(),
            suggestion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::detection::Tag;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_parse_single_button() {
        let detection = parse_detection(
            r#"{"annotations": [{"x": 10, "y": 10, "width": 20, "height": 20, "tag": "button"}]}"#,
        )
        .unwrap();
        assert_eq!(detection.annotations.len(), 1);
        assert_eq!(detection.annotations[0].tag, Tag::Button);
        assert!(detection.dimensions.is_none());
    }

    #[test]
    fn test_parse_fenced_output_with_dimensions() {
        let content = "```json\n{\"annotations\": [], \"dimensions\": {\"width\": 800, \"height\": 600}}\n```";
        let detection = parse_detection(content).unwrap();
        assert!(detection.annotations.is_empty());
        assert_eq!(
            detection.dimensions,
            Some(ImageDimensions {
                width: 800,
                height: 600
            })
        );
    }

    #[test]
    fn test_empty_response_is_malformed() {
        let err = parse_detection("   ").unwrap_err();
        assert!(matches!(err, DetectorError::Malformed(_)));
        assert!(err.to_string().contains("empty response"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_annotations_must_be_a_list() {
        let err = parse_detection(r#"{"annotations": {"x": 1}}"#).unwrap_err();
        assert!(err.to_string().contains("must be a list"));
    }

    #[test]
    fn test_invalid_annotation_rejected() {
        let err = parse_detection(
            r#"{"annotations": [{"x": 1, "y": 1, "width": 0, "height": 5, "tag": "input"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DetectorError::Malformed(_)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    struct FlakyDetector {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl Detector for FlakyDetector {
        async fn detect(&self, _: &[u8], _: &str, _: &str) -> Result<Detection, DetectorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(DetectorError::Transient("429".to_string()))
            } else {
                Ok(Detection {
                    annotations: vec![],
                    dimensions: None,
                })
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let detector = FlakyDetector {
            calls: AtomicU32::new(0),
            fail_times: 2,
        };
        let result = detect_with_retry(&detector, b"", "image/png", "m1", &fast_policy(3)).await;
        assert!(result.is_ok());
        assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let detector = FlakyDetector {
            calls: AtomicU32::new(0),
            fail_times: 10,
        };
        let result = detect_with_retry(&detector, b"", "image/png", "m1", &fast_policy(3)).await;
        assert!(matches!(result, Err(DetectorError::Transient(_))));
        assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_catalog_defaults_to_first_model() {
        let catalog = ModelCatalog::new(["m1", "m2", "m1", " "]);
        assert_eq!(catalog.models(), &["m1".to_string(), "m2".to_string()]);
        assert_eq!(catalog.resolve(None).unwrap(), "m1");
        assert_eq!(catalog.resolve(Some("")).unwrap(), "m1");
        assert_eq!(catalog.resolve(Some("m2")).unwrap(), "m2");
    }

    #[test]
    fn test_catalog_suggests_close_name() {
        let catalog = ModelCatalog::new(["gemini-2.5-pro", "gpt-4o"]);
        match catalog.resolve(Some("gemini-2.5-pr")) {
            Err(CatalogError::Unknown { suggestion, .. }) => {
                assert_eq!(suggestion.as_deref(), Some("gemini-2.5-pro"));
            }
            other => panic!("expected unknown model, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_catalog_has_no_default() {
        let catalog = ModelCatalog::new(Vec::<String>::new());
        assert!(matches!(catalog.resolve(None), Err(CatalogError::Empty)));
    }

    #[test]
    fn test_read_dimensions_from_png() {
        let img = image::RgbImage::new(32, 16);
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        assert_eq!(
            read_dimensions(&bytes),
            Some(ImageDimensions {
                width: 32,
                height: 16
            })
        );
        assert_eq!(read_dimensions(b"not an image"), None);
    }
}
