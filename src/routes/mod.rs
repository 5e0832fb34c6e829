pub mod health;
pub mod jobs;
pub mod metrics;
pub mod ws;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Headroom over the upload limit for multipart framing, so an oversize
/// image reaches validation instead of being cut off by the body limit.
const BODY_LIMIT_HEADROOM: usize = 64 * 1024;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/upload", post(jobs::upload))
        .route("/status/{job_id}", get(jobs::status))
        .route("/results/{job_id}", get(jobs::results))
        .route("/models", get(jobs::models))
        .route("/ws", get(ws::live_updates))
}

/// Full application router. `/metrics` is only mounted when a Prometheus
/// handle is supplied.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let body_limit = state.gateway.max_upload_bytes() + BODY_LIMIT_HEADROOM;

    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/v1", api_router())
        .with_state(state);

    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
