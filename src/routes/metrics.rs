use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Install the global Prometheus recorder and register metric descriptions.
pub fn install_recorder() -> Result<Arc<PrometheusHandle>, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(Arc::new(handle))
}

fn describe() {
    metrics::describe_counter!("jobs_submitted_total", "Detection jobs accepted by the gateway");
    metrics::describe_counter!("jobs_completed_total", "Detection jobs that reached completed");
    metrics::describe_counter!("jobs_failed_total", "Detection jobs that reached failed");
    metrics::describe_counter!(
        "jobs_requeued_total",
        "Deliveries handed back to the queue by a worker"
    );
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time from claim to terminal state for one execution"
    );
    metrics::describe_gauge!("queue_depth", "Deliveries waiting in the work queue");
    metrics::describe_gauge!("active_executions", "Executions running in this process");
    metrics::describe_gauge!(
        "scaling_recommendation",
        "Latest scaling signal: 1 scale up, -1 scale down, 0 hold"
    );
    metrics::describe_gauge!("fleet_workers", "Worker slots across live worker processes");
    metrics::describe_gauge!("live_connections", "Open live-update connections");
    metrics::describe_counter!("webhook_failures_total", "Callback deliveries that failed");
    metrics::describe_counter!("sweep_deleted_total", "Expired jobs removed by the retention sweep");
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
