use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ui_detect::{
    app_state::Backends,
    config::{AppConfig, StorageBackend},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting detection worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    if config.storage_backend == StorageBackend::Memory {
        // A separate process cannot see the gateway's in-memory queue.
        tracing::error!("STORAGE_BACKEND=memory runs workers inside the gateway; refusing to start");
        std::process::exit(2);
    }

    let backends = Backends::connect(&config)
        .await
        .expect("Failed to initialize backends");

    let pool = backends
        .worker_pool(&config)
        .expect("Failed to initialize worker pool");

    let cancel = CancellationToken::new();
    let handles = backends.spawn_workers(&config, &pool, &cancel);

    tracing::info!(
        concurrency = pool.stats().slots,
        "Worker ready, consuming work queue"
    );

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining in-flight executions");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task ended abnormally");
        }
    }
    tracing::info!("Worker stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
