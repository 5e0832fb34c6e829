use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ui_detect::{
    app_state::{AppState, Backends},
    config::{AppConfig, StorageBackend},
    db,
    routes,
    services::hub::{self, SubscriptionHub},
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

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(backend = ?config.storage_backend, "Initializing ui-detect gateway");

    let prometheus_handle =
        routes::metrics::install_recorder().expect("Failed to install Prometheus metrics recorder");

    let backends = Backends::connect(&config)
        .await
        .expect("Failed to initialize backends");

    if let Some(pool) = &backends.db {
        tracing::info!("Running database migrations");
        db::run_migrations(pool)
            .await
            .expect("Failed to run database migrations");
    }

    let cancel = CancellationToken::new();
    let hub = Arc::new(SubscriptionHub::new());

    let mut background = vec![
        tokio::spawn(hub::run_listener(
            Arc::clone(&backends.relay),
            Arc::clone(&hub),
            cancel.clone(),
        )),
        hub::start_heartbeat(Arc::clone(&hub), cancel.clone()),
    ];

    // In-memory state is private to this process, so it runs the workers too.
    if config.storage_backend == StorageBackend::Memory {
        let pool = backends
            .worker_pool(&config)
            .expect("Failed to initialize worker pool");
        background.extend(backends.spawn_workers(&config, &pool, &cancel));
    }

    let state = AppState::new(&backends, backends.gateway(&config), Arc::clone(&hub));
    let app = routes::router(state, Some(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let shutdown = cancel.clone();
    let shutdown_hub = Arc::clone(&hub);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown_hub.shutdown_all().await;
            shutdown.cancel();
        })
        .await
        .expect("Server error");

    for task in background {
        let _ = task.await;
    }
    tracing::info!("Gateway stopped");
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
