//! PostgreSQL pool setup and schema migrations for the job store.

pub mod queries;

use sqlx::migrate::MigrateError;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Connections kept open while idle.
const MIN_CONNECTIONS: u32 = 1;

pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(MIN_CONNECTIONS.min(max_connections))
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await?;
    tracing::info!(max_connections, "PostgreSQL pool ready");
    Ok(pool)
}

/// Apply pending migrations from `migrations/`. Already-applied ones are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
