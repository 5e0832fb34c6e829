//! Fleet-wide view of worker capacity.
//!
//! Every worker process heartbeats its slot count with a TTL. A process that
//! stops heartbeating (crashed, scaled away) drops out of the total once its
//! TTL lapses, so the count converges without any explicit deregistration.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::services::queue::QueueError;

/// Slot count per process id.
const WORKERS_KEY: &str = "ui_detect:workers";
/// Heartbeat expiry (unix millis) per process id.
const HEARTBEATS_KEY: &str = "ui_detect:worker_heartbeats";

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Record that `process_id` runs `slots` executions, valid for `ttl`.
    async fn heartbeat(&self, process_id: &str, slots: usize, ttl: Duration)
        -> Result<(), QueueError>;

    async fn deregister(&self, process_id: &str) -> Result<(), QueueError>;

    /// Sum of slots across processes whose heartbeat is still live.
    async fn active_workers(&self) -> Result<usize, QueueError>;
}

/// Registry kept next to the work queue in Redis.
pub struct RedisWorkerRegistry {
    client: redis::Client,
}

impl RedisWorkerRegistry {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl WorkerRegistry for RedisWorkerRegistry {
    async fn heartbeat(
        &self,
        process_id: &str,
        slots: usize,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let expires_at = (Utc::now().timestamp_millis() + ttl.as_millis() as i64) as f64;
        redis::pipe()
            .atomic()
            .hset(WORKERS_KEY, process_id, slots as u64)
            .ignore()
            .zadd(HEARTBEATS_KEY, process_id, expires_at)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn deregister(&self, process_id: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .hdel(WORKERS_KEY, process_id)
            .ignore()
            .zrem(HEARTBEATS_KEY, process_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn active_workers(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;

        let now = Utc::now().timestamp_millis() as f64;
        let stale: Vec<String> = conn.zrangebyscore(HEARTBEATS_KEY, "-inf", now).await?;
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "Pruning workers with lapsed heartbeats");
            redis::pipe()
                .atomic()
                .hdel(WORKERS_KEY, &stale)
                .ignore()
                .zrem(HEARTBEATS_KEY, &stale)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
        }

        let slots: Vec<u64> = conn.hvals(WORKERS_KEY).await?;
        Ok(slots.into_iter().sum::<u64>() as usize)
    }
}

/// In-process registry for the memory backend and tests.
#[derive(Default)]
pub struct MemoryWorkerRegistry {
    workers: Mutex<HashMap<String, (usize, Instant)>>,
}

impl MemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn heartbeat(
        &self,
        process_id: &str,
        slots: usize,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        self.workers
            .lock()
            .await
            .insert(process_id.to_string(), (slots, Instant::now() + ttl));
        Ok(())
    }

    async fn deregister(&self, process_id: &str) -> Result<(), QueueError> {
        self.workers.lock().await.remove(process_id);
        Ok(())
    }

    async fn active_workers(&self) -> Result<usize, QueueError> {
        let mut workers = self.workers.lock().await;
        let now = Instant::now();
        workers.retain(|_, (_, expires)| *expires > now);
        Ok(workers.values().map(|(slots, _)| slots).sum())
    }
}
