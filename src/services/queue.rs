use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

const QUEUE_KEY: &str = "ui_detect:queue";
const PROCESSING_KEY: &str = "ui_detect:processing";
const LEASES_KEY: &str = "ui_detect:leases";
const DEAD_KEY: &str = "ui_detect:dead";

/// Moves an in-flight entry to `KEYS[3]` only if it is still in flight, so an
/// ack racing a redelivery never produces a second copy.
const RELEASE_SCRIPT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
if removed == 0 then
    return 0
end
redis.call('LPUSH', KEYS[3], ARGV[2])
return 1
"#;

/// Payload carried from the gateway to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMessage {
    pub job_id: Uuid,
    pub image_ref: String,
    pub model_name: String,
}

/// Queue envelope. A fresh envelope (same `id`, next `attempt`) is created for
/// every redelivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    pub id: Uuid,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub message: ExecutionMessage,
}

impl Delivery {
    pub fn new(message: ExecutionMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt: 1,
            enqueued_at: Utc::now(),
            message,
        }
    }

    /// Identifies this delivery attempt; recorded on the job as `worker_token`.
    pub fn token(&self) -> String {
        format!("{}-{}", self.id, self.attempt)
    }

    pub fn redelivery(&self) -> Self {
        Self {
            id: self.id,
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            message: self.message.clone(),
        }
    }
}

/// Returned with each dequeued delivery; required to ack or nack it.
#[derive(Debug, Clone)]
pub struct AckHandle {
    pub token: String,
    raw: String,
}

#[derive(Debug, Clone)]
pub struct Dequeued {
    pub delivery: Delivery,
    pub handle: AckHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
    /// The delivery was no longer in flight (already acked or expired).
    NotInFlight,
}

/// Result of one pass over expired leases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpiredLeases {
    pub requeued: usize,
    /// Deliveries that ran out of attempts; their jobs still need a verdict.
    pub dead_lettered: Vec<Delivery>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Hard ceiling after which an unacknowledged delivery is redelivered.
    pub hard_deadline: Duration,
    /// Deliveries beyond this count go to the dead-letter list.
    pub max_deliveries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            hard_deadline: Duration::from_secs(300),
            max_deliveries: 5,
        }
    }
}

/// Durable, at-least-once delivery channel between the gateway and workers.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Returns the delivery token of the first attempt.
    async fn enqueue(&self, message: &ExecutionMessage) -> Result<String, QueueError>;

    /// Wait up to `wait` for the next delivery.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Dequeued>, QueueError>;

    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError>;

    /// Hand the message back for redelivery.
    async fn nack(&self, handle: &AckHandle) -> Result<NackOutcome, QueueError>;

    /// Redeliver in-flight messages whose hard deadline has passed.
    async fn requeue_expired(&self) -> Result<ExpiredLeases, QueueError>;

    /// Number of deliveries waiting to be picked up.
    async fn size(&self) -> Result<u64, QueueError>;

    async fn in_flight(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed reliable queue: `BRPOPLPUSH` into a processing list plus a
/// sorted set of lease deadlines.
pub struct RedisWorkQueue {
    client: redis::Client,
    settings: QueueSettings,
    release: redis::Script,
}

impl RedisWorkQueue {
    pub fn new(redis_url: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            settings,
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    fn lease_deadline(&self) -> f64 {
        (Utc::now() + self.settings.hard_deadline).timestamp() as f64
    }

    /// Move `raw` out of the processing list into the queue (or dead letters).
    async fn release(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        raw: &str,
    ) -> Result<NackOutcome, QueueError> {
        let (target, next_raw, outcome) = match serde_json::from_str::<Delivery>(raw) {
            Ok(delivery) => {
                let next = delivery.redelivery();
                if next.attempt > self.settings.max_deliveries {
                    tracing::error!(
                        job_id = %delivery.message.job_id,
                        attempt = delivery.attempt,
                        "Delivery exceeded max attempts, moving to dead letters"
                    );
                    (DEAD_KEY, raw.to_string(), NackOutcome::DeadLettered)
                } else {
                    let next_raw = serde_json::to_string(&next).map_err(QueueError::Serialize)?;
                    (QUEUE_KEY, next_raw, NackOutcome::Requeued)
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Undecodable delivery, moving to dead letters");
                (DEAD_KEY, raw.to_string(), NackOutcome::DeadLettered)
            }
        };

        let moved: i64 = self
            .release
            .key(PROCESSING_KEY)
            .key(LEASES_KEY)
            .key(target)
            .arg(raw)
            .arg(&next_raw)
            .invoke_async(conn)
            .await
            .map_err(QueueError::Redis)?;

        Ok(if moved == 0 { NackOutcome::NotInFlight } else { outcome })
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, message: &ExecutionMessage) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let delivery = Delivery::new(message.clone());
        let payload = serde_json::to_string(&delivery).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(delivery.token())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Dequeued>, QueueError> {
        // A blocking pop holds the connection, so give it its own response timeout.
        let mut conn = self
            .client
            .get_multiplexed_async_connection_with_timeouts(
                wait + Duration::from_secs(5),
                Duration::from_secs(5),
            )
            .await
            .map_err(QueueError::Redis)?;

        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(QUEUE_KEY)
            .arg(PROCESSING_KEY)
            .arg(wait.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        conn.zadd::<_, _, _, ()>(LEASES_KEY, &raw, self.lease_deadline())
            .await
            .map_err(QueueError::Redis)?;

        match serde_json::from_str::<Delivery>(&raw) {
            Ok(delivery) => Ok(Some(Dequeued {
                handle: AckHandle {
                    token: delivery.token(),
                    raw,
                },
                delivery,
            })),
            Err(e) => {
                self.release(&mut conn, &raw).await?;
                Err(QueueError::Serialize(e))
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &handle.raw)
            .ignore()
            .zrem(LEASES_KEY, &handle.raw)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle) -> Result<NackOutcome, QueueError> {
        let mut conn = self.connection().await?;
        self.release(&mut conn, &handle.raw).await
    }

    async fn requeue_expired(&self) -> Result<ExpiredLeases, QueueError> {
        let mut conn = self.connection().await?;

        // Entries popped by a worker that died before recording its lease.
        let in_flight: Vec<String> = conn
            .lrange(PROCESSING_KEY, 0, -1)
            .await
            .map_err(QueueError::Redis)?;
        for raw in &in_flight {
            redis::cmd("ZADD")
                .arg(LEASES_KEY)
                .arg("NX")
                .arg(self.lease_deadline())
                .arg(raw)
                .query_async::<()>(&mut conn)
                .await
                .map_err(QueueError::Redis)?;
        }

        let now = Utc::now().timestamp() as f64;
        let expired: Vec<String> = conn
            .zrangebyscore(LEASES_KEY, "-inf", now)
            .await
            .map_err(QueueError::Redis)?;

        let mut report = ExpiredLeases::default();
        for raw in &expired {
            match self.release(&mut conn, raw).await? {
                NackOutcome::Requeued => report.requeued += 1,
                NackOutcome::DeadLettered => {
                    if let Ok(delivery) = serde_json::from_str::<Delivery>(raw) {
                        report.dead_lettered.push(delivery);
                    }
                }
                NackOutcome::NotInFlight => {}
            }
        }

        if report.requeued > 0 || !report.dead_lettered.is_empty() {
            tracing::warn!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered.len(),
                "Released deliveries past their hard deadline"
            );
        }
        Ok(report)
    }

    async fn size(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let count: u64 = conn.llen(PROCESSING_KEY).await.map_err(QueueError::Redis)?;
        Ok(count)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueueState {
    pending: VecDeque<Delivery>,
    in_flight: HashMap<String, (Delivery, Instant)>,
    dead: Vec<Delivery>,
}

/// In-process queue with the same lease semantics as [`RedisWorkQueue`].
pub struct MemoryWorkQueue {
    state: Mutex<MemoryQueueState>,
    available: Notify,
    settings: QueueSettings,
}

impl MemoryWorkQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            available: Notify::new(),
            settings,
        }
    }

    pub async fn dead_letters(&self) -> Vec<Delivery> {
        self.state.lock().await.dead.clone()
    }

    async fn try_take(&self) -> Option<Dequeued> {
        let mut state = self.state.lock().await;
        let delivery = state.pending.pop_back()?;
        let token = delivery.token();
        let deadline = Instant::now() + self.settings.hard_deadline;
        state
            .in_flight
            .insert(token.clone(), (delivery.clone(), deadline));
        Some(Dequeued {
            handle: AckHandle {
                raw: token.clone(),
                token,
            },
            delivery,
        })
    }

    fn release_locked(&self, state: &mut MemoryQueueState, delivery: Delivery) -> NackOutcome {
        let next = delivery.redelivery();
        if next.attempt > self.settings.max_deliveries {
            tracing::error!(
                job_id = %delivery.message.job_id,
                attempt = delivery.attempt,
                "Delivery exceeded max attempts, moving to dead letters"
            );
            state.dead.push(delivery);
            NackOutcome::DeadLettered
        } else {
            state.pending.push_front(next);
            self.available.notify_one();
            NackOutcome::Requeued
        }
    }
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, message: &ExecutionMessage) -> Result<String, QueueError> {
        let delivery = Delivery::new(message.clone());
        let token = delivery.token();
        self.state.lock().await.pending.push_front(delivery);
        self.available.notify_one();
        Ok(token)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Dequeued>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            if let Some(dequeued) = self.try_take().await {
                return Ok(Some(dequeued));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        self.state.lock().await.in_flight.remove(&handle.raw);
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle) -> Result<NackOutcome, QueueError> {
        let mut state = self.state.lock().await;
        match state.in_flight.remove(&handle.raw) {
            Some((delivery, _)) => Ok(self.release_locked(&mut state, delivery)),
            None => Ok(NackOutcome::NotInFlight),
        }
    }

    async fn requeue_expired(&self) -> Result<ExpiredLeases, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();

        let mut report = ExpiredLeases::default();
        for token in &expired {
            let Some((delivery, _)) = state.in_flight.remove(token) else {
                continue;
            };
            match self.release_locked(&mut state, delivery.clone()) {
                NackOutcome::Requeued => report.requeued += 1,
                NackOutcome::DeadLettered => report.dead_lettered.push(delivery),
                NackOutcome::NotInFlight => {}
            }
        }
        Ok(report)
    }

    async fn size(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.pending.len() as u64)
    }

    async fn in_flight(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.in_flight.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
