//! Cross-process broadcast of job notifications.
//!
//! Workers publish a [`NotificationEvent`] after every persisted transition;
//! each gateway process holds one subscription and fans events out to its own
//! live connections. Delivery is best-effort: a subscriber that is not
//! listening when an event is published never sees it.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use crate::models::notification::NotificationEvent;

const CHANNEL: &str = "ui_detect:job_updates";

/// Upper bound on one publish, connection included.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Default buffer capacity for the in-process broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

pub type EventStream = BoxStream<'static, NotificationEvent>;

#[async_trait]
pub trait EventRelay: Send + Sync {
    async fn publish(&self, event: &NotificationEvent) -> Result<(), RelayError>;

    /// Open a new subscription. The stream ends if the transport drops.
    async fn subscribe(&self) -> Result<EventStream, RelayError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Relay did not respond within {0:?}")]
    Timeout(Duration),
}

/// Redis pub/sub relay, shared by worker and gateway processes.
///
/// Publishing is bounded by a timeout so a stalled Redis never holds up the
/// worker that emits the event.
pub struct RedisRelay {
    client: redis::Client,
    publish_timeout: Duration,
}

impl RedisRelay {
    pub fn new(redis_url: &str) -> Result<Self, RelayError> {
        Self::with_publish_timeout(redis_url, PUBLISH_TIMEOUT)
    }

    pub fn with_publish_timeout(
        redis_url: &str,
        publish_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            publish_timeout,
        })
    }

    async fn publish_now(&self, payload: String) -> Result<i64, RelayError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.publish(CHANNEL, payload).await?)
    }
}

#[async_trait]
impl EventRelay for RedisRelay {
    async fn publish(&self, event: &NotificationEvent) -> Result<(), RelayError> {
        let payload = serde_json::to_string(event)?;
        let receivers = tokio::time::timeout(self.publish_timeout, self.publish_now(payload))
            .await
            .map_err(|_| RelayError::Timeout(self.publish_timeout))??;
        tracing::debug!(
            job_id = %event.job_id,
            status = %event.status,
            receivers,
            "Published job update"
        );
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, RelayError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(CHANNEL).await?;
        tracing::info!(channel = CHANNEL, "Subscribed to job update channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "Non-text relay payload dropped");
                    return None;
                }
            };
            match serde_json::from_str::<NotificationEvent>(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Undecodable relay payload dropped");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}

/// In-process relay backed by a `tokio::sync::broadcast` channel.
pub struct LocalRelay {
    sender: broadcast::Sender<NotificationEvent>,
}

impl LocalRelay {
    /// When the buffer is full the oldest events are dropped and slow
    /// subscribers skip ahead.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Open subscriptions on this relay.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventRelay for LocalRelay {
    async fn publish(&self, event: &NotificationEvent) -> Result<(), RelayError> {
        // A send error only means nobody is subscribed.
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, RelayError> {
        let rx = self.sender.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Relay subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
