use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::notification::{ClientMessage, NotificationEvent, ServerMessage};
use crate::services::relay::EventRelay;

pub type ConnectionId = Uuid;

/// Frames queued per connection before it counts as slow.
const OUTBOUND_BUFFER: usize = 64;

/// How long a delivery may wait on a full connection buffer.
const SEND_TIMEOUT: Duration = Duration::from_millis(250);

const HEARTBEAT_INTERVAL_SECS: u64 = 30;

const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// What the socket task writes to the wire for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, mpsc::Sender<Outbound>>,
    by_job: HashMap<Uuid, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<Uuid>>,
}

impl HubState {
    fn remove(&mut self, conn: ConnectionId) -> bool {
        let existed = self.connections.remove(&conn).is_some();
        if let Some(jobs) = self.by_connection.remove(&conn) {
            for job_id in jobs {
                if let Some(conns) = self.by_job.get_mut(&job_id) {
                    conns.remove(&conn);
                    if conns.is_empty() {
                        self.by_job.remove(&job_id);
                    }
                }
            }
        }
        existed
    }
}

/// Per-process registry of live connections and the jobs each one watches.
///
/// Each connection owns a bounded outbound buffer. A connection that cannot
/// accept a frame within [`SEND_TIMEOUT`] is dropped so it never holds up
/// delivery to anyone else.
pub struct SubscriptionHub {
    state: RwLock<HubState>,
    send_timeout: Duration,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::with_send_timeout(SEND_TIMEOUT)
    }

    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            send_timeout,
        }
    }

    /// Register a connection and return its id plus the receiving end of its
    /// outbound buffer.
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn = Uuid::new_v4();
        self.state.write().await.connections.insert(conn, tx);
        metrics::gauge!("live_connections").increment(1.0);
        (conn, rx)
    }

    /// Forget a connection and every subscription it held.
    pub async fn disconnect(&self, conn: ConnectionId) {
        if self.state.write().await.remove(conn) {
            metrics::gauge!("live_connections").decrement(1.0);
        }
    }

    /// Returns false when the connection is unknown (already evicted).
    pub async fn subscribe(&self, conn: ConnectionId, job_ids: &[Uuid]) -> bool {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(&conn) {
            return false;
        }
        for job_id in job_ids {
            state.by_job.entry(*job_id).or_default().insert(conn);
            state.by_connection.entry(conn).or_default().insert(*job_id);
        }
        true
    }

    pub async fn unsubscribe(&self, conn: ConnectionId, job_ids: &[Uuid]) {
        let mut state = self.state.write().await;
        for job_id in job_ids {
            if let Some(conns) = state.by_job.get_mut(job_id) {
                conns.remove(&conn);
                if conns.is_empty() {
                    state.by_job.remove(job_id);
                }
            }
            if let Some(jobs) = state.by_connection.get_mut(&conn) {
                jobs.remove(job_id);
            }
        }
    }

    /// Answer one client frame.
    pub async fn handle(&self, conn: ConnectionId, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::Subscribe { job_ids } => {
                if self.subscribe(conn, &job_ids).await {
                    tracing::debug!(conn_id = %conn, count = job_ids.len(), "Subscribed to jobs");
                    ServerMessage::Subscribed { job_ids }
                } else {
                    ServerMessage::Error {
                        message: "Connection is no longer registered".to_string(),
                    }
                }
            }
            ClientMessage::Unsubscribe { job_ids } => {
                self.unsubscribe(conn, &job_ids).await;
                ServerMessage::Unsubscribed { job_ids }
            }
            ClientMessage::Ping => ServerMessage::Pong,
        }
    }

    /// Queue a direct reply on one connection, behind any pending updates.
    pub async fn reply(&self, conn: ConnectionId, message: ServerMessage) -> bool {
        let tx = self.state.read().await.connections.get(&conn).cloned();
        match tx {
            Some(tx) => tx
                .send_timeout(Outbound::Message(message), self.send_timeout)
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Push an event to every connection subscribed to its job.
    ///
    /// Sends run concurrently, so one stalled client delays the batch by at
    /// most the send timeout. Returns the number of connections reached.
    pub async fn deliver(&self, event: NotificationEvent) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = {
            let state = self.state.read().await;
            let Some(conns) = state.by_job.get(&event.job_id) else {
                return 0;
            };
            conns
                .iter()
                .filter_map(|id| state.connections.get(id).map(|tx| (*id, tx.clone())))
                .collect()
        };

        let frame = Outbound::Message(ServerMessage::from(event));
        let send_timeout = self.send_timeout;
        let results = futures::future::join_all(targets.into_iter().map(|(id, tx)| {
            let frame = frame.clone();
            async move { (id, tx.send_timeout(frame, send_timeout).await.is_ok()) }
        }))
        .await;

        let mut delivered = 0;
        let mut stale = Vec::new();
        for (id, ok) in results {
            if ok {
                delivered += 1;
            } else {
                stale.push(id);
            }
        }

        if !stale.is_empty() {
            for id in &stale {
                tracing::warn!(conn_id = %id, "Dropping slow or closed connection");
                self.disconnect(*id).await;
            }
        }
        delivered
    }

    /// Queue a heartbeat ping on every connection without waiting.
    pub async fn ping_all(&self) {
        let state = self.state.read().await;
        for tx in state.connections.values() {
            let _ = tx.try_send(Outbound::Ping);
        }
    }

    /// Ask every connection to close, then clear the registry.
    pub async fn shutdown_all(&self) {
        let mut state = self.state.write().await;
        let count = state.connections.len();
        for tx in state.connections.values() {
            let _ = tx.try_send(Outbound::Close);
        }
        *state = HubState::default();
        metrics::gauge!("live_connections").set(0.0);
        tracing::info!(count, "Closed all live connections");
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.state
            .read()
            .await
            .by_job
            .get(&job_id)
            .map_or(0, HashSet::len)
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Consume the relay and fan events out through `hub` until cancelled.
///
/// The subscription is re-opened with exponential backoff whenever it fails
/// or its stream ends.
pub async fn run_listener(
    relay: Arc<dyn EventRelay>,
    hub: Arc<SubscriptionHub>,
    cancel: CancellationToken,
) {
    let mut backoff = RECONNECT_MIN;

    loop {
        let subscription = tokio::select! {
            _ = cancel.cancelled() => return,
            result = relay.subscribe() => result,
        };

        match subscription {
            Ok(mut stream) => {
                backoff = RECONNECT_MIN;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => match next {
                            Some(event) => {
                                let job_id = event.job_id;
                                let status = event.status;
                                let reached = hub.deliver(event).await;
                                tracing::debug!(%job_id, %status, reached, "Job update fanned out");
                            }
                            None => {
                                tracing::warn!("Relay stream ended, resubscribing");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Relay subscribe failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// Spawn a task that pings every live connection periodically until cancelled.
pub fn start_heartbeat(
    hub: Arc<SubscriptionHub>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let count = hub.connection_count().await;
                    tracing::debug!(count, "Live connection heartbeat");
                    hub.ping_all().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::relay::LocalRelay;

    fn update(job_id: Uuid) -> NotificationEvent {
        NotificationEvent::failed(job_id, "boom")
    }

    #[tokio::test]
    async fn test_only_subscribers_receive_updates() {
        let hub = SubscriptionHub::new();
        let (a, mut rx_a) = hub.connect().await;
        let (_b, mut rx_b) = hub.connect().await;
        let job_id = Uuid::new_v4();

        hub.subscribe(a, &[job_id]).await;
        assert_eq!(hub.deliver(update(job_id)).await, 1);

        match rx_a.recv().await.unwrap() {
            Outbound::Message(ServerMessage::JobUpdate { job_id: got, .. }) => {
                assert_eq!(got, job_id)
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_disconnect_clean_indexes() {
        let hub = SubscriptionHub::new();
        let (conn, _rx) = hub.connect().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        hub.subscribe(conn, &[first, second]).await;
        hub.unsubscribe(conn, &[first]).await;
        assert_eq!(hub.subscriber_count(first).await, 0);
        assert_eq!(hub.subscriber_count(second).await, 1);

        hub.disconnect(conn).await;
        assert_eq!(hub.subscriber_count(second).await, 0);
        assert_eq!(hub.connection_count().await, 0);
        assert!(!hub.subscribe(conn, &[first]).await);
    }

    #[tokio::test]
    async fn test_slow_connection_is_evicted_without_blocking_others() {
        let hub = SubscriptionHub::with_send_timeout(Duration::from_millis(20));
        let job_id = Uuid::new_v4();
        let (slow, _slow_rx) = hub.connect().await;
        let (fast, mut fast_rx) = hub.connect().await;
        hub.subscribe(slow, &[job_id]).await;
        hub.subscribe(fast, &[job_id]).await;

        // Fill the slow connection's buffer; the fast one drains as it goes.
        for _ in 0..OUTBOUND_BUFFER {
            hub.deliver(update(job_id)).await;
            fast_rx.recv().await.unwrap();
        }

        let reached = hub.deliver(update(job_id)).await;
        assert_eq!(reached, 1);
        assert!(fast_rx.recv().await.is_some());
        assert_eq!(hub.connection_count().await, 1);
        assert_eq!(hub.subscriber_count(job_id).await, 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_evicted() {
        let hub = SubscriptionHub::new();
        let job_id = Uuid::new_v4();
        let (conn, rx) = hub.connect().await;
        hub.subscribe(conn, &[job_id]).await;
        drop(rx);

        assert_eq!(hub.deliver(update(job_id)).await, 0);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_handle_client_frames() {
        let hub = SubscriptionHub::new();
        let (conn, _rx) = hub.connect().await;
        let job_id = Uuid::new_v4();

        assert_eq!(hub.handle(conn, ClientMessage::Ping).await, ServerMessage::Pong);
        assert_eq!(
            hub.handle(conn, ClientMessage::Subscribe { job_ids: vec![job_id] }).await,
            ServerMessage::Subscribed { job_ids: vec![job_id] }
        );
        assert_eq!(hub.subscriber_count(job_id).await, 1);
        assert_eq!(
            hub.handle(conn, ClientMessage::Unsubscribe { job_ids: vec![job_id] }).await,
            ServerMessage::Unsubscribed { job_ids: vec![job_id] }
        );
        assert_eq!(hub.subscriber_count(job_id).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_sends_close() {
        let hub = SubscriptionHub::new();
        let (_conn, mut rx) = hub.connect().await;
        hub.shutdown_all().await;
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_listener_forwards_relay_events() {
        let relay: Arc<LocalRelay> = Arc::new(LocalRelay::default());
        let hub = Arc::new(SubscriptionHub::new());
        let cancel = CancellationToken::new();

        let (conn, mut rx) = hub.connect().await;
        let job_id = Uuid::new_v4();
        hub.subscribe(conn, &[job_id]).await;

        let listener = tokio::spawn(run_listener(relay.clone(), hub.clone(), cancel.clone()));
        while relay.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        relay.publish(&update(job_id)).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Outbound::Message(ServerMessage::JobUpdate { .. })));

        cancel.cancel();
        listener.await.unwrap();
    }
}
