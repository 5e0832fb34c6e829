use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::app_state::AppState;
use crate::models::notification::{ClientMessage, ServerMessage};
use crate::services::hub::{Outbound, SubscriptionHub};

/// How long a goodbye Close frame may take on a stalled socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// GET /api/v1/ws: live job updates.
pub async fn live_updates(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<SubscriptionHub>) {
    let (conn, rx) = hub.connect().await;
    tracing::info!(conn_id = %conn, "Live connection opened");

    let (sink, mut stream) = socket.split();
    let mut send_task = tokio::spawn(pump_outbound(rx, sink));

    loop {
        tokio::select! {
            // The hub dropped this connection (evicted or shutting down).
            _ = &mut send_task => {
                tracing::info!(conn_id = %conn, "Live connection dropped by hub");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(msg) => hub.handle(conn, msg).await,
                        Err(e) => ServerMessage::Error {
                            message: format!("Invalid message: {e}"),
                        },
                    };
                    if !hub.reply(conn, reply).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Pong(_))) => {
                    tracing::trace!(conn_id = %conn, "Pong received");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn, error = %e, "Live connection receive error");
                    break;
                }
            },
        }
    }

    hub.disconnect(conn).await;
    send_task.abort();
    tracing::info!(conn_id = %conn, "Live connection closed");
}

/// Write queued frames to the socket until the hub lets go of the connection,
/// then send a Close frame so the client knows updates have stopped.
async fn pump_outbound<S>(mut rx: mpsc::Receiver<Outbound>, mut sink: S)
where
    S: Sink<Message> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            Outbound::Message(msg) => match serde_json::to_string(&msg) {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode live frame");
                    continue;
                }
            },
            Outbound::Ping => Message::Ping(Bytes::new()),
            Outbound::Close => break,
        };
        if sink.send(message).await.is_err() {
            return;
        }
    }
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::notification::NotificationEvent;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_evicted_connection_is_sent_close() {
        let hub = SubscriptionHub::with_send_timeout(Duration::from_millis(10));
        let (conn, rx) = hub.connect().await;
        let job_id = Uuid::new_v4();
        assert!(hub.subscribe(conn, &[job_id]).await);

        // Nobody drains the buffer, so it fills until the hub gives up.
        let mut delivered = 0;
        while hub
            .deliver(NotificationEvent::failed(job_id, "boom"))
            .await
            == 1
        {
            delivered += 1;
        }
        assert_eq!(hub.connection_count().await, 0);

        let (sink, mut written) = futures::channel::mpsc::unbounded::<Message>();
        tokio::time::timeout(Duration::from_secs(2), pump_outbound(rx, sink))
            .await
            .expect("pump should stop once the hub drops the connection");

        let mut frames = Vec::new();
        while let Ok(Some(frame)) = written.try_next() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), delivered + 1);
        assert!(matches!(frames.last(), Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_shutdown_close_is_forwarded() {
        let hub = SubscriptionHub::new();
        let (_conn, rx) = hub.connect().await;
        hub.shutdown_all().await;

        let (sink, mut written) = futures::channel::mpsc::unbounded::<Message>();
        pump_outbound(rx, sink).await;

        assert!(matches!(written.try_next(), Ok(Some(Message::Close(None)))));
        assert!(matches!(written.try_next(), Ok(None)));
    }
}
