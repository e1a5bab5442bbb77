use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use tally_core::SubscriberId;

use crate::broadcaster::{Delivery, SubscriberRegistry};
use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};

/// Drive one WebSocket connection until either side goes away.
///
/// The writer drains the subscriber's queue and sends heartbeat pings. The
/// reader answers RPC requests in arrival order, so a connection's own
/// mutations are applied in the order it sent them. A reply waits for queue
/// room rather than being dropped.
pub async fn handle_ws_connection(
    socket: WebSocket,
    subscriber_id: SubscriberId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<SubscriberRegistry>,
    state: Arc<HandlerState>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = subscriber_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Default::default())).await.is_err() {
                        break;
                    }
                    tracing::trace!(subscriber_id = %writer_id, "sent ping");
                }
            }
        }
    });

    let reader_id = subscriber_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    reader_registry.touch(&reader_id);
                    let reply = handle_text(&state, &reader_id, text.as_str()).await;
                    if reader_registry.reply_to(&reader_id, reply).await == Delivery::Gone {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_registry.touch(&reader_id),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.disconnect(&subscriber_id);
    tracing::info!(subscriber_id = %subscriber_id, "websocket client disconnected");
}

/// Parse, dispatch and serialize one inbound frame.
pub async fn handle_text(state: &Arc<HandlerState>, subscriber_id: &SubscriberId, raw: &str) -> String {
    let response = match serde_json::from_str::<RpcRequest>(raw) {
        Ok(request) => {
            let params = request.params.unwrap_or_else(|| serde_json::json!({}));
            handlers::dispatch(state, &request.method, &params, request.id, Some(subscriber_id)).await
        }
        Err(_) => RpcResponse::parse_error(),
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize rpc response");
        r#"{"id":null,"success":false,"error":{"code":"INTERNAL_ERROR","message":"serialize response"}}"#.to_string()
    })
}
