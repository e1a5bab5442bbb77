//! [`SyncTransport`] over the server's WebSocket JSON-RPC endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use tally_core::{SessionId, SessionView, WireEvent};

use crate::error::SyncError;
use crate::transport::{EventStream, SyncEvent, SyncTransport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 64;

pub struct WsTransport {
    url: String,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl WsTransport {
    /// `url` is the server's WebSocket endpoint, e.g. `ws://host:9091/ws`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(10),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<WsStream, SyncError> {
        let (ws, _) = tokio::time::timeout(self.request_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SyncError::Transport(format!("connect to {} timed out", self.url)))??;
        Ok(ws)
    }

    /// Send one request and wait for its response, skipping push events.
    async fn call(&self, ws: &mut WsStream, method: &str, params: Value) -> Result<Value, SyncError> {
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = json!({ "id": id, "method": method, "params": params });
        ws.send(Message::text(request.to_string())).await?;

        tokio::time::timeout(self.request_timeout, read_response(ws, &id))
            .await
            .map_err(|_| SyncError::Transport(format!("{method} timed out")))?
    }
}

async fn read_response(ws: &mut WsStream, id: &str) -> Result<Value, SyncError> {
    loop {
        let frame = ws.next().await.ok_or(SyncError::Disconnected)??;
        let Message::Text(text) = frame else { continue };
        let msg: Value = serde_json::from_str(text.as_str())?;
        if msg.get("id").and_then(Value::as_str) == Some(id) {
            return into_result(msg);
        }
        trace!(id, "skipping frame while awaiting response");
    }
}

/// Unwrap `{ success, result, error }` into a result.
fn into_result(msg: Value) -> Result<Value, SyncError> {
    if msg.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(msg.get("result").cloned().unwrap_or(Value::Null));
    }
    let error = msg.get("error").cloned().unwrap_or(Value::Null);
    Err(SyncError::Rpc {
        code: error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string(),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        retryable: error
            .pointer("/data/retryable")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// Decode a pushed frame; responses and unknown events yield `None`.
fn decode_push(text: &str) -> Result<Option<SyncEvent>, SyncError> {
    let msg: Value = serde_json::from_str(text)?;
    if msg.get("type").is_none() {
        return Ok(None);
    }
    let wire: WireEvent = serde_json::from_value(msg)?;
    SyncEvent::from_wire(wire)
}

#[async_trait]
impl SyncTransport for WsTransport {
    /// Opens a dedicated connection and joins the session on it. The
    /// returned stream ends when the connection does.
    async fn subscribe(&self, session: &SessionId) -> Result<EventStream, SyncError> {
        let mut ws = self.connect().await?;
        let _ = self
            .call(&mut ws, "session.join", json!({ "sessionId": session }))
            .await?;
        debug!(session_id = %session, "joined session");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let _reader = tokio::spawn(async move {
            while let Some(frame) = ws.next().await {
                let item = match frame {
                    Ok(Message::Text(text)) => match decode_push(text.as_str()) {
                        Ok(Some(event)) => Ok(event),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => Err(SyncError::from(e)),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            let _ = ws.close(None).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn fetch(&self, session: &SessionId) -> Result<SessionView, SyncError> {
        let mut ws = self.connect().await?;
        let result = self
            .call(&mut ws, "session.get", json!({ "sessionId": session }))
            .await;
        let _ = ws.close(None).await;
        Ok(serde_json::from_value(result?)?)
    }
}
