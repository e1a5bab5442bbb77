use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use tally_settings::TallySettings;
use tally_store::SessionStore;

use crate::broadcaster::{self, SubscriberRegistry};
use crate::client;
use crate::event_bridge;
use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};
use crate::service::SessionService;

/// Capacity of the in-process event channel feeding the bridge.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub heartbeat_interval: std::time::Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Wire the service, broadcaster and transport together and start serving.
pub async fn start(
    settings: &TallySettings,
    store: Arc<dyn SessionStore>,
) -> Result<ServerHandle, std::io::Error> {
    let server = &settings.server;
    let registry = Arc::new(SubscriberRegistry::new(
        server.max_send_queue,
        server.client_timeout(),
    ));

    let (event_tx, bridge_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let bridge_handle = event_bridge::create_bridge(Arc::clone(&registry), bridge_rx);
    let cleanup_handle =
        broadcaster::start_cleanup_task(Arc::clone(&registry), server.cleanup_interval());

    let service = Arc::new(SessionService::new(store, event_tx, settings.session.clone()));
    let handler_state = Arc::new(HandlerState::new(Arc::clone(&service), Arc::clone(&registry)));

    let router = build_router(AppState {
        handler_state,
        heartbeat_interval: server.heartbeat_interval(),
    });
    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "tally server started");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server exited");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        service,
        registry,
        server_task: server_handle,
        bridge_task: bridge_handle,
        cleanup_task: cleanup_handle,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    service: Arc<SessionService>,
    registry: Arc<SubscriberRegistry>,
    server_task: tokio::task::JoinHandle<()>,
    bridge_task: tokio::task::JoinHandle<()>,
    cleanup_task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn service(&self) -> &Arc<SessionService> {
        &self.service
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Stop accepting connections and end the background tasks.
    pub fn shutdown(&self) {
        self.server_task.abort();
        self.bridge_task.abort();
        self.cleanup_task.abort();
        tracing::info!(port = self.port, "tally server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let registry = Arc::clone(&state.handler_state.registry);
    let (subscriber_id, rx) = registry.register();
    tracing::info!(subscriber_id = %subscriber_id, "websocket client connected");

    client::handle_ws_connection(
        socket,
        subscriber_id,
        rx,
        registry,
        state.handler_state,
        state.heartbeat_interval,
    )
    .await;
}

/// JSON-RPC over plain HTTP. Subscription methods are unavailable here.
async fn rpc_handler(State(state): State<AppState>, body: String) -> Json<RpcResponse> {
    let response = match serde_json::from_str::<RpcRequest>(&body) {
        Ok(request) => {
            let params = request.params.unwrap_or_else(|| serde_json::json!({}));
            handlers::dispatch(&state.handler_state, &request.method, &params, request.id, None).await
        }
        Err(_) => RpcResponse::parse_error(),
    };
    Json(response)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = handlers::dispatch(
        &state.handler_state,
        "system.ping",
        &serde_json::json!({}),
        None,
        None,
    )
    .await;

    let healthy = resp
        .result
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(|s| s.as_str())
        == Some("healthy");
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp.result.unwrap_or_default()))
}
