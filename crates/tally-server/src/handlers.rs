//! RPC method handlers.
//!
//! Every method takes camelCase params. `actorId` carries the identity the
//! auth layer verified; it is trusted as-is.

use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use tally_core::{LineItem, ParticipantId, SessionError, SessionId, SubscriberId};

use crate::broadcaster::SubscriberRegistry;
use crate::rpc::{self, RpcResponse};
use crate::service::{Actor, CreateSession, SessionService};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub service: Arc<SessionService>,
    pub registry: Arc<SubscriberRegistry>,
    pub started_at: Instant,
}

impl HandlerState {
    pub fn new(service: Arc<SessionService>, registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            service,
            registry,
            started_at: Instant::now(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorParams {
    actor_id: ParticipantId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: SessionId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    actor_id: ParticipantId,
    #[serde(flatten)]
    session: CreateSession,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitParams {
    actor_id: ParticipantId,
    session_id: SessionId,
    items: Vec<LineItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditParams {
    actor_id: ParticipantId,
    session_id: SessionId,
    participant_id: ParticipantId,
    items: Vec<LineItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteParams {
    actor_id: ParticipantId,
    session_id: SessionId,
    /// Defaults to the actor withdrawing their own order.
    #[serde(default)]
    participant_id: Option<ParticipantId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentParams {
    actor_id: ParticipantId,
    session_id: SessionId,
    #[serde(default)]
    participant_id: Option<ParticipantId>,
    payment_sent: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeParams {
    actor_id: ParticipantId,
    session_id: SessionId,
    delivery_fee: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostActionParams {
    actor_id: ParticipantId,
    session_id: SessionId,
}

/// Dispatch an RPC method to the appropriate handler.
///
/// `connection` is set for WebSocket callers; subscription methods need it.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &Value,
    id: Option<Value>,
    connection: Option<&SubscriberId>,
) -> RpcResponse {
    tracing::debug!(method, "rpc dispatch");
    match method {
        "session.create" => session_create(state, params, id).await,
        "session.get" => session_get(state, params, id).await,
        "session.submitOrder" => session_submit_order(state, params, id).await,
        "session.editOrder" => session_edit_order(state, params, id).await,
        "session.deleteOrder" => session_delete_order(state, params, id).await,
        "session.updatePayment" => session_update_payment(state, params, id).await,
        "session.updateDeliveryFee" => session_update_fee(state, params, id).await,
        "session.close" => session_close(state, params, id).await,
        "session.join" => session_join(state, params, id, connection).await,
        "session.leave" => session_leave(state, params, id, connection),
        "session.listHosted" => session_list_hosted(state, params, id).await,
        "session.history" => session_history(state, params, id).await,
        "system.ping" | "health" => health(state, id),
        _ => RpcResponse::method_not_found(id, method),
    }
}

/// Settled session view on success, typed error otherwise.
fn settled_response(
    id: Option<Value>,
    result: Result<tally_core::SettledSession, SessionError>,
) -> RpcResponse {
    match result {
        Ok(settled) => rpc::to_result(id, &settled.view()),
        Err(e) => session_error(id, &e),
    }
}

fn session_error(id: Option<Value>, err: &SessionError) -> RpcResponse {
    if err.is_retryable() {
        tracing::warn!(kind = err.kind(), error = %err, "rpc failed, retryable");
    } else {
        tracing::debug!(kind = err.kind(), error = %err, "rpc rejected");
    }
    RpcResponse::from_session_error(id, err)
}

macro_rules! params {
    ($ty:ty, $params:expr, $id:expr) => {
        match rpc::parse_params::<$ty>($params) {
            Ok(p) => p,
            Err(e) => return RpcResponse::invalid_params($id, e),
        }
    };
}

async fn session_create(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let p = params!(CreateParams, params, id);
    let result = state
        .service
        .create_session(&Actor::new(p.actor_id), p.session)
        .await;
    settled_response(id, result)
}

async fn session_get(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let p = params!(SessionParams, params, id);
    settled_response(id, state.service.get_session(&p.session_id).await)
}

async fn session_submit_order(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let p = params!(SubmitParams, params, id);
    let result = state
        .service
        .submit_order(&Actor::new(p.actor_id), &p.session_id, p.items)
        .await;
    settled_response(id, result)
}

async fn session_edit_order(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let p = params!(EditParams, params, id);
    let result = state
        .service
        .edit_order(&Actor::new(p.actor_id), &p.session_id, &p.participant_id, p.items)
        .await;
    settled_response(id, result)
}

async fn session_delete_order(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let p = params!(DeleteParams, params, id);
    let target = p.participant_id.unwrap_or_else(|| p.actor_id.clone());
    let result = state
        .service
        .delete_order(&Actor::new(p.actor_id), &p.session_id, &target)
        .await;
    settled_response(id, result)
}

async fn session_update_payment(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let p = params!(PaymentParams, params, id);
    let target = p.participant_id.unwrap_or_else(|| p.actor_id.clone());
    let result = state
        .service
        .update_payment(&Actor::new(p.actor_id), &p.session_id, &target, p.payment_sent)
        .await;
    settled_response(id, result)
}

async fn session_update_fee(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let p = params!(FeeParams, params, id);
    let result = state
        .service
        .update_delivery_fee(&Actor::new(p.actor_id), &p.session_id, p.delivery_fee)
        .await;
    settled_response(id, result)
}

async fn session_close(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let p = params!(HostActionParams, params, id);
    let result = state
        .service
        .close_session(&Actor::new(p.actor_id), &p.session_id)
        .await;
    settled_response(id, result)
}

/// Subscribe this connection, then return the baseline snapshot. Joining
/// before the read means no commit can fall between the two unseen.
async fn session_join(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
    connection: Option<&SubscriberId>,
) -> RpcResponse {
    let p = params!(SessionParams, params, id);
    let Some(subscriber) = connection else {
        return RpcResponse::invalid_params(id, "session.join requires a WebSocket connection");
    };
    if !state.registry.join(subscriber, &p.session_id) {
        return RpcResponse::internal_error(id, format!("unknown subscriber {subscriber}"));
    }

    match state.service.get_session(&p.session_id).await {
        Ok(settled) => {
            if !settled.session.is_active() {
                // No further events will be published for a closed session.
                state.registry.leave(subscriber, &p.session_id);
            }
            rpc::to_result(id, &settled.view())
        }
        Err(e) => {
            state.registry.leave(subscriber, &p.session_id);
            session_error(id, &e)
        }
    }
}

fn session_leave(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
    connection: Option<&SubscriberId>,
) -> RpcResponse {
    let p = params!(SessionParams, params, id);
    if let Some(subscriber) = connection {
        state.registry.leave(subscriber, &p.session_id);
    }
    RpcResponse::success(id, serde_json::json!({ "left": true }))
}

async fn session_list_hosted(
    state: &Arc<HandlerState>,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let p = params!(ActorParams, params, id);
    match state.service.list_hosted_sessions(&Actor::new(p.actor_id)).await {
        Ok(entries) => rpc::to_result(id, &serde_json::json!({ "sessions": entries })),
        Err(e) => session_error(id, &e),
    }
}

async fn session_history(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let p = params!(ActorParams, params, id);
    match state.service.participant_history(&Actor::new(p.actor_id)).await {
        Ok(entries) => rpc::to_result(id, &serde_json::json!({ "sessions": entries })),
        Err(e) => session_error(id, &e),
    }
}

fn health(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": "healthy",
            "uptimeSecs": state.started_at.elapsed().as_secs(),
            "subscribers": state.registry.count(),
            "watchedSessions": state.registry.watched_sessions(),
        }),
    )
}
