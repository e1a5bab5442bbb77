use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::view::SessionView;

pub const EVENT_UPDATED: &str = "session.updated";
pub const EVENT_CLOSED: &str = "session.closed";

/// Emitted by the session service after a mutation commits.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Any committed change except closing; carries the full settled snapshot.
    Updated {
        session_id: SessionId,
        view: Arc<SessionView>,
    },
    /// The host closed the session. Subscribers should stop accepting input.
    Closed { session_id: SessionId },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Updated { session_id, .. } | Self::Closed { session_id } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Updated { .. } => EVENT_UPDATED,
            Self::Closed { .. } => EVENT_CLOSED,
        }
    }

    pub fn to_wire(&self) -> WireEvent {
        let data = match self {
            Self::Updated { view, .. } => {
                serde_json::to_value(view.as_ref()).unwrap_or(serde_json::Value::Null)
            }
            Self::Closed { session_id } => serde_json::json!({ "id": session_id }),
        };
        WireEvent {
            event_type: self.event_type().to_string(),
            session_id: self.session_id().clone(),
            data,
        }
    }
}

/// Push-channel envelope: `{ "type", "sessionId", "data" }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: SessionId,
    pub data: serde_json::Value,
}
