use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use tally_core::events::{EVENT_CLOSED, EVENT_UPDATED};
use tally_core::{SessionId, SessionView, WireEvent};

use crate::error::SyncError;

/// A push event as seen by a client.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    Updated(Box<SessionView>),
    Closed { session_id: SessionId },
}

impl SyncEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Updated(view) => &view.id,
            Self::Closed { session_id } => session_id,
        }
    }

    /// Decode a push-channel envelope. Unknown event types yield `None`.
    pub fn from_wire(wire: WireEvent) -> Result<Option<Self>, SyncError> {
        match wire.event_type.as_str() {
            EVENT_UPDATED => {
                let view: SessionView = serde_json::from_value(wire.data)?;
                Ok(Some(Self::Updated(Box::new(view))))
            }
            EVENT_CLOSED => Ok(Some(Self::Closed {
                session_id: wire.session_id,
            })),
            _ => Ok(None),
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<SyncEvent, SyncError>> + Send>>;

/// How a client reaches the server.
///
/// `subscribe` must be in effect before it returns, so that a `fetch` issued
/// afterwards cannot miss a commit.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn subscribe(&self, session: &SessionId) -> Result<EventStream, SyncError>;

    async fn fetch(&self, session: &SessionId) -> Result<SessionView, SyncError>;
}
