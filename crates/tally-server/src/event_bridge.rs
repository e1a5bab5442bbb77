use std::sync::Arc;

use tokio::sync::broadcast;

use tally_core::SessionEvent;

use crate::broadcaster::SubscriberRegistry;

/// Forwards committed [`SessionEvent`]s to the subscribers of each session.
pub struct EventBridge {
    registry: Arc<SubscriberRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self { registry }
    }

    /// Spawn the forwarding loop. It ends when every sender is dropped.
    pub fn start(&self, mut rx: broadcast::Receiver<SessionEvent>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => forward(&registry, &event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

fn forward(registry: &SubscriberRegistry, event: &SessionEvent) {
    let session_id = event.session_id();
    if let Some(json) = serialize_event(event) {
        let delivered = registry.broadcast_to_session(session_id, &json);
        tracing::debug!(
            session_id = %session_id,
            event_type = event.event_type(),
            delivered,
            "event forwarded"
        );
    }
    if matches!(event, SessionEvent::Closed { .. }) {
        registry.drop_session(session_id);
    }
}

pub fn create_bridge(
    registry: Arc<SubscriberRegistry>,
    rx: broadcast::Receiver<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(registry).start(rx)
}

/// Serialize an event to its push-channel JSON.
pub fn serialize_event(event: &SessionEvent) -> Option<String> {
    match serde_json::to_string(&event.to_wire()) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize session event");
            None
        }
    }
}
