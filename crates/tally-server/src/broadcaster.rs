//! Realtime broadcaster: who is watching which session, and fan-out.
//!
//! Delivery is best-effort and at-most-once. Each subscriber owns a bounded
//! queue; a full queue drops the event for that subscriber only, and a
//! closed queue removes the subscriber. Clients recover missed events by
//! re-fetching the session after reconnect. RPC replies share the queue but
//! wait for room instead of being dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tally_core::{SessionId, SubscriberId};

/// One push-channel connection.
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<String>,
    /// Milliseconds since registry start at last sign of life.
    last_seen_ms: AtomicU64,
}

impl Subscriber {
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }
}

/// Outcome of a single delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
    Gone,
}

pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, Arc<Subscriber>>,
    sessions: DashMap<SessionId, DashMap<SubscriberId, Arc<Subscriber>>>,
    memberships: DashMap<SubscriberId, HashSet<SessionId>>,
    max_send_queue: usize,
    client_timeout: Duration,
    started: Instant,
}

impl SubscriberRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            subscribers: DashMap::new(),
            sessions: DashMap::new(),
            memberships: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            client_timeout,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Register a connection and return its id and outbound queue.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let subscriber = Arc::new(Subscriber {
            id: id.clone(),
            tx,
            last_seen_ms: AtomicU64::new(self.elapsed_ms()),
        });
        let _ = self.subscribers.insert(id.clone(), subscriber);
        (id, rx)
    }

    /// Subscribe to a session's events. Joining twice only refreshes liveness.
    /// Returns false for unknown subscribers.
    pub fn join(&self, subscriber: &SubscriberId, session: &SessionId) -> bool {
        let Some(sub) = self.subscribers.get(subscriber).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        self.touch(subscriber);
        let _ = self
            .sessions
            .entry(session.clone())
            .or_default()
            .insert(subscriber.clone(), sub);
        let _ = self
            .memberships
            .entry(subscriber.clone())
            .or_default()
            .insert(session.clone());
        debug!(subscriber_id = %subscriber, session_id = %session, "joined session");
        true
    }

    pub fn leave(&self, subscriber: &SubscriberId, session: &SessionId) {
        self.remove_member(session, subscriber);
        if let Some(mut joined) = self.memberships.get_mut(subscriber) {
            let _ = joined.remove(session);
        }
        let _ = self.memberships.remove_if(subscriber, |_, joined| joined.is_empty());
    }

    /// Remove a connection from every session it joined.
    pub fn disconnect(&self, subscriber: &SubscriberId) {
        let _ = self.subscribers.remove(subscriber);
        if let Some((_, joined)) = self.memberships.remove(subscriber) {
            for session in &joined {
                self.remove_member(session, subscriber);
            }
        }
        debug!(subscriber_id = %subscriber, "subscriber disconnected");
    }

    /// Forget everyone watching `session`; no further events will follow.
    pub fn drop_session(&self, session: &SessionId) {
        if let Some((_, members)) = self.sessions.remove(session) {
            for (subscriber, _) in members {
                if let Some(mut joined) = self.memberships.get_mut(&subscriber) {
                    let _ = joined.remove(session);
                }
                let _ = self.memberships.remove_if(&subscriber, |_, joined| joined.is_empty());
            }
        }
    }

    fn remove_member(&self, session: &SessionId, subscriber: &SubscriberId) {
        if let Some(members) = self.sessions.get(session) {
            let _ = members.remove(subscriber);
        }
        let _ = self.sessions.remove_if(session, |_, members| members.is_empty());
    }

    /// Record a sign of life (pong, inbound message, join).
    pub fn touch(&self, subscriber: &SubscriberId) {
        if let Some(sub) = self.subscribers.get(subscriber) {
            sub.last_seen_ms.store(self.elapsed_ms(), Ordering::Relaxed);
        }
    }

    /// Queue the reply to a subscriber's own request, waiting for room when
    /// the queue is full of pushes.
    pub async fn reply_to(&self, subscriber: &SubscriberId, message: String) -> Delivery {
        let Some(sub) = self.subscribers.get(subscriber).map(|s| Arc::clone(s.value())) else {
            return Delivery::Gone;
        };
        match sub.tx.send(message).await {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Gone,
        }
    }

    /// Push a message to everyone watching `session`. Returns how many
    /// subscribers accepted it.
    pub fn broadcast_to_session(&self, session: &SessionId, message: &str) -> usize {
        let members: Vec<Arc<Subscriber>> = match self.sessions.get(session) {
            Some(members) => members.iter().map(|m| Arc::clone(m.value())).collect(),
            None => return 0,
        };

        let mut sent = 0;
        for sub in members {
            match deliver(&sub, message.to_string()) {
                Delivery::Sent => sent += 1,
                Delivery::Dropped => {}
                Delivery::Gone => self.disconnect(&sub.id),
            }
        }
        sent
    }

    /// Remove subscribers silent for longer than the client timeout.
    pub fn cleanup_dead(&self) -> usize {
        let now = self.elapsed_ms();
        let limit = self.client_timeout.as_millis() as u64;
        let dead: Vec<SubscriberId> = self
            .subscribers
            .iter()
            .filter(|s| now.saturating_sub(s.last_seen_ms.load(Ordering::Relaxed)) >= limit)
            .map(|s| s.key().clone())
            .collect();

        for id in &dead {
            self.disconnect(id);
            info!(subscriber_id = %id, "cleaned up idle subscriber");
        }
        dead.len()
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscribers_of(&self, session: &SessionId) -> Vec<SubscriberId> {
        self.sessions
            .get(session)
            .map(|members| members.iter().map(|m| m.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Number of sessions with at least one subscriber.
    pub fn watched_sessions(&self) -> usize {
        self.sessions.len()
    }
}

fn deliver(sub: &Subscriber, message: String) -> Delivery {
    match sub.tx.try_send(message) {
        Ok(()) => Delivery::Sent,
        Err(mpsc::error::TrySendError::Full(msg)) => {
            warn!(
                subscriber_id = %sub.id,
                msg_len = msg.len(),
                "send queue full, dropping message"
            );
            Delivery::Dropped
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
    }
}

/// Periodically drop subscribers that stopped answering pings.
pub fn start_cleanup_task(
    registry: Arc<SubscriberRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            let _ = ticker.tick().await;
            let removed = registry.cleanup_dead();
            if removed > 0 {
                info!(removed, "idle subscriber cleanup");
            }
        }
    })
}
