//! Session service: the only writer of session state.
//!
//! Every mutation validates and authorizes first, then runs under the
//! session's write lock, persists, and publishes exactly one
//! [`SessionEvent`] before the lock is released.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use tally_core::model::{validate_delivery_fee, validate_items, ItemLimits, LineItem, NewSession, RestaurantRef};
use tally_core::settlement::round_money;
use tally_core::{ParticipantId, Session, SessionError, SessionEvent, SessionId, SessionStatus, SettledSession};
use tally_settings::SessionSettings;
use tally_store::{SessionLocks, SessionStore};

/// Source of "now". Injected so deadline behavior is testable.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Verified identity of the caller, as supplied by the auth layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    id: ParticipantId,
}

impl Actor {
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// One line of a participant's or host's order history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub session_id: SessionId,
    pub host_id: ParticipantId,
    pub is_host: bool,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restaurant_name: Option<String>,
    pub participant_count: usize,
    pub my_items: Vec<LineItem>,
    /// Rounded to cents; absent when the caller has no order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_total: Option<Decimal>,
    pub payment_sent: bool,
    pub grand_total: Decimal,
}

impl HistoryEntry {
    fn new(session: Session, who: &ParticipantId) -> Self {
        let settled = SettledSession::new(session);
        let cost = settled.settlement.for_participant(who);
        let session = &settled.session;
        let order = session.order(who);
        Self {
            session_id: session.id.clone(),
            host_id: session.host_id.clone(),
            is_host: session.is_host(who),
            status: session.status,
            created_at: session.created_at,
            restaurant_name: session.restaurant.as_ref().map(|r| r.name.clone()),
            participant_count: session.participant_count(),
            my_items: order.map(|o| o.items.clone()).unwrap_or_default(),
            my_total: cost.map(|c| round_money(c.total)),
            payment_sent: order.is_some_and(|o| o.payment_sent),
            grand_total: round_money(settled.settlement.summary.grand_total),
        }
    }
}

/// Host input for a new session. The host is the calling [`Actor`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    #[serde(default)]
    pub payment_info: String,
    pub delivery_fee: Decimal,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restaurant: Option<RestaurantRef>,
}

pub struct SessionService {
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    events: broadcast::Sender<SessionEvent>,
    settings: SessionSettings,
    limits: ItemLimits,
    clock: Clock,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        events: broadcast::Sender<SessionEvent>,
        settings: SessionSettings,
    ) -> Self {
        let limits = ItemLimits {
            max_items: settings.max_items_per_order,
            max_name_len: settings.max_name_length,
            max_order_total: Decimal::from(settings.max_order_total),
        };
        Self {
            store,
            locks: SessionLocks::new(),
            events,
            settings,
            limits,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    #[instrument(skip_all, fields(host = %actor))]
    pub async fn create_session(
        &self,
        actor: &Actor,
        input: CreateSession,
    ) -> Result<SettledSession, SessionError> {
        let now = self.now();
        let new = NewSession {
            host_id: actor.id().clone(),
            payment_info: input.payment_info,
            delivery_fee: input.delivery_fee,
            deadline: input.deadline,
            restaurant: input.restaurant,
        };
        new.validate(now)?;
        let session = Session::new(new, now);
        self.store.insert(&session)?;
        info!(session_id = %session.id, fee = %session.delivery_fee, "session created");
        Ok(SettledSession::new(session))
    }

    /// Unlocked read; settlement is always computed fresh.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn get_session(&self, id: &SessionId) -> Result<SettledSession, SessionError> {
        let session = self.store.get(id)?;
        Ok(SettledSession::new(session))
    }

    /// Add or wholesale-replace the caller's own order.
    #[instrument(skip_all, fields(session_id = %id, participant = %actor))]
    pub async fn submit_order(
        &self,
        actor: &Actor,
        id: &SessionId,
        items: Vec<LineItem>,
    ) -> Result<SettledSession, SessionError> {
        let items = validate_items(items, &self.limits)?;
        let participant = actor.id().clone();
        self.commit(id, |session, now| {
            self.ensure_accepting_orders(session, now)?;
            let replaced = session.upsert_order(participant, items, now)?;
            debug!(replaced, "order stored");
            Ok(())
        })
        .await
    }

    /// Host replaces another participant's items. Payment status is kept.
    #[instrument(skip_all, fields(session_id = %id, host = %actor, participant = %participant))]
    pub async fn edit_order(
        &self,
        actor: &Actor,
        id: &SessionId,
        participant: &ParticipantId,
        items: Vec<LineItem>,
    ) -> Result<SettledSession, SessionError> {
        let items = validate_items(items, &self.limits)?;
        self.require_host(actor, id)?;
        self.commit(id, |session, now| {
            self.ensure_accepting_orders(session, now)?;
            session.replace_items(participant, items, now)
        })
        .await
    }

    /// Remove an order. Participants may withdraw their own; removing
    /// anyone else's requires the host.
    #[instrument(skip_all, fields(session_id = %id, actor = %actor, participant = %participant))]
    pub async fn delete_order(
        &self,
        actor: &Actor,
        id: &SessionId,
        participant: &ParticipantId,
    ) -> Result<SettledSession, SessionError> {
        if actor.id() != participant {
            self.require_host(actor, id)?;
        }
        self.commit(id, |session, now| {
            self.ensure_accepting_orders(session, now)?;
            session.remove_order(participant, now).map(|_| ())
        })
        .await
    }

    /// Toggle the payment flag on an order; the participant or the host may do it.
    #[instrument(skip_all, fields(session_id = %id, actor = %actor, participant = %participant))]
    pub async fn update_payment(
        &self,
        actor: &Actor,
        id: &SessionId,
        participant: &ParticipantId,
        sent: bool,
    ) -> Result<SettledSession, SessionError> {
        if actor.id() != participant {
            self.require_host(actor, id)?;
        }
        self.commit(id, |session, now| {
            self.ensure_accepting_orders(session, now)?;
            session.set_payment_sent(participant, sent, now)
        })
        .await
    }

    /// Host-only. Allowed past the deadline so the host can settle up.
    #[instrument(skip_all, fields(session_id = %id, host = %actor))]
    pub async fn update_delivery_fee(
        &self,
        actor: &Actor,
        id: &SessionId,
        fee: Decimal,
    ) -> Result<SettledSession, SessionError> {
        let fee = validate_delivery_fee(fee)?;
        self.require_host(actor, id)?;
        self.commit(id, |session, now| session.set_delivery_fee(fee, now))
            .await
    }

    /// Host-only, one-way `active -> closed`.
    #[instrument(skip_all, fields(session_id = %id, host = %actor))]
    pub async fn close_session(
        &self,
        actor: &Actor,
        id: &SessionId,
    ) -> Result<SettledSession, SessionError> {
        self.require_host(actor, id)?;
        let settled = self.commit(id, |session, now| session.close(now)).await?;
        info!(
            participants = settled.session.participant_count(),
            grand_total = %settled.settlement.summary.grand_total,
            "session closed"
        );
        Ok(settled)
    }

    /// Sessions the caller hosts, newest first.
    #[instrument(skip_all, fields(actor = %actor))]
    pub async fn list_hosted_sessions(&self, actor: &Actor) -> Result<Vec<HistoryEntry>, SessionError> {
        let sessions = self.store.list_for_host(actor.id())?;
        Ok(sessions
            .into_iter()
            .map(|s| HistoryEntry::new(s, actor.id()))
            .collect())
    }

    /// Sessions the caller has an order in, newest first.
    #[instrument(skip_all, fields(actor = %actor))]
    pub async fn participant_history(&self, actor: &Actor) -> Result<Vec<HistoryEntry>, SessionError> {
        let sessions = self.store.list_for_participant(actor.id())?;
        Ok(sessions
            .into_iter()
            .map(|s| HistoryEntry::new(s, actor.id()))
            .collect())
    }

    /// Host identity never changes, so this check is safe outside the lock.
    fn require_host(&self, actor: &Actor, id: &SessionId) -> Result<(), SessionError> {
        self.store.get(id)?.ensure_host(actor.id())
    }

    fn ensure_accepting_orders(&self, session: &Session, now: DateTime<Utc>) -> Result<(), SessionError> {
        session.ensure_active()?;
        if self.settings.enforce_deadline {
            session.ensure_before_deadline(now)?;
        }
        Ok(())
    }

    /// Locked read-modify-write followed by exactly one published event.
    async fn commit<F>(&self, id: &SessionId, mutate: F) -> Result<SettledSession, SessionError>
    where
        F: FnOnce(&mut Session, DateTime<Utc>) -> Result<(), SessionError>,
    {
        let mut settled = None;
        let (session, ()) = self
            .locks
            .with_lock(
                self.store.as_ref(),
                id,
                self.settings.lock_timeout(),
                |session| mutate(session, self.now()),
                |session, _| {
                    let snapshot = SettledSession::new(session.clone());
                    let event = if session.is_active() {
                        SessionEvent::Updated {
                            session_id: session.id.clone(),
                            view: Arc::new(snapshot.view()),
                        }
                    } else {
                        SessionEvent::Closed {
                            session_id: session.id.clone(),
                        }
                    };
                    if self.events.send(event).is_err() {
                        debug!(session_id = %session.id, "no event listeners");
                    }
                    settled = Some(snapshot);
                },
            )
            .await?;
        Ok(settled.unwrap_or_else(|| SettledSession::new(session)))
    }
}
