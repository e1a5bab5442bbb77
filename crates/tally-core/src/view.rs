use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{ParticipantId, SessionId};
use crate::model::{Order, RestaurantRef, Session, SessionStatus};
use crate::settlement::{self, CombinedLine, ParticipantCost, Settlement, SettlementSummary};

/// A session together with a freshly computed settlement.
#[derive(Clone, Debug)]
pub struct SettledSession {
    pub session: Session,
    pub settlement: Settlement,
    pub combined: Vec<CombinedLine>,
}

impl SettledSession {
    pub fn new(session: Session) -> Self {
        let settlement = settlement::settle(&session);
        let combined = settlement::combined_order(&session);
        Self {
            session,
            settlement,
            combined,
        }
    }

    /// Wire shape, with money rounded to cents.
    pub fn view(&self) -> SessionView {
        let shown = self.settlement.rounded();
        let s = &self.session;
        SessionView {
            id: s.id.clone(),
            host_id: s.host_id.clone(),
            status: s.status,
            payment_info: s.payment_info.clone(),
            delivery_fee: s.delivery_fee,
            deadline: s.deadline,
            restaurant: s.restaurant.clone(),
            revision: s.revision,
            created_at: s.created_at,
            updated_at: s.updated_at,
            orders: s.orders().to_vec(),
            per_participant: shown.per_participant,
            summary: shown.summary,
            combined_order: self.combined.clone(),
        }
    }
}

/// Settled session as sent to clients, in reads and `updated` pushes alike.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: SessionId,
    pub host_id: ParticipantId,
    pub status: SessionStatus,
    pub payment_info: String,
    pub delivery_fee: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restaurant: Option<RestaurantRef>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub orders: Vec<Order>,
    pub per_participant: Vec<ParticipantCost>,
    pub summary: SettlementSummary,
    pub combined_order: Vec<CombinedLine>,
}

impl SessionView {
    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    pub fn cost_for(&self, who: &ParticipantId) -> Option<&ParticipantCost> {
        self.per_participant.iter().find(|c| &c.participant_id == who)
    }
}
