//! Settlement engine: pure cost splitting over a session snapshot.
//!
//! Item totals are summed per participant; the delivery fee is split evenly
//! across everyone with an order, regardless of order value. All arithmetic
//! is full-precision [`Decimal`]; rounding to cents happens only in
//! [`Settlement::rounded`], which is what clients display.

use std::collections::HashMap;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::ids::ParticipantId;
use crate::model::Session;

/// Round a money amount to cents for display.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Decimal places kept by a delivery share before the residue is assigned.
pub const SHARE_SCALE: u32 = 12;

/// Split `amount` into `parts` equal shares that sum back to `amount` exactly.
///
/// Each share is truncated to [`SHARE_SCALE`] places, so `base * parts` is
/// exact and the residue goes to the first share. Zero parts yields no shares.
pub fn split_evenly(amount: Decimal, parts: usize) -> Vec<Decimal> {
    if parts == 0 {
        return Vec::new();
    }
    let n = Decimal::from(parts);
    let base = (amount / n).round_dp_with_strategy(SHARE_SCALE, RoundingStrategy::ToZero);
    let residue = amount - base * n;
    let mut shares = vec![base; parts];
    shares[0] += residue;
    shares
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantCost {
    pub participant_id: ParticipantId,
    pub items_total: Decimal,
    pub delivery_share: Decimal,
    pub total: Decimal,
    pub payment_sent: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementSummary {
    pub total_food: Decimal,
    pub total_delivery: Decimal,
    pub grand_total: Decimal,
}

/// Per-participant breakdown plus aggregate totals.
#[derive(Clone, Debug, PartialEq)]
pub struct Settlement {
    pub per_participant: Vec<ParticipantCost>,
    pub summary: SettlementSummary,
    /// Delivery fee not assigned to anyone (only non-zero with no participants).
    pub unassigned_delivery: Decimal,
}

impl Settlement {
    pub fn for_participant(&self, who: &ParticipantId) -> Option<&ParticipantCost> {
        self.per_participant.iter().find(|c| &c.participant_id == who)
    }

    /// Full-precision additivity check: shares sum to the fee and the grand
    /// total is food plus delivery.
    pub fn is_balanced(&self) -> bool {
        let shares: Decimal = self.per_participant.iter().map(|c| c.delivery_share).sum();
        let food: Decimal = self.per_participant.iter().map(|c| c.items_total).sum();
        shares + self.unassigned_delivery == self.summary.total_delivery
            && food == self.summary.total_food
            && self.summary.grand_total == self.summary.total_food + self.summary.total_delivery
    }

    /// Copy with every figure rounded to cents.
    pub fn rounded(&self) -> Settlement {
        Settlement {
            per_participant: self
                .per_participant
                .iter()
                .map(|c| ParticipantCost {
                    participant_id: c.participant_id.clone(),
                    items_total: round_money(c.items_total),
                    delivery_share: round_money(c.delivery_share),
                    total: round_money(c.total),
                    payment_sent: c.payment_sent,
                })
                .collect(),
            summary: SettlementSummary {
                total_food: round_money(self.summary.total_food),
                total_delivery: round_money(self.summary.total_delivery),
                grand_total: round_money(self.summary.grand_total),
            },
            unassigned_delivery: round_money(self.unassigned_delivery),
        }
    }
}

/// Compute the settlement for a session snapshot.
pub fn settle(session: &Session) -> Settlement {
    let orders = session.orders();
    let fee = session.delivery_fee;
    let shares = split_evenly(fee, orders.len());

    let per_participant: Vec<ParticipantCost> = orders
        .iter()
        .zip(shares)
        .map(|(order, delivery_share)| {
            let items_total = order.items_total();
            ParticipantCost {
                participant_id: order.participant_id.clone(),
                items_total,
                delivery_share,
                total: items_total + delivery_share,
                payment_sent: order.payment_sent,
            }
        })
        .collect();

    let total_food: Decimal = per_participant.iter().map(|c| c.items_total).sum();
    let unassigned_delivery = if per_participant.is_empty() { fee } else { Decimal::ZERO };

    let settlement = Settlement {
        per_participant,
        summary: SettlementSummary {
            total_food,
            total_delivery: fee,
            grand_total: total_food + fee,
        },
        unassigned_delivery,
    };
    debug_assert!(settlement.is_balanced(), "delivery shares must sum to the fee");
    settlement
}

/// One consolidated line across all participants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedLine {
    pub name: String,
    pub price: Decimal,
    pub quantity: u64,
    pub ordered_by: Vec<ParticipantId>,
}

/// Aggregate identical `(name, price)` items across participants, in order of
/// first appearance. Used for purchasing, not for cost math.
pub fn combined_order(session: &Session) -> Vec<CombinedLine> {
    let mut lines: Vec<CombinedLine> = Vec::new();
    let mut index: HashMap<(String, Decimal), usize> = HashMap::new();

    for order in session.orders() {
        for item in &order.items {
            let key = (item.name.clone(), item.price.normalize());
            let idx = *index.entry(key).or_insert_with(|| {
                lines.push(CombinedLine {
                    name: item.name.clone(),
                    price: item.price,
                    quantity: 0,
                    ordered_by: Vec::new(),
                });
                lines.len() - 1
            });
            let line = &mut lines[idx];
            line.quantity += u64::from(item.quantity);
            if !line.ordered_by.contains(&order.participant_id) {
                line.ordered_by.push(order.participant_id.clone());
            }
        }
    }
    lines
}
