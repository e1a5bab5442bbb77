//! Session aggregate: the session, its per-participant orders, and line items.
//!
//! All mutation goes through methods on [`Session`] so the one-order-per-
//! participant and active-only invariants hold regardless of caller.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::ids::{ParticipantId, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

fn default_quantity() -> u32 {
    1
}

/// A named, priced, quantified item within an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub price: Decimal,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

impl LineItem {
    pub fn new(name: impl Into<String>, price: Decimal, quantity: u32) -> Self {
        Self {
            name: name.into(),
            price,
            quantity,
        }
    }

    /// Unit price times quantity, at full precision.
    pub fn line_total(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/// Upper bound on any single money amount: a delivery fee or an order total.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// Input limits applied to submitted items.
#[derive(Clone, Debug)]
pub struct ItemLimits {
    pub max_items: usize,
    pub max_name_len: usize,
    /// Largest accepted order total; never above [`MAX_AMOUNT`].
    pub max_order_total: Decimal,
}

impl Default for ItemLimits {
    fn default() -> Self {
        Self {
            max_items: 100,
            max_name_len: 200,
            max_order_total: Decimal::from(1_000_000u32),
        }
    }
}

/// Validate submitted items, returning them with names trimmed.
///
/// Rejects rather than coerces: an empty list, blank names, non-positive
/// prices and zero quantities all fail, as does an order whose total is not
/// representable or exceeds `max_order_total`.
pub fn validate_items(items: Vec<LineItem>, limits: &ItemLimits) -> Result<Vec<LineItem>, SessionError> {
    if items.is_empty() {
        return Err(SessionError::validation("order must contain at least one item"));
    }
    if items.len() > limits.max_items {
        return Err(SessionError::validation(format!(
            "order has {} items, limit is {}",
            items.len(),
            limits.max_items
        )));
    }

    let cap = limits.max_order_total.min(MAX_AMOUNT);
    let mut total = Decimal::ZERO;
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let name = item.name.trim().to_string();
            if name.is_empty() {
                return Err(SessionError::validation(format!("item {idx}: name is empty")));
            }
            if name.chars().count() > limits.max_name_len {
                return Err(SessionError::validation(format!(
                    "item {idx}: name longer than {} characters",
                    limits.max_name_len
                )));
            }
            if item.price <= Decimal::ZERO {
                return Err(SessionError::validation(format!(
                    "item {idx} ({name}): price must be positive, got {}",
                    item.price
                )));
            }
            if item.quantity == 0 {
                return Err(SessionError::validation(format!(
                    "item {idx} ({name}): quantity must be at least 1"
                )));
            }
            total = item
                .price
                .checked_mul(Decimal::from(item.quantity))
                .and_then(|line| total.checked_add(line))
                .filter(|sum| *sum <= cap)
                .ok_or_else(|| SessionError::validation(format!("order total exceeds {cap}")))?;
            Ok(LineItem {
                name,
                price: item.price,
                quantity: item.quantity,
            })
        })
        .collect()
}

pub fn validate_delivery_fee(fee: Decimal) -> Result<Decimal, SessionError> {
    if fee < Decimal::ZERO {
        return Err(SessionError::validation(format!(
            "delivery fee must not be negative, got {fee}"
        )));
    }
    if fee > MAX_AMOUNT {
        return Err(SessionError::validation(format!(
            "delivery fee must not exceed {MAX_AMOUNT}, got {fee}"
        )));
    }
    Ok(fee)
}

/// One participant's order within a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub participant_id: ParticipantId,
    pub items: Vec<LineItem>,
    pub payment_sent: bool,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(LineItem::line_total).sum()
    }
}

/// A priced option of a menu item (e.g. size).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MenuVariant {
    pub name: String,
    pub price: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<MenuVariant>,
}

/// Read-only snapshot of the restaurant catalog, taken at session creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestaurantRef {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub menu: Vec<MenuItem>,
}

/// Host input for creating a session.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub host_id: ParticipantId,
    pub payment_info: String,
    pub delivery_fee: Decimal,
    pub deadline: Option<DateTime<Utc>>,
    pub restaurant: Option<RestaurantRef>,
}

impl NewSession {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), SessionError> {
        validate_delivery_fee(self.delivery_fee)?;
        if let Some(deadline) = self.deadline {
            if deadline <= now {
                return Err(SessionError::validation(format!(
                    "deadline {deadline} is not in the future"
                )));
            }
        }
        Ok(())
    }
}

/// Root aggregate: one host-created group order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub host_id: ParticipantId,
    pub payment_info: String,
    pub delivery_fee: Decimal,
    pub deadline: Option<DateTime<Utc>>,
    pub restaurant: Option<RestaurantRef>,
    pub status: SessionStatus,
    #[serde(default)]
    orders: Vec<Order>,
    /// Bumped on every committed mutation; lets readers discard stale snapshots.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(input: NewSession, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            host_id: input.host_id,
            payment_info: input.payment_info,
            delivery_fee: input.delivery_fee,
            deadline: input.deadline,
            restaurant: input.restaurant,
            status: SessionStatus::Active,
            orders: Vec::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach orders loaded from storage. Later entries win on duplicate participants.
    pub fn with_orders(mut self, orders: Vec<Order>) -> Self {
        self.orders.clear();
        for order in orders {
            match self
                .orders
                .iter_mut()
                .find(|o| o.participant_id == order.participant_id)
            {
                Some(existing) => *existing = order,
                None => self.orders.push(order),
            }
        }
        self
    }

    /// Check a session document that did not come through the mutation
    /// methods: fee bounds, one order per participant, and valid items.
    pub fn validated(mut self, limits: &ItemLimits) -> Result<Self, SessionError> {
        validate_delivery_fee(self.delivery_fee)?;
        for (idx, order) in self.orders.iter().enumerate() {
            if self.orders[..idx]
                .iter()
                .any(|o| o.participant_id == order.participant_id)
            {
                return Err(SessionError::validation(format!(
                    "participant {} has more than one order",
                    order.participant_id
                )));
            }
        }
        for order in &mut self.orders {
            let items = std::mem::take(&mut order.items);
            order.items = validate_items(items, limits).map_err(|e| match e {
                SessionError::Validation(msg) => {
                    SessionError::validation(format!("order of {}: {msg}", order.participant_id))
                }
                other => other,
            })?;
        }
        Ok(self)
    }

    /// Orders in first-submission order.
    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn order(&self, participant: &ParticipantId) -> Option<&Order> {
        self.orders.iter().find(|o| &o.participant_id == participant)
    }

    pub fn participant_count(&self) -> usize {
        self.orders.len()
    }

    pub fn is_host(&self, who: &ParticipantId) -> bool {
        &self.host_id == who
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }

    pub fn ensure_active(&self) -> Result<(), SessionError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SessionError::SessionClosed(self.id.clone()))
        }
    }

    pub fn ensure_before_deadline(&self, now: DateTime<Utc>) -> Result<(), SessionError> {
        match self.deadline {
            Some(deadline) if now > deadline => Err(SessionError::DeadlinePassed {
                session_id: self.id.clone(),
                deadline,
            }),
            _ => Ok(()),
        }
    }

    pub fn ensure_host(&self, who: &ParticipantId) -> Result<(), SessionError> {
        if self.is_host(who) {
            Ok(())
        } else {
            Err(SessionError::Unauthorized(format!(
                "{who} is not the host of session {}",
                self.id
            )))
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.revision += 1;
    }

    fn order_mut(&mut self, participant: &ParticipantId) -> Result<&mut Order, SessionError> {
        let id = self.id.clone();
        self.orders
            .iter_mut()
            .find(|o| &o.participant_id == participant)
            .ok_or_else(|| SessionError::NotFound(format!("order for {participant} in session {id}")))
    }

    /// Replace the participant's order wholesale, or add it if absent.
    /// Returns `true` if a prior order was replaced.
    pub fn upsert_order(
        &mut self,
        participant: ParticipantId,
        items: Vec<LineItem>,
        now: DateTime<Utc>,
    ) -> Result<bool, SessionError> {
        self.ensure_active()?;
        let order = Order {
            participant_id: participant,
            items,
            payment_sent: false,
            submitted_at: now,
            updated_at: now,
        };
        let replaced = match self
            .orders
            .iter_mut()
            .find(|o| o.participant_id == order.participant_id)
        {
            Some(existing) => {
                *existing = order;
                true
            }
            None => {
                self.orders.push(order);
                false
            }
        };
        self.touch(now);
        Ok(replaced)
    }

    /// Replace the items of an existing order, keeping its payment flag.
    pub fn replace_items(
        &mut self,
        participant: &ParticipantId,
        items: Vec<LineItem>,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        self.ensure_active()?;
        let order = self.order_mut(participant)?;
        order.items = items;
        order.updated_at = now;
        self.touch(now);
        Ok(())
    }

    pub fn remove_order(
        &mut self,
        participant: &ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<Order, SessionError> {
        self.ensure_active()?;
        let idx = self
            .orders
            .iter()
            .position(|o| &o.participant_id == participant)
            .ok_or_else(|| {
                SessionError::NotFound(format!("order for {participant} in session {}", self.id))
            })?;
        let removed = self.orders.remove(idx);
        self.touch(now);
        Ok(removed)
    }

    pub fn set_payment_sent(
        &mut self,
        participant: &ParticipantId,
        sent: bool,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        self.ensure_active()?;
        let order = self.order_mut(participant)?;
        order.payment_sent = sent;
        order.updated_at = now;
        self.touch(now);
        Ok(())
    }

    pub fn set_delivery_fee(&mut self, fee: Decimal, now: DateTime<Utc>) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.delivery_fee = validate_delivery_fee(fee)?;
        self.touch(now);
        Ok(())
    }

    /// One-way transition to `Closed`.
    pub fn close(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.status = SessionStatus::Closed;
        self.touch(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn session(fee: Decimal) -> Session {
        Session::new(
            NewSession {
                host_id: "host".into(),
                payment_info: "IBAN 123".into(),
                delivery_fee: fee,
                deadline: None,
                restaurant: None,
            },
            Utc::now(),
        )
    }

    fn tea() -> Vec<LineItem> {
        vec![LineItem::new("Tea", dec!(10), 1)]
    }

    #[test]
    fn status_display_and_parse() {
        assert_eq!(SessionStatus::Closed.to_string(), "closed");
        assert_eq!("active".parse::<SessionStatus>(), Ok(SessionStatus::Active));
        assert!("gone".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn line_total_multiplies_quantity() {
        assert_eq!(LineItem::new("Coffee", dec!(25), 2).line_total(), dec!(50));
    }

    #[test]
    fn missing_quantity_defaults_to_one() {
        let item: LineItem = serde_json::from_str(r#"{"name":"Tea","price":15}"#).unwrap();
        assert_eq!(item.quantity, 1);
        assert_eq!(item.price, dec!(15));
    }

    #[test]
    fn validate_items_trims_names() {
        let items = validate_items(vec![LineItem::new("  Tea ", dec!(10), 1)], &ItemLimits::default()).unwrap();
        assert_eq!(items[0].name, "Tea");
    }

    #[test]
    fn validate_items_rejects_bad_input() {
        let limits = ItemLimits::default();
        assert_matches!(validate_items(vec![], &limits), Err(SessionError::Validation(_)));
        assert_matches!(
            validate_items(vec![LineItem::new("  ", dec!(10), 1)], &limits),
            Err(SessionError::Validation(_))
        );
        assert_matches!(
            validate_items(vec![LineItem::new("Tea", dec!(0), 1)], &limits),
            Err(SessionError::Validation(_))
        );
        assert_matches!(
            validate_items(vec![LineItem::new("Tea", dec!(-1), 1)], &limits),
            Err(SessionError::Validation(_))
        );
        assert_matches!(
            validate_items(vec![LineItem::new("Tea", dec!(1), 0)], &limits),
            Err(SessionError::Validation(_))
        );
    }

    #[test]
    fn validate_items_enforces_limits() {
        let limits = ItemLimits {
            max_items: 1,
            max_name_len: 3,
            ..ItemLimits::default()
        };
        assert_matches!(
            validate_items(tea().into_iter().chain(tea()).collect(), &limits),
            Err(SessionError::Validation(_))
        );
        assert_matches!(
            validate_items(vec![LineItem::new("Coffee", dec!(1), 1)], &limits),
            Err(SessionError::Validation(_))
        );
    }

    #[test]
    fn validate_items_rejects_unrepresentable_totals() {
        let limits = ItemLimits::default();
        let huge = LineItem::new("Caviar", Decimal::from_str_exact("100000000000000000000").unwrap(), 4_000_000_000);
        assert_matches!(validate_items(vec![huge], &limits), Err(SessionError::Validation(_)));

        let near_max = LineItem::new("Caviar", Decimal::MAX, 1);
        assert_matches!(
            validate_items(vec![near_max.clone(), near_max], &limits),
            Err(SessionError::Validation(_))
        );

        let capped = ItemLimits {
            max_order_total: dec!(50),
            ..ItemLimits::default()
        };
        assert!(validate_items(vec![LineItem::new("Coffee", dec!(25), 2)], &capped).is_ok());
        assert_matches!(
            validate_items(
                vec![LineItem::new("Coffee", dec!(25), 2), LineItem::new("Tea", dec!(0.01), 1)],
                &capped
            ),
            Err(SessionError::Validation(_))
        );
    }

    #[test]
    fn delivery_fee_is_bounded() {
        assert!(validate_delivery_fee(MAX_AMOUNT).is_ok());
        assert_matches!(validate_delivery_fee(Decimal::MAX), Err(SessionError::Validation(_)));
        let mut s = session(dec!(0));
        assert_matches!(s.set_delivery_fee(Decimal::MAX, Utc::now()), Err(SessionError::Validation(_)));
        assert_eq!(s.revision, 0);
    }

    #[test]
    fn validated_document_rejects_duplicate_participants() {
        let now = Utc::now();
        let mk = |who: &str, price: Decimal| Order {
            participant_id: who.into(),
            items: vec![LineItem::new(" Tea ", price, 1)],
            payment_sent: false,
            submitted_at: now,
            updated_at: now,
        };
        let mut doc = session(dec!(10));
        doc.orders = vec![mk("a", dec!(1)), mk("a", dec!(2))];
        assert_matches!(doc.validated(&ItemLimits::default()), Err(SessionError::Validation(_)));

        let mut doc = session(dec!(10));
        doc.orders = vec![mk("a", dec!(1)), mk("b", dec!(-2))];
        assert_matches!(doc.validated(&ItemLimits::default()), Err(SessionError::Validation(_)));

        let mut doc = session(dec!(10));
        doc.orders = vec![mk("a", dec!(1)), mk("b", dec!(2))];
        let ok = doc.validated(&ItemLimits::default()).unwrap();
        assert_eq!(ok.participant_count(), 2);
        assert_eq!(ok.orders()[0].items[0].name, "Tea");
    }

    #[test]
    fn new_session_rejects_negative_fee_and_past_deadline() {
        let now = Utc::now();
        let mut input = NewSession {
            host_id: "host".into(),
            payment_info: String::new(),
            delivery_fee: dec!(-1),
            deadline: None,
            restaurant: None,
        };
        assert_matches!(input.validate(now), Err(SessionError::Validation(_)));

        input.delivery_fee = dec!(0);
        input.deadline = Some(now - Duration::minutes(1));
        assert_matches!(input.validate(now), Err(SessionError::Validation(_)));

        input.deadline = Some(now + Duration::minutes(30));
        assert!(input.validate(now).is_ok());
    }

    #[test]
    fn upsert_replaces_prior_order() {
        let mut s = session(dec!(30));
        let now = Utc::now();
        assert!(!s.upsert_order("a".into(), tea(), now).unwrap());
        s.set_payment_sent(&"a".into(), true, now).unwrap();

        let coffee = vec![LineItem::new("Coffee", dec!(25), 2)];
        assert!(s.upsert_order("a".into(), coffee.clone(), now).unwrap());

        assert_eq!(s.participant_count(), 1);
        let order = s.order(&"a".into()).unwrap();
        assert_eq!(order.items, coffee);
        assert!(!order.payment_sent);
    }

    #[test]
    fn replace_items_keeps_payment_flag() {
        let mut s = session(dec!(0));
        let now = Utc::now();
        s.upsert_order("a".into(), tea(), now).unwrap();
        s.set_payment_sent(&"a".into(), true, now).unwrap();
        s.replace_items(&"a".into(), vec![LineItem::new("Juice", dec!(12), 1)], now)
            .unwrap();
        let order = s.order(&"a".into()).unwrap();
        assert!(order.payment_sent);
        assert_eq!(order.items[0].name, "Juice");

        assert_matches!(
            s.replace_items(&"b".into(), tea(), now),
            Err(SessionError::NotFound(_))
        );
    }

    #[test]
    fn revision_bumps_per_mutation() {
        let mut s = session(dec!(0));
        let now = Utc::now();
        assert_eq!(s.revision, 0);
        s.upsert_order("a".into(), tea(), now).unwrap();
        s.set_delivery_fee(dec!(5), now).unwrap();
        s.remove_order(&"a".into(), now).unwrap();
        assert_eq!(s.revision, 3);
    }

    #[test]
    fn closed_session_rejects_every_mutation() {
        let mut s = session(dec!(10));
        let now = Utc::now();
        s.upsert_order("a".into(), tea(), now).unwrap();
        s.close(now).unwrap();
        let before = s.clone();

        assert_matches!(s.upsert_order("b".into(), tea(), now), Err(SessionError::SessionClosed(_)));
        assert_matches!(s.replace_items(&"a".into(), tea(), now), Err(SessionError::SessionClosed(_)));
        assert_matches!(s.remove_order(&"a".into(), now), Err(SessionError::SessionClosed(_)));
        assert_matches!(s.set_payment_sent(&"a".into(), true, now), Err(SessionError::SessionClosed(_)));
        assert_matches!(s.set_delivery_fee(dec!(1), now), Err(SessionError::SessionClosed(_)));
        assert_matches!(s.close(now), Err(SessionError::SessionClosed(_)));

        assert_eq!(s, before);
    }

    #[test]
    fn deadline_checks() {
        let mut s = session(dec!(0));
        let now = Utc::now();
        assert!(!s.deadline_passed(now));
        s.deadline = Some(now);
        assert!(!s.deadline_passed(now));
        assert!(s.deadline_passed(now + Duration::seconds(1)));
        assert_matches!(
            s.ensure_before_deadline(now + Duration::seconds(1)),
            Err(SessionError::DeadlinePassed { .. })
        );
    }

    #[test]
    fn with_orders_dedups_last_wins() {
        let now = Utc::now();
        let mk = |who: &str, name: &str| Order {
            participant_id: who.into(),
            items: vec![LineItem::new(name, dec!(1), 1)],
            payment_sent: false,
            submitted_at: now,
            updated_at: now,
        };
        let s = session(dec!(0)).with_orders(vec![mk("a", "x"), mk("b", "y"), mk("a", "z")]);
        assert_eq!(s.participant_count(), 2);
        assert_eq!(s.orders()[0].items[0].name, "z");
    }

    #[test]
    fn host_check() {
        let s = session(dec!(0));
        assert!(s.ensure_host(&"host".into()).is_ok());
        assert_matches!(s.ensure_host(&"guest".into()), Err(SessionError::Unauthorized(_)));
    }
}
