use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use tally_core::model::{LineItem, NewSession, Order, RestaurantRef};
use tally_core::{ParticipantId, Session, SessionId, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_timestamp};

/// Persistence contract for session aggregates.
///
/// Implementations must make `put` atomic: after a failed write, `get`
/// returns the previous state.
pub trait SessionStore: Send + Sync {
    /// Persist a brand-new session. Fails with `Conflict` if the id exists.
    fn insert(&self, session: &Session) -> Result<(), StoreError>;

    fn get(&self, id: &SessionId) -> Result<Session, StoreError>;

    /// Overwrite an existing session, orders included.
    fn put(&self, session: &Session) -> Result<(), StoreError>;

    /// Sessions hosted by `host`, newest first.
    fn list_for_host(&self, host: &ParticipantId) -> Result<Vec<Session>, StoreError>;

    /// Sessions in which `participant` currently has an order, newest first.
    fn list_for_participant(&self, participant: &ParticipantId) -> Result<Vec<Session>, StoreError>;
}

/// Line item as persisted: prices as decimal strings, never floats.
#[derive(Serialize, Deserialize)]
struct StoredItem {
    name: String,
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
    quantity: u32,
}

impl From<&LineItem> for StoredItem {
    fn from(item: &LineItem) -> Self {
        Self {
            name: item.name.clone(),
            price: item.price,
            quantity: item.quantity,
        }
    }
}

impl From<StoredItem> for LineItem {
    fn from(item: StoredItem) -> Self {
        LineItem::new(item.name, item.price, item.quantity)
    }
}

/// SQLite-backed [`SessionStore`].
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

const SESSION_COLUMNS: &str = "id, host_id, payment_info, delivery_fee, deadline, restaurant,
     status, revision, created_at, updated_at";

impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    fn insert(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM sessions WHERE id = ?1",
                    [session.id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::Conflict(format!("session {} already exists", session.id)));
            }

            let restaurant = session
                .restaurant
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO sessions (id, host_id, payment_info, delivery_fee, deadline, restaurant,
                                       status, revision, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session.id.as_str(),
                    session.host_id.as_str(),
                    session.payment_info,
                    session.delivery_fee.to_string(),
                    session.deadline.as_ref().map(format_timestamp),
                    restaurant,
                    session.status.to_string(),
                    revision_to_sql(session.revision)?,
                    format_timestamp(&session.created_at),
                    format_timestamp(&session.updated_at),
                ],
            )?;
            write_orders(tx, session)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| load_session(conn, id))
    }

    #[instrument(skip(self, session), fields(session_id = %session.id, revision = session.revision))]
    fn put(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE sessions
                 SET payment_info = ?2, delivery_fee = ?3, deadline = ?4, status = ?5,
                     revision = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    session.id.as_str(),
                    session.payment_info,
                    session.delivery_fee.to_string(),
                    session.deadline.as_ref().map(format_timestamp),
                    session.status.to_string(),
                    revision_to_sql(session.revision)?,
                    format_timestamp(&session.updated_at),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {}", session.id)));
            }
            let _ = tx.execute("DELETE FROM orders WHERE session_id = ?1", [session.id.as_str()])?;
            write_orders(tx, session)
        })
    }

    #[instrument(skip(self), fields(host_id = %host))]
    fn list_for_host(&self, host: &ParticipantId) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let ids = query_ids(
                conn,
                "SELECT id FROM sessions WHERE host_id = ?1 ORDER BY created_at DESC, id DESC",
                host,
            )?;
            ids.iter().map(|id| load_session(conn, id)).collect()
        })
    }

    #[instrument(skip(self), fields(participant_id = %participant))]
    fn list_for_participant(&self, participant: &ParticipantId) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let ids = query_ids(
                conn,
                "SELECT s.id FROM sessions s
                 JOIN orders o ON o.session_id = s.id
                 WHERE o.participant_id = ?1
                 ORDER BY s.created_at DESC, s.id DESC",
                participant,
            )?;
            ids.iter().map(|id| load_session(conn, id)).collect()
        })
    }
}

fn revision_to_sql(revision: u64) -> Result<i64, StoreError> {
    i64::try_from(revision).map_err(|_| StoreError::Conflict(format!("revision {revision} overflows")))
}

fn query_ids(conn: &Connection, sql: &str, who: &ParticipantId) -> Result<Vec<SessionId>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([who.as_str()], |row| row.get::<_, String>(0))?
        .map(|r| r.map(SessionId::from_raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn write_orders(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "INSERT INTO orders (session_id, participant_id, position, items, payment_sent,
                             submitted_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for (position, order) in session.orders().iter().enumerate() {
        let items: Vec<StoredItem> = order.items.iter().map(StoredItem::from).collect();
        let _ = stmt.execute(params![
            session.id.as_str(),
            order.participant_id.as_str(),
            position as i64,
            serde_json::to_string(&items)?,
            order.payment_sent,
            format_timestamp(&order.submitted_at),
            format_timestamp(&order.updated_at),
        ])?;
    }
    debug!(session_id = %session.id, orders = session.orders().len(), "orders written");
    Ok(())
}

fn load_session(conn: &Connection, id: &SessionId) -> Result<Session, StoreError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id.as_str()])?;
    let session = match rows.next()? {
        Some(row) => row_to_session(row)?,
        None => return Err(StoreError::NotFound(format!("session {id}"))),
    };
    let orders = load_orders(conn, id)?;
    Ok(session.with_orders(orders))
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    const T: &str = "sessions";
    let id: String = row_helpers::get(row, 0, T, "id")?;
    let host_id: String = row_helpers::get(row, 1, T, "host_id")?;
    let payment_info: String = row_helpers::get(row, 2, T, "payment_info")?;
    let fee: String = row_helpers::get(row, 3, T, "delivery_fee")?;
    let deadline: Option<String> = row_helpers::get_opt(row, 4, T, "deadline")?;
    let restaurant: Option<String> = row_helpers::get_opt(row, 5, T, "restaurant")?;
    let status: String = row_helpers::get(row, 6, T, "status")?;
    let revision: i64 = row_helpers::get(row, 7, T, "revision")?;
    let created_at: String = row_helpers::get(row, 8, T, "created_at")?;
    let updated_at: String = row_helpers::get(row, 9, T, "updated_at")?;

    let deadline: Option<DateTime<Utc>> = deadline
        .map(|raw| row_helpers::parse_timestamp(&raw, T, "deadline"))
        .transpose()?;
    let restaurant: Option<RestaurantRef> = restaurant
        .map(|raw| row_helpers::parse_json(&raw, T, "restaurant"))
        .transpose()?;

    let mut session = Session::new(
        NewSession {
            host_id: ParticipantId::new(host_id),
            payment_info,
            delivery_fee: row_helpers::parse_decimal(&fee, T, "delivery_fee")?,
            deadline,
            restaurant,
        },
        row_helpers::parse_timestamp(&created_at, T, "created_at")?,
    );
    session.id = SessionId::from_raw(id);
    session.status = row_helpers::parse_enum::<SessionStatus>(&status, T, "status")?;
    session.revision = u64::try_from(revision).map_err(|_| StoreError::CorruptRow {
        table: T,
        column: "revision",
        detail: format!("negative revision {revision}"),
    })?;
    session.updated_at = row_helpers::parse_timestamp(&updated_at, T, "updated_at")?;
    Ok(session)
}

fn load_orders(conn: &Connection, id: &SessionId) -> Result<Vec<Order>, StoreError> {
    const T: &str = "orders";
    let mut stmt = conn.prepare(
        "SELECT participant_id, items, payment_sent, submitted_at, updated_at
         FROM orders WHERE session_id = ?1 ORDER BY position ASC",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut orders = Vec::new();
    while let Some(row) = rows.next()? {
        let participant: String = row_helpers::get(row, 0, T, "participant_id")?;
        let items: String = row_helpers::get(row, 1, T, "items")?;
        let payment_sent: bool = row_helpers::get(row, 2, T, "payment_sent")?;
        let submitted_at: String = row_helpers::get(row, 3, T, "submitted_at")?;
        let updated_at: String = row_helpers::get(row, 4, T, "updated_at")?;

        let items: Vec<StoredItem> = row_helpers::parse_json(&items, T, "items")?;
        orders.push(Order {
            participant_id: ParticipantId::new(participant),
            items: items.into_iter().map(LineItem::from).collect(),
            payment_sent,
            submitted_at: row_helpers::parse_timestamp(&submitted_at, T, "submitted_at")?,
            updated_at: row_helpers::parse_timestamp(&updated_at, T, "updated_at")?,
        });
    }
    Ok(orders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use tally_core::model::{MenuItem, MenuVariant};

    fn store() -> SqliteSessionStore {
        SqliteSessionStore::new(Database::in_memory().unwrap())
    }

    fn new_session(host: &str, fee: Decimal, created_at: DateTime<Utc>) -> Session {
        Session::new(
            NewSession {
                host_id: host.into(),
                payment_info: "PayPal host@example.com".into(),
                delivery_fee: fee,
                deadline: Some(created_at + Duration::minutes(45)),
                restaurant: Some(RestaurantRef {
                    id: "r-1".into(),
                    name: "Noodle Bar".into(),
                    address: None,
                    menu: vec![MenuItem {
                        name: "Ramen".into(),
                        category: Some("Mains".into()),
                        price: dec!(11.90),
                        variants: vec![MenuVariant {
                            name: "Large".into(),
                            price: dec!(13.40),
                        }],
                    }],
                }),
            },
            created_at,
        )
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = store();
        let now = Utc::now();
        let mut session = new_session("host", dec!(4.99), now);
        session
            .upsert_order("ana".into(), vec![LineItem::new("Ramen", dec!(11.90), 2)], now)
            .unwrap();
        session
            .upsert_order("ben".into(), vec![LineItem::new("Gyoza", dec!(0.10), 3)], now)
            .unwrap();

        store.insert(&session).unwrap();
        let loaded = store.get(&session.id).unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.orders()[1].items[0].price, dec!(0.10));
    }

    #[test]
    fn insert_twice_conflicts() {
        let store = store();
        let session = new_session("host", dec!(0), Utc::now());
        store.insert(&session).unwrap();
        assert_matches!(store.insert(&session), Err(StoreError::Conflict(_)));
    }

    #[test]
    fn get_unknown_is_not_found() {
        assert_matches!(store().get(&SessionId::new()), Err(StoreError::NotFound(_)));
    }

    #[test]
    fn put_replaces_orders_and_header() {
        let store = store();
        let now = Utc::now();
        let mut session = new_session("host", dec!(30), now);
        session
            .upsert_order("ana".into(), vec![LineItem::new("Tea", dec!(10), 1)], now)
            .unwrap();
        store.insert(&session).unwrap();

        session.remove_order(&"ana".into(), now).unwrap();
        session
            .upsert_order("ben".into(), vec![LineItem::new("Coffee", dec!(25), 2)], now)
            .unwrap();
        session.set_delivery_fee(dec!(12.5), now).unwrap();
        session.close(now).unwrap();
        store.put(&session).unwrap();

        let loaded = store.get(&session.id).unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.status, SessionStatus::Closed);
        assert!(loaded.order(&"ana".into()).is_none());
    }

    #[test]
    fn put_unknown_is_not_found() {
        let session = new_session("host", dec!(0), Utc::now());
        assert_matches!(store().put(&session), Err(StoreError::NotFound(_)));
    }

    #[test]
    fn put_preserves_order_positions() {
        let store = store();
        let now = Utc::now();
        let mut session = new_session("host", dec!(0), now);
        for who in ["c", "a", "b"] {
            session
                .upsert_order(who.into(), vec![LineItem::new("Tea", dec!(1), 1)], now)
                .unwrap();
        }
        store.insert(&session).unwrap();
        let loaded = store.get(&session.id).unwrap();
        let order: Vec<&str> = loaded.orders().iter().map(|o| o.participant_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn lists_newest_first() {
        let store = store();
        let t0 = Utc::now();
        let mut older = new_session("host", dec!(0), t0);
        let mut newer = new_session("host", dec!(0), t0 + Duration::minutes(5));
        let other = new_session("someone-else", dec!(0), t0);
        older
            .upsert_order("ana".into(), vec![LineItem::new("Tea", dec!(1), 1)], t0)
            .unwrap();
        newer
            .upsert_order("ana".into(), vec![LineItem::new("Tea", dec!(1), 1)], t0)
            .unwrap();
        for s in [&older, &newer, &other] {
            store.insert(s).unwrap();
        }

        let hosted = store.list_for_host(&"host".into()).unwrap();
        assert_eq!(
            hosted.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            vec![newer.id.clone(), older.id.clone()]
        );

        let joined = store.list_for_participant(&"ana".into()).unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0].id, newer.id);
        assert!(store.list_for_participant(&"nobody".into()).unwrap().is_empty());
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        let now = Utc::now();
        let mut session = new_session("host", dec!(7.35), now);
        session
            .upsert_order("ana".into(), vec![LineItem::new("Soup", dec!(6.45), 1)], now)
            .unwrap();
        {
            let store = SqliteSessionStore::new(Database::open(&path).unwrap());
            store.insert(&session).unwrap();
        }
        let reopened = SqliteSessionStore::new(Database::open(&path).unwrap());
        assert_eq!(reopened.get(&session.id).unwrap(), session);
    }

    #[test]
    fn corrupt_items_surface_as_corrupt_row() {
        let store = store();
        let now = Utc::now();
        let mut session = new_session("host", dec!(0), now);
        session
            .upsert_order("ana".into(), vec![LineItem::new("Tea", dec!(1), 1)], now)
            .unwrap();
        store.insert(&session).unwrap();
        store
            .database()
            .with_conn(|conn| {
                let _ = conn.execute("UPDATE orders SET items = 'garbage'", [])?;
                Ok(())
            })
            .unwrap();
        assert_matches!(
            store.get(&session.id),
            Err(StoreError::CorruptRow { table: "orders", column: "items", .. })
        );
    }
}
