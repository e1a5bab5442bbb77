use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tally_core::{ParticipantId, Session, SessionId};

use crate::error::StoreError;
use crate::sessions::SessionStore;

/// Process-local [`SessionStore`]. State is lost on restart.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn collect_newest_first(&self, keep: impl Fn(&Session) -> bool) -> Vec<Session> {
        let mut found: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        found
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, session: &Session) -> Result<(), StoreError> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.id
            ))),
            Entry::Vacant(slot) => {
                let _ = slot.insert(session.clone());
                Ok(())
            }
        }
    }

    fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    fn put(&self, session: &Session) -> Result<(), StoreError> {
        match self.sessions.get_mut(&session.id) {
            Some(mut entry) => {
                *entry = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("session {}", session.id))),
        }
    }

    fn list_for_host(&self, host: &ParticipantId) -> Result<Vec<Session>, StoreError> {
        Ok(self.collect_newest_first(|s| s.is_host(host)))
    }

    fn list_for_participant(&self, participant: &ParticipantId) -> Result<Vec<Session>, StoreError> {
        Ok(self.collect_newest_first(|s| s.order(participant).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use tally_core::model::{LineItem, NewSession};

    fn session(host: &str, offset_min: i64) -> Session {
        Session::new(
            NewSession {
                host_id: host.into(),
                payment_info: String::new(),
                delivery_fee: dec!(3),
                deadline: None,
                restaurant: None,
            },
            Utc::now() + Duration::minutes(offset_min),
        )
    }

    #[test]
    fn insert_get_put() {
        let store = MemorySessionStore::new();
        let mut s = session("host", 0);
        store.insert(&s).unwrap();
        assert_matches!(store.insert(&s), Err(StoreError::Conflict(_)));

        s.upsert_order("ana".into(), vec![LineItem::new("Tea", dec!(2), 1)], Utc::now())
            .unwrap();
        store.put(&s).unwrap();
        assert_eq!(store.get(&s.id).unwrap(), s);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let store = MemorySessionStore::new();
        assert_matches!(store.get(&SessionId::new()), Err(StoreError::NotFound(_)));
        assert_matches!(store.put(&session("host", 0)), Err(StoreError::NotFound(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn listings_filter_and_sort() {
        let store = MemorySessionStore::new();
        let old = session("host", -10);
        let mut new = session("host", 0);
        new.upsert_order("ana".into(), vec![LineItem::new("Tea", dec!(2), 1)], Utc::now())
            .unwrap();
        store.insert(&old).unwrap();
        store.insert(&new).unwrap();
        store.insert(&session("other", 5)).unwrap();

        let hosted = store.list_for_host(&"host".into()).unwrap();
        assert_eq!(hosted.len(), 2);
        assert_eq!(hosted[0].id, new.id);
        assert_eq!(hosted[1].id, old.id);

        let joined = store.list_for_participant(&"ana".into()).unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].id, new.id);
    }
}
