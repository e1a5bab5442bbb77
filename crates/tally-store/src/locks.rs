//! Per-session write locks.
//!
//! Each session id maps to its own `tokio::sync::Mutex`, so writers to the
//! same session queue up (tokio's mutex is FIFO) while writers to different
//! sessions never contend. Entries are pruned when the last holder or waiter
//! goes away, keeping the table bounded by in-flight writes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use tally_core::{Session, SessionId};

use crate::error::StoreError;
use crate::sessions::SessionStore;

type LockTable = DashMap<SessionId, Arc<Mutex<()>>>;

#[derive(Clone, Default)]
pub struct SessionLocks {
    table: Arc<LockTable>,
}

/// Exclusive write access to one session until dropped.
pub struct SessionLockGuard {
    session_id: SessionId,
    table: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLockGuard {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.table, &self.session_id);
    }
}

/// Drop the table entry if nobody else holds or awaits it.
fn prune(table: &LockTable, id: &SessionId) {
    let _ = table.remove_if(id, |_, mutex| Arc::strong_count(mutex) == 1);
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with a held or awaited lock.
    pub fn active(&self) -> usize {
        self.table.len()
    }

    /// Acquire the write lock for `id`, waiting at most `timeout`.
    pub async fn lock(
        &self,
        id: &SessionId,
        timeout: Duration,
    ) -> Result<SessionLockGuard, StoreError> {
        let mutex = self.table.entry(id.clone()).or_default().clone();
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(SessionLockGuard {
                session_id: id.clone(),
                table: Arc::clone(&self.table),
                guard: Some(guard),
            }),
            Err(_) => {
                prune(&self.table, id);
                warn!(session_id = %id, waited_ms = timeout.as_millis() as u64, "session lock timed out");
                Err(StoreError::LockTimeout {
                    session_id: id.clone(),
                    waited: timeout,
                })
            }
        }
    }

    /// Read-modify-write `id` under its lock.
    ///
    /// `mutate` works on a copy; nothing is persisted if it fails. After a
    /// successful `put`, `on_commit` runs while the lock is still held so
    /// observers see commits in lock order.
    pub async fn with_lock<T, E, M, C>(
        &self,
        store: &dyn SessionStore,
        id: &SessionId,
        timeout: Duration,
        mutate: M,
        on_commit: C,
    ) -> Result<(Session, T), E>
    where
        M: FnOnce(&mut Session) -> Result<T, E>,
        C: FnOnce(&Session, &T),
        E: From<StoreError>,
    {
        let _guard = self.lock(id, timeout).await?;
        let mut session = store.get(id)?;
        let output = mutate(&mut session)?;
        store.put(&session)?;
        debug!(session_id = %id, revision = session.revision, "session committed");
        on_commit(&session, &output);
        Ok((session, output))
    }
}
