use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema;

/// Shared handle to the tally SQLite database.
///
/// `rusqlite::Connection` is not `Sync`, so every access goes through one
/// `parking_lot` mutex. Clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open `path`, creating parent directories and the schema as needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", dir.display())))?;
        }
        let db = Self::prepare(Connection::open(path)?)?;
        info!(path = %path.display(), "session database ready");
        Ok(db)
    }

    /// Private in-memory database, gone when the last clone drops.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        f(&self.conn.lock())
    }

    /// Run `f` in a transaction; an error from `f` rolls everything back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(schema::CREATE_TABLES)
        .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

    let stored: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match stored {
        Some(v) if v > schema::SCHEMA_VERSION => Err(StoreError::Database(format!(
            "schema version {v} is newer than this build ({})",
            schema::SCHEMA_VERSION
        ))),
        Some(_) => Ok(()),
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )?;
            debug!(version = schema::SCHEMA_VERSION, "initialized schema");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    const NOW: &str = "2026-01-01T12:00:00Z";

    fn insert_session(conn: &Connection, id: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO sessions (id, host_id, payment_info, delivery_fee, created_at, updated_at)
             VALUES (?1, 'host', '', '30', ?2, ?2)",
            params![id, NOW],
        )
    }

    fn insert_order(conn: &Connection, session: &str, who: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO orders (session_id, participant_id, position, items, submitted_at, updated_at)
             VALUES (?1, ?2, 0, '[]', ?3, ?3)",
            params![session, who, NOW],
        )
    }

    fn count(db: &Database, table: &str) -> u32 {
        db.with_conn(|conn| Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn fresh_database_records_schema_version() {
        let db = Database::in_memory().unwrap();
        let version: u32 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT version FROM schema_version", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn one_order_row_per_participant() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            insert_session(conn, "sess_a")?;
            insert_order(conn, "sess_a", "ana")?;
            assert!(insert_order(conn, "sess_a", "ana").is_err());
            insert_session(conn, "sess_b")?;
            insert_order(conn, "sess_b", "ana")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count(&db, "orders"), 2);
    }

    #[test]
    fn orders_follow_their_session() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            assert!(insert_order(conn, "sess_missing", "ana").is_err());
            insert_session(conn, "sess_a")?;
            insert_order(conn, "sess_a", "ana")?;
            insert_order(conn, "sess_a", "bo")?;
            conn.execute("DELETE FROM sessions WHERE id = 'sess_a'", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count(&db, "orders"), 0);
    }

    #[test]
    fn failed_transaction_leaves_no_partial_session() {
        let db = Database::in_memory().unwrap();
        let result: Result<(), StoreError> = db.with_tx(|tx| {
            insert_session(tx, "sess_a")?;
            insert_order(tx, "sess_a", "ana")?;
            insert_order(tx, "sess_a", "ana")?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(count(&db, "sessions"), 0);
        assert_eq!(count(&db, "orders"), 0);
    }

    #[test]
    fn reopened_file_keeps_rows_in_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("tally.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| Ok(insert_session(conn, "sess_a")?)).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(count(&db, "sessions"), 1);
        assert_eq!(count(&db, "schema_version"), 1);
        let mode: String = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        Database::open(&path)
            .unwrap()
            .with_conn(|conn| Ok(conn.execute("UPDATE schema_version SET version = 99", [])?))
            .unwrap();
        assert!(matches!(Database::open(&path), Err(StoreError::Database(_))));
    }
}
