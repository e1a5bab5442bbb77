use std::time::Duration;

use tally_core::{SessionError, SessionId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("lock on session {session_id} not acquired within {waited:?}")]
    LockTimeout {
        session_id: SessionId,
        waited: Duration,
    },

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => SessionError::NotFound(what),
            StoreError::LockTimeout { session_id, .. } => SessionError::Busy(session_id),
            other => SessionError::TransientIo(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn maps_to_session_error_kinds() {
        let id = SessionId::new();
        assert_matches!(
            SessionError::from(StoreError::NotFound("session x".into())),
            SessionError::NotFound(_)
        );
        assert_matches!(
            SessionError::from(StoreError::LockTimeout {
                session_id: id.clone(),
                waited: Duration::from_millis(10),
            }),
            SessionError::Busy(busy) if busy == id
        );
        let io = SessionError::from(StoreError::Database("disk I/O error".into()));
        assert_matches!(io, SessionError::TransientIo(_));
        assert!(io.is_retryable());
    }
}
