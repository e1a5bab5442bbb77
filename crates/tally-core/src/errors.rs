use chrono::{DateTime, Utc};

use crate::ids::SessionId;

/// Typed error taxonomy for session operations.
/// Classifies errors as terminal (don't retry), retryable, or caller mistakes.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SessionError {
    // Caller mistakes
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("session not found: {0}")]
    NotFound(String),

    // Terminal
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
    #[error("ordering for session {session_id} closed at deadline {deadline}")]
    DeadlinePassed {
        session_id: SessionId,
        deadline: DateTime<Utc>,
    },

    // Retryable
    #[error("session {0} is busy, try again")]
    Busy(SessionId),
    #[error("transient I/O error: {0}")]
    TransientIo(String),
}

impl SessionError {
    /// Stable machine-readable kind, used as the wire error code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::SessionClosed(_) | Self::DeadlinePassed { .. } => "SESSION_CLOSED",
            Self::Busy(_) => "BUSY",
            Self::TransientIo(_) => "TRANSIENT_IO",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::TransientIo(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_) | Self::SessionClosed(_) | Self::DeadlinePassed { .. }
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
