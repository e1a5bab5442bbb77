/// Errors surfaced by a [`SyncTransport`](crate::SyncTransport) or the adapter.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection lost")]
    Disconnected,

    /// The server answered with a typed error.
    #[error("{code}: {message}")]
    Rpc {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Whether reconnecting could help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Disconnected => true,
            Self::Rpc { retryable, .. } => *retryable,
            Self::Protocol(_) => false,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rpc { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
