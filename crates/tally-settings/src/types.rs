//! Settings types. All structs deserialize from camelCase JSON and fill
//! missing keys from their `Default`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallySettings {
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

impl TallySettings {
    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue("server.maxSendQueue must be at least 1".into()));
        }
        if self.session.lock_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("session.lockTimeoutMs must be at least 1".into()));
        }
        if self.session.max_items_per_order == 0 {
            return Err(SettingsError::InvalidValue(
                "session.maxItemsPerOrder must be at least 1".into(),
            ));
        }
        if self.session.max_order_total == 0 {
            return Err(SettingsError::InvalidValue(
                "session.maxOrderTotal must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP + WebSocket port. 0 picks a free port.
    pub port: u16,
    /// Per-subscriber outbound queue length.
    pub max_send_queue: usize,
    /// WebSocket ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Subscribers silent for longer than this are dropped.
    pub client_timeout_ms: u64,
    /// How often the dead-subscriber sweep runs.
    pub cleanup_interval_ms: u64,
    /// SQLite file path; `:memory:` selects the in-memory store.
    pub database_path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            max_send_queue: 256,
            heartbeat_interval_ms: 30_000,
            client_timeout_ms: 90_000,
            cleanup_interval_ms: 60_000,
            database_path: tally_home().join("tally.db").to_string_lossy().into_owned(),
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_path == ":memory:"
    }
}

/// Session lifecycle and validation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Max wait for the per-session write lock before failing with `BUSY`.
    pub lock_timeout_ms: u64,
    /// Reject participant mutations once the deadline has passed.
    pub enforce_deadline: bool,
    pub max_items_per_order: usize,
    pub max_name_length: usize,
    /// Largest accepted order total, in whole currency units.
    pub max_order_total: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            enforce_deadline: true,
            max_items_per_order: 100,
            max_name_length: 200,
            max_order_total: 1_000_000,
        }
    }
}

impl SessionSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Logging output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` takes precedence.
    pub level: String,
    /// JSON lines when true, human-readable otherwise.
    pub json: bool,
    /// Per-module level overrides (e.g. `"tally_store": "debug"`).
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            modules: BTreeMap::new(),
        }
    }
}

/// `~/.tally`, falling back to `/tmp/.tally` without `HOME`.
pub fn tally_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".tally")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = TallySettings::default();
        assert_eq!(s.server.port, 9091);
        assert_eq!(s.server.max_send_queue, 256);
        assert_eq!(s.session.lock_timeout(), Duration::from_secs(5));
        assert!(s.session.enforce_deadline);
        assert_eq!(s.logging.level, "info");
        assert!(s.server.database_path.ends_with("tally.db"));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(TallySettings::default()).unwrap();
        assert!(json["server"]["maxSendQueue"].is_number());
        assert!(json["session"]["enforceDeadline"].is_boolean());
    }

    #[test]
    fn memory_store_marker() {
        let mut s = ServerSettings::default();
        assert!(!s.uses_memory_store());
        s.database_path = ":memory:".into();
        assert!(s.uses_memory_store());
    }

    #[test]
    fn validate_rejects_zero_lock_timeout() {
        let mut s = TallySettings::default();
        s.session.lock_timeout_ms = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn order_total_cap_defaults_and_must_be_positive() {
        let mut s = TallySettings::default();
        assert_eq!(s.session.max_order_total, 1_000_000);
        s.session.max_order_total = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }
}
