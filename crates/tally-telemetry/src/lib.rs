use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tally_settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level {level:?} for {target}")]
    InvalidLevel { target: String, level: String },
    #[error("failed to install subscriber: {0}")]
    Install(String),
    #[error("failed to reload filter: {0}")]
    Reload(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tally_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines when true, human-readable otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    pub fn from_settings(settings: &LoggingSettings) -> Result<Self, TelemetryError> {
        let parse = |target: &str, raw: &str| {
            Level::from_str(raw).map_err(|_| TelemetryError::InvalidLevel {
                target: target.to_string(),
                level: raw.to_string(),
            })
        };
        let log_level = parse("default", &settings.level)?;
        let module_levels = settings
            .modules
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse(module, level)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok(Self {
            log_level,
            module_levels,
            json: settings.json,
        })
    }
}

/// Build an `EnvFilter` directive string such as `info,tally_store=debug`.
pub fn filter_directives(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut directives = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

/// Keeps the installed filter reloadable.
pub struct TelemetryGuard {
    base_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        self.reload
            .reload(EnvFilter::new(&directives))
            .map_err(|e| TelemetryError::Reload(e.to_string()))?;
        tracing::info!(module, %level, "log level changed");
        Ok(())
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }

    /// Current directive string (ignores any RUST_LOG applied at start-up).
    pub fn directives(&self) -> String {
        filter_directives(self.base_level, &self.level_filter.read())
    }
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (filter_layer, reload) = reload::Layer::new(env_filter);
    let registry = tracing_subscriber::registry().with(filter_layer);

    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_span_list(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.map_err(|e| TelemetryError::Install(e.to_string()))?;

    Ok(TelemetryGuard {
        base_level: config.log_level,
        level_filter: Arc::new(RwLock::new(config.module_levels)),
        reload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn directives_include_modules() {
        let d = filter_directives(
            Level::WARN,
            &[("tally_store".into(), Level::DEBUG), ("tally_server".into(), Level::TRACE)],
        );
        assert_eq!(d, "warn,tally_store=debug,tally_server=trace");
    }

    #[test]
    fn config_from_settings() {
        let mut modules = BTreeMap::new();
        modules.insert("tally_store".to_string(), "debug".to_string());
        let settings = LoggingSettings {
            level: "warn".into(),
            json: false,
            modules,
        };
        let config = TelemetryConfig::from_settings(&settings).unwrap();
        assert_eq!(config.log_level, Level::WARN);
        assert_eq!(config.module_levels, vec![("tally_store".to_string(), Level::DEBUG)]);
        assert!(!config.json);
    }

    #[test]
    fn config_rejects_unknown_level() {
        let settings = LoggingSettings {
            level: "loud".into(),
            ..LoggingSettings::default()
        };
        assert!(matches!(
            TelemetryConfig::from_settings(&settings),
            Err(TelemetryError::InvalidLevel { .. })
        ));
    }

    #[test]
    fn guard_reloads_module_levels() {
        let guard = init_telemetry(TelemetryConfig {
            json: false,
            ..TelemetryConfig::default()
        })
        .unwrap();
        guard.set_module_level("tally_store", Level::DEBUG).unwrap();
        guard.set_module_level("tally_store", Level::TRACE).unwrap();
        assert_eq!(guard.module_levels(), vec![("tally_store".to_string(), Level::TRACE)]);
        assert_eq!(guard.directives(), "info,tally_store=trace");
    }
}
