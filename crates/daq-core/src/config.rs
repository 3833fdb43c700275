//! Engine configuration.
//!
//! Settings are layered with `figment`:
//!
//! 1. Library defaults (the [`Provider`] impl on [`Settings`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed `RUSTDAQ_`; nested fields use double
//!    underscores, e.g. `RUSTDAQ_SCAN__HISTORY_SIZE=50` or
//!    `RUSTDAQ_SEQUENCE__PUBLISH_TIMEOUT_MS=500`
//!
//! All timeouts are stored in milliseconds and exposed as [`Duration`]s.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DaqError, DaqResult};

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Session identity
    #[serde(default)]
    pub session: SessionSettings,
    /// Logging
    #[serde(default)]
    pub log: LogSettings,
    /// Scan engine
    #[serde(default)]
    pub scan: ScanSettings,
    /// Sequence / group aggregation
    #[serde(default)]
    pub sequence: SequenceSettings,
}

/// Session identity copied into every `scan_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Session name
    #[serde(default = "default_session_name")]
    pub name: String,
    /// User name
    #[serde(default = "default_user_name")]
    pub user: String,
}

/// Logging output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Scan engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Capacity of the recent-scan history ring
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Data-watch polling period while `on_state` asks for it
    #[serde(default = "default_data_watch_period_ms")]
    pub data_watch_period_ms: u64,
    /// Bounded wait for an in-flight data-watch callback at finalization
    #[serde(default = "default_data_watch_shutdown_ms")]
    pub data_watch_shutdown_ms: u64,
    /// Grace period granted to in-flight stop calls when a kill arrives
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Scan counter key used when the writer has no filename
    #[serde(default = "default_filename")]
    pub default_filename: String,
}

/// Sequence exit bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSettings {
    /// Wait for the grouping scan to reach START
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    /// Wait for deferred member-add tasks at exit
    #[serde(default = "default_subscan_timeout_ms")]
    pub subscan_timeout_ms: u64,
    /// Wait for every queued member to be published
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Wait for the grouping scan's run task
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

fn default_session_name() -> String {
    "demo".to_string()
}

fn default_user_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "daq".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_history_size() -> usize {
    20
}

fn default_data_watch_period_ms() -> u64 {
    100
}

fn default_data_watch_shutdown_ms() -> u64 {
    1000
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_filename() -> String {
    "memory".to_string()
}

fn default_start_timeout_ms() -> u64 {
    3000
}

fn default_subscan_timeout_ms() -> u64 {
    1000
}

fn default_publish_timeout_ms() -> u64 {
    2000
}

fn default_join_timeout_ms() -> u64 {
    5000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name: default_session_name(),
            user: default_user_name(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            data_watch_period_ms: default_data_watch_period_ms(),
            data_watch_shutdown_ms: default_data_watch_shutdown_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            default_filename: default_filename(),
        }
    }
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            subscan_timeout_ms: default_subscan_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl ScanSettings {
    /// Data-watch polling period.
    pub fn data_watch_period(&self) -> Duration {
        Duration::from_millis(self.data_watch_period_ms)
    }

    /// Bounded wait for the data-watch task at finalization.
    pub fn data_watch_shutdown(&self) -> Duration {
        Duration::from_millis(self.data_watch_shutdown_ms)
    }

    /// Kill-mask grace period.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl SequenceSettings {
    /// Grouping scan start bound.
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Member-add bound.
    pub fn subscan_timeout(&self) -> Duration {
        Duration::from_millis(self.subscan_timeout_ms)
    }

    /// Publication bound.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Grouping scan join bound.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Library Defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Settings::default()).data()
    }
}

impl Settings {
    /// Load defaults, then `path` if it exists, then `RUSTDAQ_*` variables.
    pub fn load(path: Option<&Path>) -> DaqResult<Self> {
        let mut figment = Figment::from(Settings::default());

        if let Some(path) = path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            } else {
                warn!(path = %path.display(), "config file not found, using defaults");
            }
        }

        figment = figment.merge(Env::prefixed("RUSTDAQ_").split("__"));

        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that parse but make no sense.
    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log.level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log.format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.log.format,
                valid_formats.join(", ")
            )));
        }

        if self.session.name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "session.name must not be empty".into(),
            ));
        }

        if self.scan.history_size == 0 {
            return Err(DaqError::Configuration(
                "scan.history_size must be at least 1".into(),
            ));
        }

        if self.scan.data_watch_period_ms == 0 {
            return Err(DaqError::Configuration(
                "scan.data_watch_period_ms must be positive".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_defaults_are_valid() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.scan.history_size, 20);
        assert_eq!(settings.sequence.start_timeout(), Duration::from_secs(3));
        assert!(settings.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[session]\nname = \"id31\"\n\n[scan]\nhistory_size = 5\nstop_grace_ms = 10"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.session.name, "id31");
        assert_eq!(settings.scan.history_size, 5);
        assert_eq!(settings.scan.stop_grace(), Duration::from_millis(10));
        assert_eq!(settings.scan.data_watch_period_ms, 100);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        std::env::set_var("RUSTDAQ_SEQUENCE__PUBLISH_TIMEOUT_MS", "250");
        let settings = Settings::load(None);
        std::env::remove_var("RUSTDAQ_SEQUENCE__PUBLISH_TIMEOUT_MS");

        let settings = settings.unwrap();
        assert_eq!(settings.sequence.publish_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_validation_rejects_zero_history() {
        let mut settings = Settings::default();
        settings.scan.history_size = 0;
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(_))
        ));

        let mut settings = Settings::default();
        settings.log.format = "xml".into();
        assert!(settings.validate().is_err());
    }
}
