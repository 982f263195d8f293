//! Application configuration management.
//!
//! Handles loading, saving, and validating relink configuration including:
//! - Storage location shared by the foreground and background processes
//! - Log retention (entry cap, age cutoff, minimum recency window)
//! - Connection tracker timing (connect timeout, rescan delay, radio backoff, housekeeping)
//! - Background watch interval
//! - HTTP bind address and logging mode
//!
//! Values come from an optional TOML file layered with `RELINK__SECTION__FIELD`
//! environment overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log_store::RetentionPolicy;
use crate::storage::default_data_dir;

/// Environment variable pointing at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "RELINK_CONFIG";

/// Prefix of environment overrides (`RELINK__TRACKER__CONNECT_TIMEOUT_SECS`).
const ENV_PREFIX: &str = "RELINK";

/// Upper bound on retention windows (100 years).
const MAX_RETENTION_HOURS: i64 = 24 * 365 * 100;

/// Errors raised while loading, validating or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found at: {}", .0.display())]
    NotFound(PathBuf),

    /// Sources could not be read or merged.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// The configuration could not be encoded as TOML.
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Durable storage settings.
    pub storage: StorageConfig,
    /// Log retention settings.
    pub retention: RetentionConfig,
    /// Connection tracker timing.
    pub tracker: TrackerConfig,
    /// Background watch loop settings.
    pub watch: WatchConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Durable storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the pairing set and device logs.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Log retention settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Hard cap of entries kept per device.
    pub max_entries: usize,
    /// Entries older than this are dropped on load.
    pub max_age_hours: u64,
    /// Entries this recent are never dropped by the age rule.
    pub min_recent_minutes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age_hours: 24,
            min_recent_minutes: 30,
        }
    }
}

impl RetentionConfig {
    /// Build the policy applied by the log store.
    #[must_use]
    pub fn policy(&self) -> RetentionPolicy {
        let hours = i64::try_from(self.max_age_hours)
            .unwrap_or(MAX_RETENTION_HOURS)
            .min(MAX_RETENTION_HOURS);
        let minutes = i64::try_from(self.min_recent_minutes)
            .unwrap_or(MAX_RETENTION_HOURS * 60)
            .min(MAX_RETENTION_HOURS * 60);
        RetentionPolicy {
            max_entries: self.max_entries,
            max_age: chrono::Duration::hours(hours),
            min_recent: chrono::Duration::minutes(minutes),
        }
    }
}

/// Connection tracker timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// A connect attempt without an outcome after this long is a failure.
    pub connect_timeout_secs: u64,
    /// Delay before rescanning after a rejected or lapsed scan.
    pub rescan_delay_secs: u64,
    /// First backoff step while the radio is unavailable.
    pub radio_backoff_initial_secs: u64,
    /// Backoff ceiling while the radio is unavailable.
    pub radio_backoff_max_secs: u64,
    /// Capacity of the event bus and command queue.
    pub event_buffer: usize,
    /// Unpaired scan results not seen for this long are forgotten.
    pub scan_result_ttl_secs: u64,
    /// Seconds between sweeps of stale scan results and expired device logs.
    pub housekeeping_interval_secs: u64,
    /// Bluetooth adapter name, such as `hci1`. The default adapter when unset.
    pub adapter: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            rescan_delay_secs: 5,
            radio_backoff_initial_secs: 2,
            radio_backoff_max_secs: 60,
            event_buffer: 256,
            scan_result_ttl_secs: 300,
            housekeeping_interval_secs: 600,
            adapter: None,
        }
    }
}

impl TrackerConfig {
    /// Connect attempt timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Delay before a rescan.
    #[must_use]
    pub const fn rescan_delay(&self) -> Duration {
        Duration::from_secs(self.rescan_delay_secs)
    }

    /// How long an unpaired scan result is kept after its last sighting.
    #[must_use]
    pub const fn scan_result_ttl(&self) -> Duration {
        Duration::from_secs(self.scan_result_ttl_secs)
    }

    /// Period of the housekeeping sweep.
    #[must_use]
    pub const fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    /// Backoff delay for the `attempt`-th consecutive radio failure (0-based).
    #[must_use]
    pub fn radio_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let secs = self
            .radio_backoff_initial_secs
            .saturating_mul(factor)
            .min(self.radio_backoff_max_secs);
        Duration::from_secs(secs)
    }
}

/// Background watch loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Seconds between watch ticks.
    pub interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

impl WatchConfig {
    /// Tick interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parsed bind address.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `bind` is not a socket address.
    pub fn bind_addr(&self) -> ConfigResult<SocketAddr> {
        self.bind.parse().map_err(|e| ConfigError::ValidationError {
            field: "server.bind",
            message: format!("'{}' is not a socket address: {e}", self.bind),
        })
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// JSON file logging plus compact stdout when `true`.
    pub production: bool,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            production: false,
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (optional) plus environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value is invalid.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, failing if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] for a missing file, otherwise as [`Config::load`].
    pub fn load_required(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::load(path)
    }

    /// Load from `RELINK_CONFIG` or the platform default path.
    ///
    /// # Errors
    ///
    /// As [`Config::load`].
    pub fn load_default() -> ConfigResult<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map_or_else(Self::default_path, PathBuf::from);
        Self::load(path)
    }

    /// Save configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_err)?;
        Ok(())
    }

    /// Check every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`] or
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &'static str, message: &str| {
            if !ok {
                errors.push(ConfigError::ValidationError {
                    field,
                    message: message.to_string(),
                });
            }
        };

        check(
            self.retention.max_entries > 0,
            "retention.max_entries",
            "must be greater than zero",
        );
        check(
            self.retention.max_age_hours > 0,
            "retention.max_age_hours",
            "must be greater than zero",
        );
        check(
            (1..=120).contains(&self.tracker.connect_timeout_secs),
            "tracker.connect_timeout_secs",
            "must be between 1 and 120",
        );
        check(
            self.tracker.rescan_delay_secs > 0,
            "tracker.rescan_delay_secs",
            "must be greater than zero",
        );
        check(
            self.tracker.radio_backoff_initial_secs > 0,
            "tracker.radio_backoff_initial_secs",
            "must be greater than zero",
        );
        check(
            self.tracker.radio_backoff_max_secs >= self.tracker.radio_backoff_initial_secs,
            "tracker.radio_backoff_max_secs",
            "must not be below radio_backoff_initial_secs",
        );
        check(
            self.tracker.event_buffer > 0,
            "tracker.event_buffer",
            "must be greater than zero",
        );
        check(
            self.tracker.housekeeping_interval_secs > 0,
            "tracker.housekeeping_interval_secs",
            "must be greater than zero",
        );
        check(
            self.watch.interval_secs > 0,
            "watch.interval_secs",
            "must be greater than zero",
        );
        if let Err(e) = self.server.bind_addr() {
            errors.push(e);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Get the configuration file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        // On Linux: /etc/relink/config.toml
        // Elsewhere: <platform config dir>/relink/config.toml
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/relink/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "relink")
                .map(|dirs| dirs.config_dir().join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("./config.toml"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.retention.max_entries, 1000);
        assert_eq!(config.watch.interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.tracker, TrackerConfig::default());
    }

    #[test]
    fn test_load_required_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load_required(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("data");
        config.tracker.connect_timeout_secs = 20;
        config.watch.interval_secs = 45;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.storage.data_dir, config.storage.data_dir);
        assert_eq!(loaded.tracker.connect_timeout_secs, 20);
        assert_eq!(loaded.watch.interval_secs, 45);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[retention]\nmax_entries = 50\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.retention.max_entries, 50);
        assert_eq!(loaded.retention.max_age_hours, 24);
        assert_eq!(loaded.tracker, TrackerConfig::default());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.retention.max_entries = 0;
        config.tracker.connect_timeout_secs = 500;
        config.server.bind = "not an address".into();

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_validation_error() {
        let mut config = Config::default();
        config.watch.interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError {
                field: "watch.interval_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_radio_backoff_is_capped() {
        let tracker = TrackerConfig::default();
        assert_eq!(tracker.radio_backoff(0), Duration::from_secs(2));
        assert_eq!(tracker.radio_backoff(1), Duration::from_secs(4));
        assert_eq!(tracker.radio_backoff(3), Duration::from_secs(16));
        assert_eq!(tracker.radio_backoff(10), Duration::from_secs(60));
        assert_eq!(tracker.radio_backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_retention_policy_conversion() {
        let policy = RetentionConfig::default().policy();
        assert_eq!(policy.max_entries, 1000);
        assert_eq!(policy.max_age, chrono::Duration::hours(24));
        assert_eq!(policy.min_recent, chrono::Duration::minutes(30));
    }
}
