//! Unified error types for the relink core library.
//!
//! This module provides a unified error type [`RelinkError`] that covers all failure
//! modes across the relink system. Each module also has its own specific error types
//! (`StorageError`, `RadioError`, `ConfigError`) for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Context preservation**: Wrapped errors maintain their original context
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use relink_core::error::{RelinkError, Result};
//!
//! fn require_paired(paired: bool, id: &str) -> Result<()> {
//!     if !paired {
//!         return Err(RelinkError::NotPaired(id.to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StorageError;

/// The unified error type for all relink operations.
///
/// Per-device failures inside the tracker never surface through this type;
/// they become `Error` log entries. Callers see it for commands (pair, unpair,
/// reads and writes) and for storage access.
#[derive(Debug, Error)]
pub enum RelinkError {
    // =========================================================================
    // STORAGE ERRORS
    // =========================================================================
    /// Durable storage could not be read or written.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // =========================================================================
    // RADIO ERRORS
    // =========================================================================
    /// The Bluetooth adapter is missing or powered off.
    #[error("Bluetooth radio unavailable: {0}. Ensure the adapter is present and powered on.")]
    RadioUnavailable(String),

    /// Starting or stopping a scan was rejected by the platform.
    #[error("Bluetooth scan failed: {0}")]
    ScanFailure(String),

    /// A connection attempt was rejected.
    #[error("Connection to '{device_id}' failed: {reason}")]
    ConnectionFailure {
        /// Device the attempt targeted.
        device_id: String,
        /// Platform reason.
        reason: String,
    },

    /// A connection attempt neither succeeded nor failed in time.
    #[error("Connection to '{device_id}' timed out after {secs} seconds")]
    ConnectionTimeout {
        /// Device the attempt targeted.
        device_id: String,
        /// Timeout that elapsed.
        secs: u64,
    },

    /// A GATT operation was attempted on a device without a link.
    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    /// The device was not found by the radio.
    #[error("Device not found: '{0}'. Ensure the device is powered on and within range.")]
    DeviceNotFound(String),

    /// A GATT operation failed.
    #[error("GATT operation failed: {0}")]
    Gatt(String),

    // =========================================================================
    // PAIRING & INPUT ERRORS
    // =========================================================================
    /// The identifier is empty or malformed.
    #[error("Invalid device identifier: '{0}'")]
    InvalidDeviceId(String),

    /// The operation requires a paired device.
    #[error("Device '{0}' is not paired")]
    NotPaired(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // RUNTIME ERRORS
    // =========================================================================
    /// The tracker task has shut down and no longer accepts commands.
    #[error("Connection tracker has stopped")]
    TrackerStopped,

    /// The OS autostart hook could not be installed or removed.
    #[error("Autostart hook error: {0}")]
    Autostart(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for relink operations.
pub type Result<T> = std::result::Result<T, RelinkError>;

impl RelinkError {
    /// Returns `true` if this error is related to durable storage.
    #[inline]
    #[must_use]
    pub const fn is_storage_error(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::IoError(_))
    }

    /// Returns `true` if this error is related to radio operations.
    #[inline]
    #[must_use]
    pub const fn is_radio_error(&self) -> bool {
        matches!(
            self,
            Self::RadioUnavailable(_)
                | Self::ScanFailure(_)
                | Self::ConnectionFailure { .. }
                | Self::ConnectionTimeout { .. }
                | Self::NotConnected(_)
                | Self::DeviceNotFound(_)
                | Self::Gatt(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is likely recoverable without user intervention.
    ///
    /// Recoverable errors are retried by rediscovery or by the rescan timer.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RadioUnavailable(_)
                | Self::ScanFailure(_)
                | Self::ConnectionFailure { .. }
                | Self::ConnectionTimeout { .. }
                | Self::DeviceNotFound(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidDeviceId(_) => 400,

            // 404 Not Found
            Self::ConfigNotFound(_) | Self::DeviceNotFound(_) => 404,

            // 409 Conflict - valid request, wrong state
            Self::NotPaired(_) | Self::NotConnected(_) => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::Storage(_) | Self::IoError(_) | Self::Autostart(_) | Self::TrackerStopped => {
                500
            }

            // 502 Bad Gateway - the peripheral rejected the operation
            Self::ConnectionFailure { .. } | Self::Gatt(_) => 502,

            // 503 Service Unavailable - Bluetooth hardware issues
            Self::RadioUnavailable(_) | Self::ScanFailure(_) => 503,

            // 504 Gateway Timeout
            Self::ConnectionTimeout { .. } => 504,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Storage(_) => "STORAGE_ERROR",
            Self::RadioUnavailable(_) => "RADIO_UNAVAILABLE",
            Self::ScanFailure(_) => "SCAN_FAILURE",
            Self::ConnectionFailure { .. } => "CONNECTION_FAILURE",
            Self::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::Gatt(_) => "GATT_ERROR",
            Self::InvalidDeviceId(_) => "INVALID_DEVICE_ID",
            Self::NotPaired(_) => "NOT_PAIRED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::TrackerStopped => "TRACKER_STOPPED",
            Self::Autostart(_) => "AUTOSTART_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for RelinkError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::Serialize(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::WriteError { path, source } => Self::Storage(StorageError::Write {
                key: path.display().to_string(),
                source,
            }),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::radio::RadioError> for RelinkError {
    fn from(err: crate::radio::RadioError) -> Self {
        use crate::radio::RadioError;
        match err {
            RadioError::AdapterNotFound => Self::RadioUnavailable("no adapter found".into()),
            RadioError::AdapterPoweredOff => Self::RadioUnavailable("adapter powered off".into()),
            RadioError::ScanRejected(message) => Self::ScanFailure(message),
            RadioError::ConnectRejected { device_id, reason } => Self::ConnectionFailure {
                device_id: device_id.to_string(),
                reason,
            },
            RadioError::DeviceNotFound { device_id } => Self::DeviceNotFound(device_id.to_string()),
            RadioError::NotConnected { device_id } => Self::NotConnected(device_id.to_string()),
            RadioError::CharacteristicNotFound { characteristic } => {
                Self::Gatt(format!("characteristic {characteristic} not found"))
            }
            RadioError::Operation(message) => Self::Gatt(message),
        }
    }
}

impl From<crate::autostart::AutostartError> for RelinkError {
    fn from(err: crate::autostart::AutostartError) -> Self {
        Self::Autostart(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
