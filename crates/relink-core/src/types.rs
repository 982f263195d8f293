//! Shared types and OpenAPI schemas.
//!
//! This module contains the identifiers and event payloads that cross module
//! boundaries: the radio emits [`DiscoveryEvent`] and [`ConnectionEvent`], the
//! tracker publishes [`ConnectionState`] per [`DeviceId`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{RelinkError, Result};

static MAC_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}([:-][0-9A-Fa-f]{2}){5}$").expect("static regex is valid")
});

/// Returns `true` if `value` looks like a Bluetooth MAC address.
///
/// Both `:` and `-` separators are accepted.
#[must_use]
pub fn is_valid_mac_address(value: &str) -> bool {
    MAC_ADDRESS.is_match(value)
}

/// Opaque identifier of a peripheral: a MAC address or a platform UUID.
///
/// MAC addresses are normalised to uppercase with `:` separators so the same
/// peripheral never ends up under two identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Bucket for log entries about the radio as a whole.
    pub const ADAPTER: &'static str = "adapter";

    /// Parse and normalise an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RelinkError::InvalidDeviceId`] for empty or blank input.
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(RelinkError::InvalidDeviceId(value.as_ref().to_string()));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(RelinkError::InvalidDeviceId(trimmed.to_string()));
        }

        if is_valid_mac_address(trimmed) {
            Ok(Self(trimmed.to_ascii_uppercase().replace('-', ":")))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    /// The reserved identifier for adapter-level log entries.
    #[must_use]
    pub fn adapter() -> Self {
        Self(Self::ADAPTER.to_string())
    }

    /// Returns `true` for the reserved adapter bucket.
    #[must_use]
    pub fn is_adapter(&self) -> bool {
        self.0 == Self::ADAPTER
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = RelinkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = RelinkError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-device connection state tracked by the connection tracker.
///
/// A device holds exactly one of these at a time, so "connecting" and
/// "connected" can never both be true for the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not seen yet, or reset after unpairing.
    #[default]
    Idle,
    /// Seen by a scan, about to be connected.
    Discovering,
    /// A connection attempt is in flight.
    Connecting,
    /// Link established.
    Connected,
    /// Link lost or attempt failed; waiting for rediscovery.
    Disconnected,
}

impl ConnectionState {
    /// Returns `true` while a link exists or is being established.
    #[must_use]
    pub const fn is_engaged(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// A single scan hit reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    /// Identifier of the advertising peripheral.
    pub device_id: DeviceId,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl DiscoveryEvent {
    /// Build a discovery event with no name or RSSI.
    #[must_use]
    pub const fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            name: None,
            rssi: None,
        }
    }

    /// Attach an advertised name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach an RSSI reading.
    #[must_use]
    pub const fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

/// A link-level connection change, whoever initiated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Device whose link changed.
    pub device_id: DeviceId,
    /// New link status.
    pub connected: bool,
    /// Platform error attached to a disconnect, if any.
    pub error: Option<String>,
}

impl ConnectionEvent {
    /// A link came up.
    #[must_use]
    pub const fn connected(device_id: DeviceId) -> Self {
        Self {
            device_id,
            connected: true,
            error: None,
        }
    }

    /// A link went down, optionally with a platform error.
    #[must_use]
    pub const fn disconnected(device_id: DeviceId, error: Option<String>) -> Self {
        Self {
            device_id,
            connected: false,
            error,
        }
    }
}

/// Address of a GATT characteristic on a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct CharacteristicRef {
    /// Service UUID.
    pub service: Uuid,
    /// Characteristic UUID within the service.
    pub characteristic: Uuid,
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Latest scan observation of a device, as shown in scan-result lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DiscoveredDevice {
    /// Device identifier.
    pub device_id: DeviceId,
    /// Last advertised name.
    #[schema(example = "Heart Rate Strap")]
    pub name: Option<String>,
    /// Last RSSI in dBm.
    #[schema(example = -58)]
    pub rssi: Option<i16>,
    /// Whether the device is in the pairing registry.
    pub paired: bool,
    /// When the device was last seen (UTC).
    pub last_seen_utc: DateTime<Utc>,
}
