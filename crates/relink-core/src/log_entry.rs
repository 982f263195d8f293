//! Log entry model and its persisted record format.
//!
//! Entries are immutable once built. Each one is persisted as a JSON record
//! `{id, timestamp, deviceId, deviceName?, direction, kind, message,
//! hexPayload?, textPayload?}` where `timestamp` is Unix milliseconds and
//! `direction` / `kind` are enum indices. Both processes read and write this
//! format, so indices must never be reordered.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::types::DeviceId;

/// Who originated the logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by this host to the peripheral.
    Outgoing,
    /// Received from the peripheral.
    Incoming,
    /// Produced locally (state changes, errors).
    System,
}

impl Direction {
    const ALL: [Self; 3] = [Self::Outgoing, Self::Incoming, Self::System];

    /// Stable index used in the persisted record.
    #[must_use]
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Direction::index`].
    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }
}

/// Kind of protocol event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Scan hit.
    Scan,
    /// Link established.
    Connect,
    /// Link lost or closed.
    Disconnect,
    /// Added to the pairing registry.
    Pair,
    /// Removed from the pairing registry.
    Unpair,
    /// Characteristic read.
    Read,
    /// Characteristic write.
    Write,
    /// Characteristic notification.
    Notify,
    /// Characteristic indication.
    Indicate,
    /// GATT services enumerated.
    ServiceDiscovery,
    /// Failure of any operation.
    Error,
    /// Anything else worth recording.
    Info,
}

impl LogKind {
    const ALL: [Self; 12] = [
        Self::Scan,
        Self::Connect,
        Self::Disconnect,
        Self::Pair,
        Self::Unpair,
        Self::Read,
        Self::Write,
        Self::Notify,
        Self::Indicate,
        Self::ServiceDiscovery,
        Self::Error,
        Self::Info,
    ];

    /// Stable index used in the persisted record.
    #[must_use]
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Inverse of [`LogKind::index`].
    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Scan => "scan",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Pair => "pair",
            Self::Unpair => "unpair",
            Self::Read => "read",
            Self::Write => "write",
            Self::Notify => "notify",
            Self::Indicate => "indicate",
            Self::ServiceDiscovery => "service_discovery",
            Self::Error => "error",
            Self::Info => "info",
        };
        f.write_str(label)
    }
}

/// Render bytes as space-separated uppercase hex pairs (`"48 69 0A"`).
#[must_use]
pub fn format_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Parse the output of [`format_hex`]. Case-insensitive; any whitespace separates pairs.
#[must_use]
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    text.split_whitespace()
        .map(|pair| {
            if pair.len() == 2 {
                u8::from_str_radix(pair, 16).ok()
            } else {
                None
            }
        })
        .collect()
}

/// Decode a payload as text only when every byte is printable ASCII (0x20..=0x7E).
#[must_use]
pub fn printable_text(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() || !bytes.iter().all(|b| (0x20..=0x7E).contains(b)) {
        return None;
    }
    Some(bytes.iter().map(|&b| char::from(b)).collect())
}

fn now_millis() -> DateTime<Utc> {
    truncate_to_millis(Utc::now())
}

fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// One immutable log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LogEntry {
    /// Unique, time-ordered identifier (UUIDv7).
    #[schema(example = "01928f4e-7b1a-7c3d-9e2f-3a4b5c6d7e8f")]
    id: String,
    /// When the event happened, millisecond precision.
    timestamp: DateTime<Utc>,
    /// Device the entry belongs to.
    device_id: DeviceId,
    /// Device name at the time of the event.
    #[schema(example = "Heart Rate Strap")]
    device_name: Option<String>,
    /// Who originated the event.
    direction: Direction,
    /// Event kind.
    kind: LogKind,
    /// Human-readable description.
    #[schema(example = "Connected")]
    message: String,
    /// Raw payload as space-separated hex.
    #[serde(
        serialize_with = "serialize_hex_payload",
        deserialize_with = "deserialize_hex_payload",
        default
    )]
    #[schema(value_type = Option<String>, example = "48 69")]
    payload: Option<Vec<u8>>,
    /// Payload as text when every byte is printable ASCII.
    #[schema(example = "Hi")]
    payload_text: Option<String>,
}

fn serialize_hex_payload<S: Serializer>(
    payload: &Option<Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match payload {
        Some(bytes) => serializer.serialize_some(&format_hex(bytes)),
        None => serializer.serialize_none(),
    }
}

fn deserialize_hex_payload<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<u8>>, D::Error> {
    let text: Option<String> = Option::deserialize(deserializer)?;
    text.map(|t| {
        parse_hex(&t).ok_or_else(|| serde::de::Error::custom(format!("invalid hex payload '{t}'")))
    })
    .transpose()
}

impl LogEntry {
    /// Start a new entry stamped with the current time and a fresh id.
    #[must_use]
    pub fn new(
        device_id: DeviceId,
        direction: Direction,
        kind: LogKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            timestamp: now_millis(),
            device_id,
            device_name: None,
            direction,
            kind,
            message: message.into(),
            payload: None,
            payload_text: None,
        }
    }

    /// Shorthand for a locally produced entry.
    #[must_use]
    pub fn system(device_id: DeviceId, kind: LogKind, message: impl Into<String>) -> Self {
        Self::new(device_id, Direction::System, kind, message)
    }

    /// Attach the device name.
    #[must_use]
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.device_name = name;
        self
    }

    /// Attach a raw payload; the text form is derived from it.
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload_text = printable_text(&payload);
        self.payload = Some(payload);
        self
    }

    /// Override the timestamp (truncated to milliseconds).
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = truncate_to_millis(timestamp);
        self
    }

    /// Unique identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Event time.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Owning device.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Device name at the time of the event.
    #[must_use]
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Event origin.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Event kind.
    #[must_use]
    pub const fn kind(&self) -> LogKind {
        self.kind
    }

    /// Human-readable description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Printable-ASCII decoding of the payload.
    #[must_use]
    pub fn payload_text(&self) -> Option<&str> {
        self.payload_text.as_deref()
    }

    /// Payload rendered as hex.
    #[must_use]
    pub fn payload_hex(&self) -> Option<String> {
        self.payload.as_deref().map(format_hex)
    }

    /// Encode as the persisted JSON record.
    ///
    /// # Errors
    ///
    /// Returns an error only if JSON encoding fails.
    pub fn to_record(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&StoredEntry::from(self))
    }

    /// Decode a persisted JSON record.
    ///
    /// # Errors
    ///
    /// Returns a [`RecordError`] describing the first invalid field.
    pub fn from_record(record: &str) -> Result<Self, RecordError> {
        let stored: StoredEntry = serde_json::from_str(record)?;
        Self::try_from(stored)
    }
}

/// Why a persisted record could not be decoded.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Not a JSON record of the expected shape.
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
    /// Timestamp outside the representable range.
    #[error("invalid timestamp {0}")]
    Timestamp(i64),
    /// Unknown direction index.
    #[error("unknown direction index {0}")]
    Direction(u8),
    /// Unknown kind index.
    #[error("unknown kind index {0}")]
    Kind(u8),
    /// Hex payload that does not parse.
    #[error("invalid hex payload '{0}'")]
    Hex(String),
    /// Empty or malformed device id.
    #[error("invalid device id '{0}'")]
    DeviceId(String),
}

/// Persisted shape of a [`LogEntry`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    id: String,
    timestamp: i64,
    device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
    direction: u8,
    kind: u8,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hex_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text_payload: Option<String>,
}

impl From<&LogEntry> for StoredEntry {
    fn from(entry: &LogEntry) -> Self {
        Self {
            id: entry.id.clone(),
            timestamp: entry.timestamp.timestamp_millis(),
            device_id: entry.device_id.to_string(),
            device_name: entry.device_name.clone(),
            direction: entry.direction.index(),
            kind: entry.kind.index(),
            message: entry.message.clone(),
            hex_payload: entry.payload_hex(),
            text_payload: entry.payload_text.clone(),
        }
    }
}

impl TryFrom<StoredEntry> for LogEntry {
    type Error = RecordError;

    fn try_from(stored: StoredEntry) -> Result<Self, Self::Error> {
        let timestamp = DateTime::from_timestamp_millis(stored.timestamp)
            .ok_or(RecordError::Timestamp(stored.timestamp))?;
        let direction =
            Direction::from_index(stored.direction).ok_or(RecordError::Direction(stored.direction))?;
        let kind = LogKind::from_index(stored.kind).ok_or(RecordError::Kind(stored.kind))?;
        let device_id = DeviceId::parse(&stored.device_id)
            .map_err(|_| RecordError::DeviceId(stored.device_id.clone()))?;
        let payload = stored
            .hex_payload
            .map(|hex| parse_hex(&hex).ok_or(RecordError::Hex(hex)))
            .transpose()?;

        // The text form is derived, never trusted from disk.
        let payload_text = payload.as_deref().and_then(printable_text);

        Ok(Self {
            id: stored.id,
            timestamp,
            device_id,
            device_name: stored.device_name,
            direction,
            kind,
            message: stored.message,
            payload,
            payload_text,
        })
    }
}
