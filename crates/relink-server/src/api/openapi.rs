//! OpenAPI specification generation for the relink API.
//!
//! The document is served at `/api/openapi.json` and written to disk by the
//! `gen-openapi` binary for client generation.

use axum::Json;
use relink_core::{
    CharacteristicRef, ConnectionState, DeviceId, Direction, DiscoveredDevice, LogEntry, LogKind,
    StatusLevel, TrackerEvent,
};
use utoipa::OpenApi;

use super::devices::{
    DeviceState, DevicesResponse, DisconnectResponse, ReadResponse, ScanResponse,
    SubscriptionResponse, WriteRequest, WriteResponse,
};
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::logs::LogsResponse;
use super::pairing::{PairedDevicesResponse, PairingResponse};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for relink.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "relink API",
        version = "0.1.0",
        description = r#"
# relink API

relink keeps paired Bluetooth Low Energy peripherals connected and keeps a
log of everything that happens to them.

## Overview

1. **Pairing**: Paired devices are connected automatically whenever a scan finds them
2. **Devices**: Connection states, scan control, and GATT reads, writes and notifications
3. **Logs**: A bounded, time-windowed event log per device
4. **Events**: Live state changes and log entries as Server-Sent Events

The background `relink-watch` process shares the pairing registry and logs
with this server through the data directory.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local relink server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "devices", description = "Connection states and scanning"),
        (name = "gatt", description = "Characteristic reads, writes and notifications"),
        (name = "pairing", description = "The pairing registry"),
        (name = "logs", description = "Per-device event logs"),
        (name = "events", description = "Live tracker events")
    ),
    paths(
        // Health endpoints
        super::health::health_check,
        // Device endpoints
        super::devices::list_devices,
        super::devices::start_scan,
        super::devices::stop_scan,
        super::devices::disconnect,
        // GATT endpoints
        super::devices::read_characteristic,
        super::devices::write_characteristic,
        super::devices::subscribe_characteristic,
        super::devices::unsubscribe_characteristic,
        // Pairing endpoints
        super::pairing::list_paired,
        super::pairing::pair_device,
        super::pairing::unpair_device,
        // Log endpoints
        super::logs::all_logs,
        super::logs::device_logs,
        super::logs::clear_device_logs,
        // Event stream
        super::events::stream_events,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Device types
            DeviceId,
            ConnectionState,
            DiscoveredDevice,
            DeviceState,
            DevicesResponse,
            ScanResponse,
            DisconnectResponse,
            // GATT types
            CharacteristicRef,
            ReadResponse,
            WriteRequest,
            WriteResponse,
            SubscriptionResponse,
            // Pairing types
            PairedDevicesResponse,
            PairingResponse,
            // Log types
            Direction,
            LogKind,
            LogEntry,
            LogsResponse,
            // Event types
            StatusLevel,
            TrackerEvent,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "relink API");
        assert!(spec.paths.paths.contains_key("/api/pairing/{device_id}"));
        assert!(spec.paths.paths.contains_key("/api/events"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"relink API\""));
    }
}
