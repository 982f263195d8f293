//! Device API endpoints.
//!
//! Connection states, scan control, and GATT access on connected devices.
//! Every GATT operation is also written to the device's log by the tracker.

use axum::extract::{Path, Query, State};
use axum::routing::post;
use axum::{Json, Router};
use relink_core::{parse_hex, printable_text, CharacteristicRef, ConnectionState, DiscoveredDevice};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::device_id;
use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the devices router. Scan control lives at `/api/scan/*`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", axum::routing::get(list_devices))
        .route("/{device_id}/disconnect", post(disconnect))
        .route("/{device_id}/read", post(read_characteristic))
        .route("/{device_id}/write", post(write_characteristic))
        .route(
            "/{device_id}/subscribe",
            post(subscribe_characteristic).delete(unsubscribe_characteristic),
        )
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Connection state of one device.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "AA:BB:CC:DD:EE:FF",
    "state": "connected"
}))]
pub struct DeviceState {
    /// Device identifier.
    #[schema(value_type = String, example = "AA:BB:CC:DD:EE:FF")]
    pub device_id: String,

    /// Current connection state.
    pub state: ConnectionState,
}

/// Everything the tracker knows about devices right now.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DevicesResponse {
    /// Whether a scan is running.
    #[schema(example = true)]
    pub scanning: bool,

    /// State of every device seen since the server started.
    pub states: Vec<DeviceState>,

    /// Latest sighting of every discovered device.
    pub scan_results: Vec<DiscoveredDevice>,
}

/// Scan status after a scan control request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "scanning": true }))]
pub struct ScanResponse {
    /// Whether a scan is running.
    pub scanning: bool,
}

/// Device state after a disconnect request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DisconnectResponse {
    /// Device identifier.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub device_id: String,

    /// State after the disconnect.
    pub state: ConnectionState,
}

/// Value read from a characteristic.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "AA:BB:CC:DD:EE:FF",
    "characteristic": {
        "service": "0000180d-0000-1000-8000-00805f9b34fb",
        "characteristic": "00002a37-0000-1000-8000-00805f9b34fb"
    },
    "value_hex": "48 69",
    "value_text": "Hi"
}))]
pub struct ReadResponse {
    /// Device identifier.
    pub device_id: String,

    /// Characteristic that was read.
    pub characteristic: CharacteristicRef,

    /// Value as space-separated hex bytes.
    pub value_hex: String,

    /// Value as text when every byte is printable.
    pub value_text: Option<String>,
}

/// Request body for a characteristic write.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "service": "0000180d-0000-1000-8000-00805f9b34fb",
    "characteristic": "00002a39-0000-1000-8000-00805f9b34fb",
    "value_hex": "01"
}))]
pub struct WriteRequest {
    /// Service UUID.
    pub service: Uuid,

    /// Characteristic UUID within the service.
    pub characteristic: Uuid,

    /// Bytes to write as hex. Whitespace between bytes is allowed.
    #[schema(example = "01 ff")]
    pub value_hex: String,
}

/// Response after a successful write.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WriteResponse {
    /// Device identifier.
    pub device_id: String,

    /// Characteristic that was written.
    pub characteristic: CharacteristicRef,

    /// Number of bytes written.
    #[schema(example = 2)]
    pub bytes_written: usize,
}

/// Subscription status of a characteristic.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionResponse {
    /// Device identifier.
    pub device_id: String,

    /// Characteristic the request was about.
    pub characteristic: CharacteristicRef,

    /// Whether notifications are being forwarded to the log.
    pub subscribed: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// List device states and scan results.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    operation_id = "listDevices",
    summary = "List devices",
    description = "Returns the connection state of every device seen since the \
        server started, the latest scan results, and whether a scan is running.",
    responses(
        (status = 200, description = "Devices listed", body = DevicesResponse)
    )
)]
pub async fn list_devices(State(state): State<SharedState>) -> ApiResult<Json<DevicesResponse>> {
    let states = state
        .tracker
        .states()
        .await?
        .into_iter()
        .map(|(device_id, state)| DeviceState {
            device_id: device_id.to_string(),
            state,
        })
        .collect();

    Ok(Json(DevicesResponse {
        scanning: state.tracker.is_scanning().await?,
        states,
        scan_results: state.tracker.scan_results().await?,
    }))
}

/// Start scanning.
#[utoipa::path(
    post,
    path = "/api/scan/start",
    tag = "devices",
    operation_id = "startScan",
    summary = "Start scanning",
    description = "Starts a scan unless one is already running. Paired devices \
        are connected as soon as they are discovered. Scan failures are reported \
        in the adapter log and on the event stream, not here.",
    responses(
        (status = 200, description = "Scan requested", body = ScanResponse)
    )
)]
pub async fn start_scan(State(state): State<SharedState>) -> ApiResult<Json<ScanResponse>> {
    state.tracker.ensure_scanning().await?;
    Ok(Json(ScanResponse {
        scanning: state.tracker.is_scanning().await?,
    }))
}

/// Stop scanning.
#[utoipa::path(
    post,
    path = "/api/scan/stop",
    tag = "devices",
    operation_id = "stopScan",
    summary = "Stop scanning",
    description = "Stops the running scan and cancels any scheduled rescan. \
        Existing connections are kept.",
    responses(
        (status = 200, description = "Scan stopped", body = ScanResponse)
    )
)]
pub async fn stop_scan(State(state): State<SharedState>) -> ApiResult<Json<ScanResponse>> {
    state.tracker.stop_scanning().await?;
    Ok(Json(ScanResponse { scanning: false }))
}

/// Disconnect a device.
#[utoipa::path(
    post,
    path = "/api/devices/{device_id}/disconnect",
    tag = "devices",
    operation_id = "disconnectDevice",
    summary = "Disconnect a device",
    description = "Closes the link to the device. A paired device reconnects \
        the next time it is discovered.",
    params(("device_id" = String, Path, description = "Device identifier")),
    responses(
        (status = 200, description = "Device disconnected", body = DisconnectResponse),
        (status = 400, description = "Invalid device identifier", body = ErrorResponse),
        (status = 502, description = "The radio rejected the disconnect", body = ErrorResponse)
    )
)]
pub async fn disconnect(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<DisconnectResponse>> {
    let id = device_id(&raw_id)?;
    state.tracker.disconnect(&id).await?;
    Ok(Json(DisconnectResponse {
        state: state.tracker.state_of(&id).await?,
        device_id: id.to_string(),
    }))
}

/// Read a characteristic.
#[utoipa::path(
    post,
    path = "/api/devices/{device_id}/read",
    tag = "gatt",
    operation_id = "readCharacteristic",
    summary = "Read a characteristic",
    params(("device_id" = String, Path, description = "Device identifier")),
    request_body = CharacteristicRef,
    responses(
        (status = 200, description = "Value read", body = ReadResponse),
        (status = 409, description = "Device is not connected", body = ErrorResponse),
        (status = 502, description = "The device rejected the read", body = ErrorResponse)
    )
)]
pub async fn read_characteristic(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
    Json(characteristic): Json<CharacteristicRef>,
) -> ApiResult<Json<ReadResponse>> {
    let id = device_id(&raw_id)?;
    let value = state
        .tracker
        .read_characteristic(&id, &characteristic)
        .await?;

    Ok(Json(ReadResponse {
        device_id: id.to_string(),
        characteristic,
        value_hex: relink_core::format_hex(&value),
        value_text: printable_text(&value),
    }))
}

/// Write a characteristic.
#[utoipa::path(
    post,
    path = "/api/devices/{device_id}/write",
    tag = "gatt",
    operation_id = "writeCharacteristic",
    summary = "Write a characteristic",
    params(("device_id" = String, Path, description = "Device identifier")),
    request_body = WriteRequest,
    responses(
        (status = 200, description = "Value written", body = WriteResponse),
        (status = 400, description = "Value is not valid hex", body = ErrorResponse),
        (status = 409, description = "Device is not connected", body = ErrorResponse),
        (status = 502, description = "The device rejected the write", body = ErrorResponse)
    )
)]
pub async fn write_characteristic(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
    Json(request): Json<WriteRequest>,
) -> ApiResult<Json<WriteResponse>> {
    let id = device_id(&raw_id)?;
    let value = parse_hex(&request.value_hex).ok_or_else(|| {
        ApiError::bad_request(
            "invalid_hex",
            format!("'{}' is not a sequence of hex bytes", request.value_hex),
        )
    })?;
    let characteristic = CharacteristicRef {
        service: request.service,
        characteristic: request.characteristic,
    };
    let bytes_written = value.len();

    state
        .tracker
        .write_characteristic(&id, &characteristic, value)
        .await?;

    Ok(Json(WriteResponse {
        device_id: id.to_string(),
        characteristic,
        bytes_written,
    }))
}

/// Subscribe to notifications.
#[utoipa::path(
    post,
    path = "/api/devices/{device_id}/subscribe",
    tag = "gatt",
    operation_id = "subscribeCharacteristic",
    summary = "Subscribe to notifications",
    description = "Logs every notification from the characteristic until \
        unsubscribed or the device is lost.",
    params(("device_id" = String, Path, description = "Device identifier")),
    request_body = CharacteristicRef,
    responses(
        (status = 200, description = "Subscribed", body = SubscriptionResponse),
        (status = 409, description = "Device is not connected", body = ErrorResponse)
    )
)]
pub async fn subscribe_characteristic(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
    Json(characteristic): Json<CharacteristicRef>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let id = device_id(&raw_id)?;
    state
        .tracker
        .subscribe_characteristic(&id, &characteristic)
        .await?;

    Ok(Json(SubscriptionResponse {
        device_id: id.to_string(),
        characteristic,
        subscribed: true,
    }))
}

/// Unsubscribe from notifications.
#[utoipa::path(
    delete,
    path = "/api/devices/{device_id}/subscribe",
    tag = "gatt",
    operation_id = "unsubscribeCharacteristic",
    summary = "Unsubscribe from notifications",
    params(
        ("device_id" = String, Path, description = "Device identifier"),
        ("service" = String, Query, description = "Service UUID"),
        ("characteristic" = String, Query, description = "Characteristic UUID")
    ),
    responses(
        (status = 200, description = "Unsubscribed", body = SubscriptionResponse),
        (status = 404, description = "No such subscription", body = ErrorResponse)
    )
)]
pub async fn unsubscribe_characteristic(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
    Query(characteristic): Query<CharacteristicRef>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let id = device_id(&raw_id)?;
    if !state
        .tracker
        .unsubscribe_characteristic(&id, &characteristic)
    {
        return Err(ApiError::NotFound {
            error_code: "not_subscribed".to_string(),
            message: format!("{id} has no subscription to {characteristic}"),
        });
    }

    Ok(Json(SubscriptionResponse {
        device_id: id.to_string(),
        characteristic,
        subscribed: false,
    }))
}

#[cfg(all(test, feature = "mock-radio"))]
mod tests {
    use super::*;
    use crate::api::test_support::app;
    use axum::http::StatusCode;
    use serde_json::json;

    fn heart_rate() -> CharacteristicRef {
        CharacteristicRef {
            service: Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb),
            characteristic: Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb),
        }
    }

    #[tokio::test]
    async fn test_list_devices_starts_empty() {
        let app = app().await;
        let (status, body) = app.call("GET", "/api/devices", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scanning"], false);
        assert_eq!(body["states"], json!([]));
        assert_eq!(body["scan_results"], json!([]));
    }

    #[tokio::test]
    async fn test_scan_start_and_stop() {
        let app = app().await;

        let (status, _) = app.call("POST", "/api/scan/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.radio.scan_start_count(), 1);

        let (status, body) = app.call("POST", "/api/scan/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scanning"], false);
    }

    #[tokio::test]
    async fn test_connected_device_is_listed() {
        let app = app().await;
        app.connect("aa:bb:cc:dd:ee:ff").await;

        let mut state = serde_json::Value::Null;
        for _ in 0..100 {
            let (_, body) = app.call("GET", "/api/devices", None).await;
            state = body["states"][0]["state"].clone();
            if state == "connected" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state, "connected");
    }

    #[tokio::test]
    async fn test_read_returns_hex_and_text() {
        let app = app().await;
        let device = app.connect("AA:BB:CC:DD:EE:FF").await;
        app.radio.set_value(&device, heart_rate(), b"Hi".to_vec());

        let (status, body) = app
            .call(
                "POST",
                "/api/devices/AA:BB:CC:DD:EE:FF/read",
                Some(serde_json::to_value(heart_rate()).unwrap()),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value_hex"], "48 69");
        assert_eq!(body["value_text"], "Hi");
    }

    #[tokio::test]
    async fn test_read_without_link_is_conflict() {
        let app = app().await;
        let (status, body) = app
            .call(
                "POST",
                "/api/devices/AA:BB:CC:DD:EE:FF/read",
                Some(serde_json::to_value(heart_rate()).unwrap()),
            )
            .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "not_connected");
    }

    #[tokio::test]
    async fn test_write_parses_hex_body() {
        let app = app().await;
        let device = app.connect("AA:BB:CC:DD:EE:FF").await;
        let target = heart_rate();

        let (status, body) = app
            .call(
                "POST",
                "/api/devices/AA:BB:CC:DD:EE:FF/write",
                Some(json!({
                    "service": target.service,
                    "characteristic": target.characteristic,
                    "value_hex": "01 ff"
                })),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bytes_written"], 2);
        assert_eq!(app.radio.written(&device, target), Some(vec![0x01, 0xff]));
    }

    #[tokio::test]
    async fn test_write_rejects_bad_hex() {
        let app = app().await;
        let target = heart_rate();
        let (status, body) = app
            .call(
                "POST",
                "/api/devices/AA:BB:CC:DD:EE:FF/write",
                Some(json!({
                    "service": target.service,
                    "characteristic": target.characteristic,
                    "value_hex": "zz"
                })),
            )
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_hex");
    }

    #[tokio::test]
    async fn test_subscribe_then_unsubscribe() {
        let app = app().await;
        app.connect("AA:BB:CC:DD:EE:FF").await;
        let target = heart_rate();

        let (status, body) = app
            .call(
                "POST",
                "/api/devices/AA:BB:CC:DD:EE:FF/subscribe",
                Some(serde_json::to_value(target).unwrap()),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscribed"], true);

        let uri = format!(
            "/api/devices/AA:BB:CC:DD:EE:FF/subscribe?service={}&characteristic={}",
            target.service, target.characteristic
        );
        let (status, body) = app.call("DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscribed"], false);

        let (status, body) = app.call("DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_subscribed");
    }

    #[tokio::test]
    async fn test_disconnect_unknown_device_leaves_it_idle() {
        let app = app().await;
        let (status, body) = app
            .call("POST", "/api/devices/AA:BB:CC:DD:EE:FF/disconnect", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");
    }

    #[tokio::test]
    async fn test_blank_device_id_is_rejected() {
        let app = app().await;
        let (status, body) = app
            .call("POST", "/api/devices/%20/disconnect", None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_device_id");
    }
}
