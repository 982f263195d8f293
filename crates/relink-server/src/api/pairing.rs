//! Pairing API endpoints.
//!
//! The registry is shared with the background watch process through the file
//! store, so a device paired here is also tracked there on its next tick.

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::device_id;
use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the pairing router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_paired))
        .route("/{device_id}", put(pair_device).delete(unpair_device))
}

/// Paired devices.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "devices": ["AA:BB:CC:DD:EE:FF"] }))]
pub struct PairedDevicesResponse {
    /// Paired device identifiers in sorted order.
    pub devices: Vec<String>,
}

/// Result of a pair or unpair request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "device_id": "AA:BB:CC:DD:EE:FF",
    "paired": true,
    "changed": true
}))]
pub struct PairingResponse {
    /// Normalised device identifier.
    pub device_id: String,

    /// Whether the device is paired now.
    pub paired: bool,

    /// Whether the request changed the registry.
    pub changed: bool,
}

/// List paired devices.
#[utoipa::path(
    get,
    path = "/api/pairing",
    tag = "pairing",
    operation_id = "listPaired",
    summary = "List paired devices",
    responses(
        (status = 200, description = "Paired devices", body = PairedDevicesResponse),
        (status = 500, description = "Registry could not be read", body = ErrorResponse)
    )
)]
pub async fn list_paired(
    State(state): State<SharedState>,
) -> ApiResult<Json<PairedDevicesResponse>> {
    let registry = state.registry.clone();
    let paired = tokio::task::spawn_blocking(move || registry.load_all())
        .await
        .map_err(|e| ApiError::internal(format!("registry task failed: {e}")))??;

    Ok(Json(PairedDevicesResponse {
        devices: paired.into_iter().map(String::from).collect(),
    }))
}

/// Pair a device.
#[utoipa::path(
    put,
    path = "/api/pairing/{device_id}",
    tag = "pairing",
    operation_id = "pairDevice",
    summary = "Pair a device",
    description = "Adds the device to the registry and starts scanning so it \
        is connected as soon as it is discovered. Pairing an already paired \
        device is a no-op.",
    params(("device_id" = String, Path, description = "Device identifier")),
    responses(
        (status = 200, description = "Device paired", body = PairingResponse),
        (status = 400, description = "Invalid device identifier", body = ErrorResponse),
        (status = 500, description = "Registry could not be written", body = ErrorResponse)
    )
)]
pub async fn pair_device(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<PairingResponse>> {
    let id = device_id(&raw_id)?;
    let changed = state.tracker.pair(&id).await?;

    Ok(Json(PairingResponse {
        device_id: id.to_string(),
        paired: true,
        changed,
    }))
}

/// Unpair a device.
#[utoipa::path(
    delete,
    path = "/api/pairing/{device_id}",
    tag = "pairing",
    operation_id = "unpairDevice",
    summary = "Unpair a device",
    description = "Removes the device from the registry, disconnects it, and \
        stops forwarding its notifications. Its log is kept.",
    params(("device_id" = String, Path, description = "Device identifier")),
    responses(
        (status = 200, description = "Device unpaired", body = PairingResponse),
        (status = 400, description = "Invalid device identifier", body = ErrorResponse),
        (status = 500, description = "Registry could not be written", body = ErrorResponse)
    )
)]
pub async fn unpair_device(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<PairingResponse>> {
    let id = device_id(&raw_id)?;
    let changed = state.tracker.unpair(&id).await?;

    Ok(Json(PairingResponse {
        device_id: id.to_string(),
        paired: false,
        changed,
    }))
}
