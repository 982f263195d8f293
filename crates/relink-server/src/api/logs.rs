//! Device log API endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use relink_core::LogEntry;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::device_id;
use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the logs router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(all_logs))
        .route("/{device_id}", get(device_logs).delete(clear_device_logs))
}

/// Log entries in timestamp order.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogsResponse {
    /// Number of entries returned.
    #[schema(example = 1)]
    pub count: usize,

    /// The entries, oldest first.
    pub entries: Vec<LogEntry>,
}

impl From<Vec<LogEntry>> for LogsResponse {
    fn from(entries: Vec<LogEntry>) -> Self {
        Self {
            count: entries.len(),
            entries,
        }
    }
}

/// Every device's log.
#[utoipa::path(
    get,
    path = "/api/logs",
    tag = "logs",
    operation_id = "allLogs",
    summary = "Get all logs",
    description = "Returns the entries of every device, including the adapter \
        bucket, merged in timestamp order.",
    responses(
        (status = 200, description = "Entries", body = LogsResponse),
        (status = 500, description = "Logs could not be read", body = ErrorResponse)
    )
)]
pub async fn all_logs(State(state): State<SharedState>) -> ApiResult<Json<LogsResponse>> {
    Ok(Json(state.tracker.all_logs().await?.into()))
}

/// One device's log.
#[utoipa::path(
    get,
    path = "/api/logs/{device_id}",
    tag = "logs",
    operation_id = "deviceLogs",
    summary = "Get a device's log",
    description = "Returns persisted entries plus any not yet written to disk.",
    params(("device_id" = String, Path, description = "Device identifier or `adapter`")),
    responses(
        (status = 200, description = "Entries", body = LogsResponse),
        (status = 400, description = "Invalid device identifier", body = ErrorResponse)
    )
)]
pub async fn device_logs(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<LogsResponse>> {
    let id = device_id(&raw_id)?;
    Ok(Json(state.tracker.logs_for(&id).await?.into()))
}

/// Clear one device's log.
#[utoipa::path(
    delete,
    path = "/api/logs/{device_id}",
    tag = "logs",
    operation_id = "clearDeviceLogs",
    summary = "Clear a device's log",
    params(("device_id" = String, Path, description = "Device identifier or `adapter`")),
    responses(
        (status = 204, description = "Log cleared"),
        (status = 400, description = "Invalid device identifier", body = ErrorResponse),
        (status = 500, description = "Log could not be removed", body = ErrorResponse)
    )
)]
pub async fn clear_device_logs(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = device_id(&raw_id)?;
    state.tracker.clear_logs(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(all(test, feature = "mock-radio"))]
mod tests {
    use crate::api::test_support::app;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_pairing_is_logged() {
        let app = app().await;
        app.call("PUT", "/api/pairing/AA:BB:CC:DD:EE:FF", None).await;

        let (status, body) = app
            .call("GET", "/api/logs/AA:BB:CC:DD:EE:FF", None)
            .await;

        assert_eq!(status, StatusCode::OK);
        let kinds: Vec<_> = body["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["kind"].as_str().unwrap().to_string())
            .collect();
        assert!(kinds.contains(&"pair".to_string()));
    }

    #[tokio::test]
    async fn test_clear_then_read_is_empty() {
        let app = app().await;
        app.call("PUT", "/api/pairing/A1", None).await;

        let (status, _) = app.call("DELETE", "/api/logs/A1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = app.call("GET", "/api/logs/A1", None).await;
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_all_logs_spans_devices() {
        let app = app().await;
        app.call("PUT", "/api/pairing/A1", None).await;
        app.call("PUT", "/api/pairing/B2", None).await;

        let (status, body) = app.call("GET", "/api/logs", None).await;

        assert_eq!(status, StatusCode::OK);
        let devices: Vec<_> = body["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["device_id"].as_str().unwrap().to_string())
            .collect();
        assert!(devices.contains(&"A1".to_string()));
        assert!(devices.contains(&"B2".to_string()));
    }
}
