//! Health check API endpoint.
//!
//! Provides a simple health check endpoint for monitoring and load balancers.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "uptime_secs": 3600,
    "tracker_running": true
}))]
pub struct HealthResponse {
    /// Service status: `ok`, or `degraded` when the tracker has stopped.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Seconds since the server started.
    #[schema(example = 3600)]
    pub uptime_secs: u64,

    /// Whether the connection tracker still accepts commands.
    #[schema(example = true)]
    pub tracker_running: bool,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns basic service status information. The status is \
        `degraded` when the connection tracker is no longer running.",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let tracker_running = state.tracker.is_scanning().await.is_ok();
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);

    Json(HealthResponse {
        status: if tracker_running { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: u64::try_from(uptime_secs).unwrap_or_default(),
        tracker_running,
    })
}


#[cfg(all(test, feature = "mock-radio"))]
mod route_tests {
    use axum::http::StatusCode;

    use crate::api::test_support::app;

    #[tokio::test]
    async fn test_health_route() {
        let app = app().await;
        let (status, body) = app.call("GET", "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tracker_running"], true);
    }

    #[tokio::test]
    async fn test_openapi_route() {
        let app = app().await;
        let (status, body) = app.call("GET", "/api/openapi.json", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["info"]["title"], "relink API");
    }
}
