//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `devices` - Device states, scanning, and GATT access
//! - `pairing` - The pairing registry
//! - `logs` - Per-device event logs
//! - `events` - Live tracker events as Server-Sent Events
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post};
use axum::Router;
use relink_core::DeviceId;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod devices;
pub mod error;
pub mod events;
pub mod health;
pub mod logs;
pub mod openapi;
pub mod pairing;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                        - Health check
/// /api
/// ├── /devices                   - States, scan results, GATT access
/// ├── /scan/start, /scan/stop    - Scan control
/// ├── /pairing                   - Pairing registry
/// ├── /logs                      - Device logs
/// ├── /events                    - Server-Sent Events
/// └── /openapi.json              - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/scan/start", post(devices::start_scan))
                .route("/scan/stop", post(devices::stop_scan))
                .route("/events", get(events::stream_events))
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/devices", devices::router())
                .nest("/pairing", pairing::router())
                .nest("/logs", logs::router()),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Parse a device id taken from a path segment.
fn device_id(raw: &str) -> ApiResult<DeviceId> {
    Ok(DeviceId::parse(raw)?)
}
