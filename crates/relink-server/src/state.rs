//! Application state shared across handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relink_core::{Config, PairingRegistry, TrackerHandle};

/// Shared application state, cloned into every handler.
pub type SharedState = Arc<AppState>;

/// Everything a request handler can reach.
///
/// The tracker owns all mutable device state; handlers only hold its handle.
pub struct AppState {
    /// Configuration the server was started with.
    pub config: Config,
    /// Handle to the running connection tracker.
    pub tracker: TrackerHandle,
    /// Pairing registry, read directly for listings.
    pub registry: PairingRegistry,
    /// When the server started.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wrap the running components into shared state.
    pub fn new(config: Config, tracker: TrackerHandle, registry: PairingRegistry) -> SharedState {
        Arc::new(Self {
            config,
            tracker,
            registry,
            started_at: Utc::now(),
        })
    }
}
