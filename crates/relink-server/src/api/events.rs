//! Live tracker events over Server-Sent Events.
//!
//! Each SSE message is named after the event type and carries the event as
//! JSON. A slow client skips events rather than holding the tracker back.

use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use relink_core::TrackerEvent;

use crate::state::SharedState;

/// SSE event name for a tracker event; matches its JSON `type` tag.
const fn event_name(event: &TrackerEvent) -> &'static str {
    match event {
        TrackerEvent::StateChanged { .. } => "state_changed",
        TrackerEvent::DeviceDiscovered(_) => "device_discovered",
        TrackerEvent::ScanStateChanged { .. } => "scan_state_changed",
        TrackerEvent::LogAppended(_) => "log_appended",
        TrackerEvent::Status { .. } => "status",
    }
}

/// Stream tracker events.
#[utoipa::path(
    get,
    path = "/api/events",
    tag = "events",
    operation_id = "streamEvents",
    summary = "Stream tracker events",
    description = "Server-Sent Events stream of state changes, discoveries, \
        scan state, new log entries, and status lines. Only events published \
        after the request are delivered.",
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = TrackerEvent)
    )
)]
pub async fn stream_events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let events = state
        .tracker
        .subscribe()
        .into_stream()
        .map(|event| Event::default().event(event_name(&event)).json_data(&event));

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
