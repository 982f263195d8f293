//! Broadcast bus for tracker events.
//!
//! Any number of observers can subscribe. A slow observer that falls behind
//! the channel capacity skips the missed events rather than blocking the
//! tracker.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use utoipa::ToSchema;

use crate::log_entry::LogEntry;
use crate::types::{ConnectionState, DeviceId, DiscoveredDevice};

/// Severity of a [`TrackerEvent::Status`] message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    /// Informational.
    Info,
    /// Something failed but the tracker carries on.
    Error,
}

/// Everything observers can learn from the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    /// A device moved to a new connection state.
    StateChanged {
        /// Device whose state changed.
        device_id: DeviceId,
        /// New state.
        state: ConnectionState,
    },
    /// A scan hit updated the scan-result list.
    DeviceDiscovered(DiscoveredDevice),
    /// Scanning started or stopped.
    ScanStateChanged {
        /// Whether a scan is now active.
        active: bool,
    },
    /// A log entry was recorded.
    LogAppended(LogEntry),
    /// Human-readable status line.
    Status {
        /// Severity.
        level: StatusLevel,
        /// Message text.
        message: String,
    },
}

impl TrackerEvent {
    /// Informational status line.
    pub fn info(message: impl Into<String>) -> Self {
        Self::Status {
            level: StatusLevel::Info,
            message: message.into(),
        }
    }

    /// Error status line.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Status {
            level: StatusLevel::Error,
            message: message.into(),
        }
    }
}

/// Publishing side of the bus. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TrackerEvent>,
}

impl EventBus {
    /// Create a bus holding up to `capacity` undelivered events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish `event`. Events published with no subscribers are dropped.
    pub fn publish(&self, event: TrackerEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    /// Start observing events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving side of the bus. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<TrackerEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<TrackerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` of events, for SSE and similar consumers.
    pub fn into_stream(self) -> impl futures::Stream<Item = TrackerEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(TrackerEvent::ScanStateChanged { active: true });

        assert_eq!(
            first.recv().await,
            Some(TrackerEvent::ScanStateChanged { active: true })
        );
        assert_eq!(
            second.recv().await,
            Some(TrackerEvent::ScanStateChanged { active: true })
        );
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(TrackerEvent::info("nobody listening"));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(TrackerEvent::info(format!("status {i}")));
        }

        assert_eq!(sub.recv().await, Some(TrackerEvent::info("status 3")));
        assert_eq!(sub.recv().await, Some(TrackerEvent::info("status 4")));
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = EventBus::new(4);
        let stream = bus.subscribe().into_stream();
        bus.publish(TrackerEvent::error("boom"));
        drop(bus);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events, vec![TrackerEvent::error("boom")]);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(TrackerEvent::StateChanged {
            device_id: DeviceId::parse("A1").unwrap(),
            state: ConnectionState::Connecting,
        })
        .unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["state"], "connecting");
        assert_eq!(json["device_id"], "A1");
    }
}
