//! Background watch loop.
//!
//! Runs in the headless process. Every tick re-reads the pairing registry,
//! since the foreground process may have changed it, and re-asserts scanning.
//! Once nothing is paired the loop stops scanning and exits.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelinkError;
use crate::tracker::TrackerHandle;

/// Why [`WatchLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// The registry was empty on a tick.
    NoPairedDevices,
    /// The cancellation token fired.
    Cancelled,
    /// The tracker shut down underneath the loop.
    TrackerStopped,
}

/// Periodic re-arm of the tracker.
#[derive(Debug)]
pub struct WatchLoop {
    tracker: TrackerHandle,
    interval: Duration,
    cancel: CancellationToken,
}

impl WatchLoop {
    /// A loop ticking every `interval`; the first tick is immediate.
    pub fn new(tracker: TrackerHandle, interval: Duration) -> Self {
        Self {
            tracker,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tick until nothing is paired, the token fires or the tracker stops.
    pub async fn run(self) -> WatchExit {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Watch loop started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Watch loop cancelled");
                    return WatchExit::Cancelled;
                }
                _ = ticker.tick() => {}
            }

            if let Some(exit) = self.tick().await {
                return exit;
            }
        }
    }

    async fn tick(&self) -> Option<WatchExit> {
        let paired = match self.tracker.refresh_pairings().await {
            Ok(paired) => paired,
            Err(RelinkError::TrackerStopped) => return Some(WatchExit::TrackerStopped),
            Err(e) => {
                warn!(error = %e, "Failed to read pairing registry; will retry");
                return None;
            }
        };

        if paired.is_empty() {
            info!("No paired devices left; watch loop exiting");
            if let Err(e) = self.tracker.stop_scanning().await {
                warn!(error = %e, "Failed to stop scanning");
            }
            return Some(WatchExit::NoPairedDevices);
        }

        debug!(paired = paired.len(), "Watch tick");
        match self.tracker.ensure_scanning().await {
            Ok(()) => None,
            Err(RelinkError::TrackerStopped) => Some(WatchExit::TrackerStopped),
            Err(e) => {
                warn!(error = %e, "Failed to ensure scanning");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::log_store::{LogStore, RetentionPolicy};
    use crate::pairing::PairingRegistry;
    use crate::radio::MockRadio;
    use crate::storage::MemoryStore;
    use crate::tracker::Tracker;
    use crate::types::DeviceId;

    async fn setup() -> (Arc<MockRadio>, PairingRegistry, TrackerHandle) {
        let radio = Arc::new(MockRadio::new());
        let store = Arc::new(MemoryStore::new());
        let registry = PairingRegistry::new(store.clone());
        let logs = LogStore::new(store, RetentionPolicy::default());
        let handle = Tracker::new(radio.clone(), registry.clone(), logs)
            .start()
            .await
            .unwrap();
        (radio, registry, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_exits_immediately() {
        let (radio, _registry, handle) = setup().await;
        let exit = WatchLoop::new(handle, Duration::from_secs(30)).run().await;

        assert_eq!(exit, WatchExit::NoPairedDevices);
        assert_eq!(radio.scan_start_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_emptied_stops_loop_without_new_scan() {
        let (radio, registry, handle) = setup().await;
        let device = DeviceId::parse("AA:BB:CC:DD:EE:FF").unwrap();
        registry.add_paired(&device).unwrap();

        let watch = tokio::spawn(WatchLoop::new(handle.clone(), Duration::from_secs(30)).run());

        time::sleep(Duration::from_secs(1)).await;
        assert!(handle.is_scanning().await.unwrap());
        assert_eq!(radio.scan_start_count(), 1);

        registry.remove_paired(&device).unwrap();
        let exit = watch.await.unwrap();

        assert_eq!(exit, WatchExit::NoPairedDevices);
        assert_eq!(radio.scan_start_count(), 1);
        assert!(!handle.is_scanning().await.unwrap());
        time::sleep(Duration::from_millis(10)).await;
        assert!(!radio.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_idempotent() {
        let (radio, registry, handle) = setup().await;
        registry
            .add_paired(&DeviceId::parse("A1").unwrap())
            .unwrap();

        let watch = WatchLoop::new(handle, Duration::from_secs(30));
        let cancel = watch.cancellation_token();
        let task = tokio::spawn(watch.run());

        time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), WatchExit::Cancelled);
        assert_eq!(radio.scan_start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_tracker_ends_loop() {
        let (_radio, registry, handle) = setup().await;
        registry
            .add_paired(&DeviceId::parse("A1").unwrap())
            .unwrap();
        handle.shutdown().await.unwrap();

        let exit = WatchLoop::new(handle, Duration::from_secs(30)).run().await;
        assert_eq!(exit, WatchExit::TrackerStopped);
    }
}
