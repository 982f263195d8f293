//! In-process radio for tests and for running without Bluetooth hardware.
//!
//! Tests drive it by emitting discovery and connection events and by
//! scripting how connect attempts and scans behave.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;
use uuid::Uuid;

use super::{Radio, RadioError, RadioResult};
use crate::types::{CharacteristicRef, ConnectionEvent, DeviceId, DiscoveryEvent};

/// What a connect attempt to a device does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// The link comes up and a `connected` event is emitted.
    #[default]
    Succeed,
    /// The attempt is rejected with this reason.
    Fail(String),
    /// The attempt never completes.
    Hang,
}

type GattKey = (DeviceId, CharacteristicRef);

#[derive(Default)]
struct MockState {
    scan_tx: Option<UnboundedSender<DiscoveryEvent>>,
    connection_txs: Vec<UnboundedSender<ConnectionEvent>>,
    connection_errors: VecDeque<RadioError>,
    scan_errors: VecDeque<RadioError>,
    scan_starts: usize,
    default_behavior: ConnectBehavior,
    behaviors: HashMap<DeviceId, ConnectBehavior>,
    connect_calls: Vec<DeviceId>,
    connected: HashSet<DeviceId>,
    bonded: HashSet<DeviceId>,
    services: HashMap<DeviceId, Vec<Uuid>>,
    values: HashMap<GattKey, Vec<u8>>,
    written: HashMap<GattKey, Vec<u8>>,
    notify_txs: HashMap<GattKey, Vec<UnboundedSender<Vec<u8>>>>,
}

impl MockState {
    fn broadcast_connection(&mut self, event: &ConnectionEvent) {
        self.connection_txs
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    fn require_connected(&self, device_id: &DeviceId) -> RadioResult<()> {
        if self.connected.contains(device_id) {
            Ok(())
        } else {
            Err(RadioError::NotConnected {
                device_id: device_id.clone(),
            })
        }
    }
}

/// Scriptable [`Radio`].
#[derive(Default)]
pub struct MockRadio {
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MockRadio")
            .field("scanning", &state.scan_tx.is_some())
            .field("connected", &state.connected)
            .finish_non_exhaustive()
    }
}

impl MockRadio {
    /// A radio where every connect succeeds and nothing is advertising.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Behaviour for devices without a specific script.
    pub fn set_default_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state().default_behavior = behavior;
    }

    /// Script connect attempts to `device_id`.
    pub fn set_connect_behavior(&self, device_id: &DeviceId, behavior: ConnectBehavior) {
        self.state().behaviors.insert(device_id.clone(), behavior);
    }

    /// Make the next `start_scan` fail with `error`. Calls queue up.
    pub fn queue_scan_error(&self, error: RadioError) {
        self.state().scan_errors.push_back(error);
    }

    /// Deliver an advertisement to the active scan. Returns `false` if no scan is active.
    pub fn emit_discovery(&self, event: DiscoveryEvent) -> bool {
        let state = self.state();
        state
            .scan_tx
            .as_ref()
            .is_some_and(|tx| tx.unbounded_send(event).is_ok())
    }

    /// End the active scan stream as if the platform had stopped it.
    pub fn end_scan(&self) {
        self.state().scan_tx = None;
    }

    /// Make the next `connection_events` call fail with `error`. Calls queue up.
    pub fn queue_connection_events_error(&self, error: RadioError) {
        self.state().connection_errors.push_back(error);
    }

    /// End every open connection event stream as if the platform had dropped it.
    pub fn end_connection_events(&self) {
        self.state().connection_txs.clear();
    }

    /// Number of connection event streams still being listened to.
    #[must_use]
    pub fn connection_listener_count(&self) -> usize {
        self.state()
            .connection_txs
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Deliver a link change as if another app or the device caused it.
    pub fn emit_connection(&self, event: ConnectionEvent) {
        let mut state = self.state();
        if event.connected {
            state.connected.insert(event.device_id.clone());
        } else {
            state.connected.remove(&event.device_id);
        }
        state.broadcast_connection(&event);
    }

    /// Number of `start_scan` calls that returned a stream.
    #[must_use]
    pub fn scan_start_count(&self) -> usize {
        self.state().scan_starts
    }

    /// Whether a scan stream is open.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.state().scan_tx.is_some()
    }

    /// Every connect call so far, in order.
    #[must_use]
    pub fn connect_calls(&self) -> Vec<DeviceId> {
        self.state().connect_calls.clone()
    }

    /// Number of connect calls for `device_id`.
    #[must_use]
    pub fn connect_count(&self, device_id: &DeviceId) -> usize {
        self.state()
            .connect_calls
            .iter()
            .filter(|id| *id == device_id)
            .count()
    }

    /// Whether the link to `device_id` is up.
    #[must_use]
    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.state().connected.contains(device_id)
    }

    /// Whether `device_id` has an OS-level bond.
    #[must_use]
    pub fn is_bonded(&self, device_id: &DeviceId) -> bool {
        self.state().bonded.contains(device_id)
    }

    /// Services reported by `discover_services`.
    pub fn set_services(&self, device_id: &DeviceId, services: Vec<Uuid>) {
        self.state().services.insert(device_id.clone(), services);
    }

    /// Value returned by reads of `characteristic`.
    pub fn set_value(&self, device_id: &DeviceId, characteristic: CharacteristicRef, value: Vec<u8>) {
        self.state()
            .values
            .insert((device_id.clone(), characteristic), value);
    }

    /// Last value written to `characteristic`.
    #[must_use]
    pub fn written(&self, device_id: &DeviceId, characteristic: CharacteristicRef) -> Option<Vec<u8>> {
        self.state()
            .written
            .get(&(device_id.clone(), characteristic))
            .cloned()
    }

    /// Push a notification to every subscriber of `characteristic`.
    /// Returns the number of subscribers reached.
    pub fn notify(&self, device_id: &DeviceId, characteristic: CharacteristicRef, value: &[u8]) -> usize {
        let mut state = self.state();
        let Some(txs) = state.notify_txs.get_mut(&(device_id.clone(), characteristic)) else {
            return 0;
        };
        txs.retain(|tx| tx.unbounded_send(value.to_vec()).is_ok());
        txs.len()
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn start_scan(&self) -> RadioResult<BoxStream<'static, DiscoveryEvent>> {
        let mut state = self.state();
        if let Some(error) = state.scan_errors.pop_front() {
            return Err(error);
        }
        let (tx, rx) = unbounded();
        state.scan_tx = Some(tx);
        state.scan_starts += 1;
        debug!(starts = state.scan_starts, "Mock scan started");
        Ok(rx.boxed())
    }

    async fn stop_scan(&self) -> RadioResult<()> {
        self.state().scan_tx = None;
        Ok(())
    }

    async fn connect(&self, device_id: &DeviceId) -> RadioResult<()> {
        let behavior = {
            let mut state = self.state();
            state.connect_calls.push(device_id.clone());
            state
                .behaviors
                .get(device_id)
                .cloned()
                .unwrap_or_else(|| state.default_behavior.clone())
        };

        match behavior {
            ConnectBehavior::Succeed => {
                let mut state = self.state();
                state.connected.insert(device_id.clone());
                state.broadcast_connection(&ConnectionEvent::connected(device_id.clone()));
                Ok(())
            }
            ConnectBehavior::Fail(reason) => Err(RadioError::ConnectRejected {
                device_id: device_id.clone(),
                reason,
            }),
            ConnectBehavior::Hang => futures::future::pending::<RadioResult<()>>().await,
        }
    }

    async fn disconnect(&self, device_id: &DeviceId) -> RadioResult<()> {
        let mut state = self.state();
        if state.connected.remove(device_id) {
            state.broadcast_connection(&ConnectionEvent::disconnected(device_id.clone(), None));
        }
        state.notify_txs.retain(|(id, _), _| id != device_id);
        Ok(())
    }

    async fn connection_events(&self) -> RadioResult<BoxStream<'static, ConnectionEvent>> {
        let mut state = self.state();
        if let Some(error) = state.connection_errors.pop_front() {
            return Err(error);
        }
        let (tx, rx) = unbounded();
        state.connection_txs.push(tx);
        Ok(rx.boxed())
    }

    async fn pair(&self, device_id: &DeviceId) -> RadioResult<()> {
        self.state().bonded.insert(device_id.clone());
        Ok(())
    }

    async fn unpair(&self, device_id: &DeviceId) -> RadioResult<()> {
        self.state().bonded.remove(device_id);
        Ok(())
    }

    async fn discover_services(&self, device_id: &DeviceId) -> RadioResult<Vec<Uuid>> {
        let state = self.state();
        state.require_connected(device_id)?;
        Ok(state.services.get(device_id).cloned().unwrap_or_default())
    }

    async fn read(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
    ) -> RadioResult<Vec<u8>> {
        let state = self.state();
        state.require_connected(device_id)?;
        state
            .values
            .get(&(device_id.clone(), *characteristic))
            .cloned()
            .ok_or(RadioError::CharacteristicNotFound {
                characteristic: *characteristic,
            })
    }

    async fn write(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> RadioResult<()> {
        let mut state = self.state();
        state.require_connected(device_id)?;
        state
            .written
            .insert((device_id.clone(), *characteristic), value.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
    ) -> RadioResult<BoxStream<'static, Vec<u8>>> {
        let mut state = self.state();
        state.require_connected(device_id)?;
        let (tx, rx) = unbounded();
        state
            .notify_txs
            .entry((device_id.clone(), *characteristic))
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::parse("AA:BB:CC:DD:EE:FF").unwrap()
    }

    #[tokio::test]
    async fn test_scan_stream_receives_emitted_events() {
        let radio = MockRadio::new();
        assert!(!radio.emit_discovery(DiscoveryEvent::new(device())));

        let mut scan = radio.start_scan().await.unwrap();
        assert!(radio.emit_discovery(DiscoveryEvent::new(device()).with_rssi(-40)));
        let event = scan.next().await.unwrap();
        assert_eq!(event.rssi, Some(-40));

        radio.stop_scan().await.unwrap();
        assert!(scan.next().await.is_none());
    }

    #[tokio::test]
    async fn test_queued_scan_error_is_returned_once() {
        let radio = MockRadio::new();
        radio.queue_scan_error(RadioError::AdapterPoweredOff);

        assert!(matches!(
            radio.start_scan().await,
            Err(RadioError::AdapterPoweredOff)
        ));
        assert!(radio.start_scan().await.is_ok());
        assert_eq!(radio.scan_start_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_success_emits_connection_event() {
        let radio = MockRadio::new();
        let mut events = radio.connection_events().await.unwrap();

        radio.connect(&device()).await.unwrap();
        assert!(radio.is_connected(&device()));
        assert_eq!(
            events.next().await,
            Some(ConnectionEvent::connected(device()))
        );
    }

    #[tokio::test]
    async fn test_connection_events_can_fail_and_end() {
        let radio = MockRadio::new();
        radio.queue_connection_events_error(RadioError::AdapterPoweredOff);

        assert!(matches!(
            radio.connection_events().await,
            Err(RadioError::AdapterPoweredOff)
        ));
        let mut events = radio.connection_events().await.unwrap();
        assert_eq!(radio.connection_listener_count(), 1);

        radio.end_connection_events();
        assert!(events.next().await.is_none());
        assert_eq!(radio.connection_listener_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_scripted() {
        let radio = MockRadio::new();
        radio.set_connect_behavior(&device(), ConnectBehavior::Fail("out of range".into()));

        let result = radio.connect(&device()).await;
        assert!(matches!(result, Err(RadioError::ConnectRejected { .. })));
        assert_eq!(radio.connect_count(&device()), 1);
    }

    #[tokio::test]
    async fn test_gatt_requires_link() {
        let radio = MockRadio::new();
        let characteristic = CharacteristicRef {
            service: Uuid::from_u128(0x180D),
            characteristic: Uuid::from_u128(0x2A37),
        };
        radio.set_value(&device(), characteristic, vec![1, 2]);

        assert!(matches!(
            radio.read(&device(), &characteristic).await,
            Err(RadioError::NotConnected { .. })
        ));

        radio.connect(&device()).await.unwrap();
        assert_eq!(radio.read(&device(), &characteristic).await.unwrap(), vec![1, 2]);

        let mut notifications = radio.subscribe(&device(), &characteristic).await.unwrap();
        assert_eq!(radio.notify(&device(), characteristic, b"hi"), 1);
        assert_eq!(notifications.next().await, Some(b"hi".to_vec()));
    }
}
