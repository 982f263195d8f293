//! Connection tracker: the auto-reconnect state machine.
//!
//! The tracker is an actor. A single task owns the per-device state table and
//! is fed by two queues: user commands from [`TrackerHandle`] and a loopback
//! queue carrying radio events and the completions of tasks the actor spawned.
//! Because only that task touches the table, checking and setting the
//! "connect in flight" guard is one step and a device is never connected twice.
//!
//! The actor never waits on I/O while handling a message. Radio calls,
//! persistence and notifications run in spawned tasks that report back
//! through the loopback queue.
//!
//! Every transition is recorded as a [`LogEntry`] and published on the
//! [`EventBus`]. Per-device failures never escape the actor; they become
//! `Error` entries and status events.

mod table;

pub use table::{DeviceStateTable, DiscoveryOutcome};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription, TrackerEvent};
use crate::config::TrackerConfig;
use crate::error::{RelinkError, Result};
use crate::log_entry::{Direction, LogEntry, LogKind};
use crate::log_store::LogStore;
use crate::notify::{Notifier, TracingNotifier};
use crate::pairing::PairingRegistry;
use crate::radio::{Radio, RadioError};
use crate::storage::StorageResult;
use crate::types::{
    CharacteristicRef, ConnectionEvent, ConnectionState, DeviceId, DiscoveredDevice,
    DiscoveryEvent,
};

// =============================================================================
// JOURNAL
// =============================================================================

/// Where the tracker reports: log store, event bus and notifier.
#[derive(Clone)]
struct Journal {
    logs: LogStore,
    bus: EventBus,
    notifier: Arc<dyn Notifier>,
    tasks: TaskTracker,
}

impl Journal {
    fn record(&self, entry: LogEntry) {
        self.logs.record(entry.clone());
        self.bus.publish(TrackerEvent::LogAppended(entry));
    }

    fn error(&self, device_id: &DeviceId, name: Option<String>, message: String) {
        warn!(device_id = %device_id, "{message}");
        self.record(LogEntry::system(device_id.clone(), LogKind::Error, message.clone()).with_name(name));
        self.bus.publish(TrackerEvent::error(message));
    }

    fn state_changed(&self, device_id: &DeviceId, state: ConnectionState) {
        debug!(device_id = %device_id, %state, "State changed");
        self.bus.publish(TrackerEvent::StateChanged {
            device_id: device_id.clone(),
            state,
        });
    }

    fn notify(&self, title: &str, body: String) {
        let notifier = Arc::clone(&self.notifier);
        let title = title.to_string();
        self.tasks.spawn(async move {
            if let Err(e) = notifier.notify(&title, &body).await {
                warn!(error = %e, title = %title, "Notification failed");
            }
        });
    }
}

// =============================================================================
// CHARACTERISTIC SUBSCRIPTIONS
// =============================================================================

type GattKey = (DeviceId, CharacteristicRef);

#[derive(Default)]
struct Subscriptions {
    next_id: AtomicU64,
    active: Mutex<HashMap<GattKey, (u64, CancellationToken)>>,
}

impl Subscriptions {
    fn lock(&self) -> MutexGuard<'_, HashMap<GattKey, (u64, CancellationToken)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, key: GattKey, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.lock().insert(key, (id, token)) {
            previous.cancel();
        }
        id
    }

    fn finished(&self, key: &GattKey, id: u64) {
        let mut active = self.lock();
        if active.get(key).is_some_and(|(current, _)| *current == id) {
            active.remove(key);
        }
    }

    fn cancel(&self, key: &GattKey) -> bool {
        self.lock().remove(key).map(|(_, token)| token.cancel()).is_some()
    }

    fn cancel_device(&self, device_id: &DeviceId) {
        self.lock().retain(|(id, _), (_, token)| {
            if id == device_id {
                token.cancel();
                false
            } else {
                true
            }
        });
    }

    fn cancel_all(&self) {
        for (_, (_, token)) in self.lock().drain() {
            token.cancel();
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

#[derive(Debug)]
enum Command {
    // User commands
    EnsureScanning(oneshot::Sender<()>),
    StopScanning(oneshot::Sender<()>),
    SetPaired(BTreeSet<DeviceId>, oneshot::Sender<()>),
    Paired(DeviceId, oneshot::Sender<()>),
    Unpaired(DeviceId, oneshot::Sender<()>),
    Disconnect(DeviceId, oneshot::Sender<Result<()>>),
    States(oneshot::Sender<BTreeMap<DeviceId, ConnectionState>>),
    StateOf(DeviceId, oneshot::Sender<ConnectionState>),
    ScanResults(oneshot::Sender<Vec<DiscoveredDevice>>),
    IsScanning(oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),

    // Loopback
    ScanStarted { generation: u64 },
    ScanFailed { generation: u64, error: RadioError },
    ScanEnded { generation: u64 },
    Rescan { generation: u64 },
    Discovered { generation: u64, event: DiscoveryEvent },
    LinksStarted { generation: u64 },
    LinksFailed { generation: u64, error: RadioError },
    LinksEnded { generation: u64 },
    Resubscribe { generation: u64 },
    Connection(ConnectionEvent),
    ConnectFinished { device_id: DeviceId, result: Result<()> },
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builds and starts a tracker.
pub struct Tracker {
    radio: Arc<dyn Radio>,
    registry: PairingRegistry,
    logs: LogStore,
    notifier: Arc<dyn Notifier>,
    config: TrackerConfig,
}

impl Tracker {
    /// A tracker over `radio` using default timing and log notifications.
    pub fn new(radio: Arc<dyn Radio>, registry: PairingRegistry, logs: LogStore) -> Self {
        Self {
            radio,
            registry,
            logs,
            notifier: Arc::new(TracingNotifier),
            config: TrackerConfig::default(),
        }
    }

    /// Deliver notifications through `notifier`.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Override timing.
    #[must_use]
    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the paired set and spawn the actor. Every device starts Idle.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the pairing registry cannot be read.
    pub async fn start(self) -> Result<TrackerHandle> {
        let registry = self.registry.clone();
        let paired = blocking(move || registry.load_all()).await?;
        let (actor, handle) = self.into_parts(paired);
        tokio::spawn(actor.run());
        Ok(handle)
    }

    fn into_parts(self, paired: BTreeSet<DeviceId>) -> (TrackerActor, TrackerHandle) {
        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
        let journal = Journal {
            logs: self.logs,
            bus: EventBus::new(self.config.event_buffer),
            notifier: self.notifier,
            tasks: TaskTracker::new(),
        };
        let subscriptions = Arc::new(Subscriptions::default());
        let shutdown = CancellationToken::new();

        info!(paired = paired.len(), "Connection tracker starting");

        let actor = TrackerActor {
            config: self.config,
            radio: Arc::clone(&self.radio),
            journal: journal.clone(),
            subscriptions: Arc::clone(&subscriptions),
            inbox: inbox_rx,
            loopback_rx,
            loopback_tx,
            shutdown: shutdown.clone(),
            table: DeviceStateTable::default(),
            paired,
            scan_results: HashMap::new(),
            scan: ScanState::default(),
            links: LinkWatch::default(),
        };
        let handle = TrackerHandle {
            inbox: inbox_tx,
            radio: self.radio,
            registry: self.registry,
            journal,
            subscriptions,
            shutdown,
        };
        (actor, handle)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RelinkError::IoError(std::io::Error::other(e)))?
        .map_err(RelinkError::from)
}

// =============================================================================
// HANDLE
// =============================================================================

/// Clonable handle to a running tracker.
#[derive(Clone)]
pub struct TrackerHandle {
    inbox: mpsc::Sender<Command>,
    radio: Arc<dyn Radio>,
    registry: PairingRegistry,
    journal: Journal,
    subscriptions: Arc<Subscriptions>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TrackerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerHandle")
            .field("stopped", &self.inbox.is_closed())
            .finish_non_exhaustive()
    }
}

impl TrackerHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(make(tx))
            .await
            .map_err(|_| RelinkError::TrackerStopped)?;
        rx.await.map_err(|_| RelinkError::TrackerStopped)
    }

    /// Start scanning unless a scan is already running or starting.
    ///
    /// # Errors
    ///
    /// Returns [`RelinkError::TrackerStopped`] if the tracker has shut down.
    /// Scan failures are logged, not returned.
    pub async fn ensure_scanning(&self) -> Result<()> {
        self.request(Command::EnsureScanning).await
    }

    /// Stop scanning and cancel any pending rescan.
    ///
    /// # Errors
    ///
    /// Returns [`RelinkError::TrackerStopped`] if the tracker has shut down.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(Command::StopScanning).await
    }

    /// Re-read the pairing registry and hand the fresh set to the tracker.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the registry cannot be read.
    pub async fn refresh_pairings(&self) -> Result<BTreeSet<DeviceId>> {
        let registry = self.registry.clone();
        let paired = blocking(move || registry.load_all()).await?;
        self.request(|tx| Command::SetPaired(paired.clone(), tx))
            .await?;
        Ok(paired)
    }

    /// Add `device_id` to the registry, then start tracking it.
    ///
    /// Returns `true` if the device was not paired before.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the registry write fails; the tracker is
    /// left unchanged in that case.
    pub async fn pair(&self, device_id: &DeviceId) -> Result<bool> {
        let registry = self.registry.clone();
        let id = device_id.clone();
        let added = blocking(move || registry.add_paired(&id)).await?;
        self.request(|tx| Command::Paired(device_id.clone(), tx))
            .await?;
        Ok(added)
    }

    /// Remove `device_id` from the registry, disconnect it and reset it to Idle.
    ///
    /// Returns `true` if the device was paired.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the registry write fails.
    pub async fn unpair(&self, device_id: &DeviceId) -> Result<bool> {
        let registry = self.registry.clone();
        let id = device_id.clone();
        let removed = blocking(move || registry.remove_paired(&id)).await?;
        self.request(|tx| Command::Unpaired(device_id.clone(), tx))
            .await?;
        Ok(removed)
    }

    /// Close the link to `device_id`. A paired device reconnects on its next
    /// discovery.
    ///
    /// # Errors
    ///
    /// Returns the radio error if the disconnect fails.
    pub async fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        self.request(|tx| Command::Disconnect(device_id.clone(), tx))
            .await?
    }

    /// State of every device the tracker has seen since start.
    ///
    /// # Errors
    ///
    /// Returns [`RelinkError::TrackerStopped`] if the tracker has shut down.
    pub async fn states(&self) -> Result<BTreeMap<DeviceId, ConnectionState>> {
        self.request(Command::States).await
    }

    /// State of one device; unknown devices are Idle.
    ///
    /// # Errors
    ///
    /// Returns [`RelinkError::TrackerStopped`] if the tracker has shut down.
    pub async fn state_of(&self, device_id: &DeviceId) -> Result<ConnectionState> {
        self.request(|tx| Command::StateOf(device_id.clone(), tx))
            .await
    }

    /// Latest sighting of every device seen since start, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`RelinkError::TrackerStopped`] if the tracker has shut down.
    pub async fn scan_results(&self) -> Result<Vec<DiscoveredDevice>> {
        self.request(Command::ScanResults).await
    }

    /// Whether a scan is running.
    ///
    /// # Errors
    ///
    /// Returns [`RelinkError::TrackerStopped`] if the tracker has shut down.
    pub async fn is_scanning(&self) -> Result<bool> {
        self.request(Command::IsScanning).await
    }

    /// Read a characteristic and log the value.
    ///
    /// # Errors
    ///
    /// Returns the radio error; it is also logged.
    pub async fn read_characteristic(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>> {
        match self.radio.read(device_id, characteristic).await {
            Ok(value) => {
                self.journal.record(
                    LogEntry::new(
                        device_id.clone(),
                        Direction::Incoming,
                        LogKind::Read,
                        format!("Read {characteristic}"),
                    )
                    .with_payload(value.clone()),
                );
                Ok(value)
            }
            Err(e) => {
                self.journal
                    .error(device_id, None, format!("Read {characteristic} failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Write a characteristic and log the value.
    ///
    /// # Errors
    ///
    /// Returns the radio error; it is also logged.
    pub async fn write_characteristic(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
        value: Vec<u8>,
    ) -> Result<()> {
        match self.radio.write(device_id, characteristic, &value).await {
            Ok(()) => {
                self.journal.record(
                    LogEntry::new(
                        device_id.clone(),
                        Direction::Outgoing,
                        LogKind::Write,
                        format!("Wrote {characteristic}"),
                    )
                    .with_payload(value),
                );
                Ok(())
            }
            Err(e) => {
                self.journal
                    .error(device_id, None, format!("Write {characteristic} failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Log every notification of a characteristic until unsubscribed, the
    /// device is lost or unpaired, or the tracker shuts down.
    ///
    /// Subscribing again replaces the previous subscription.
    ///
    /// # Errors
    ///
    /// Returns the radio error; it is also logged.
    pub async fn subscribe_characteristic(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
    ) -> Result<()> {
        let mut values = match self.radio.subscribe(device_id, characteristic).await {
            Ok(values) => values,
            Err(e) => {
                self.journal.error(
                    device_id,
                    None,
                    format!("Subscribe to {characteristic} failed: {e}"),
                );
                return Err(e.into());
            }
        };

        let key = (device_id.clone(), *characteristic);
        let token = self.shutdown.child_token();
        let id = self.subscriptions.insert(key.clone(), token.clone());
        self.journal.record(LogEntry::new(
            device_id.clone(),
            Direction::Outgoing,
            LogKind::Info,
            format!("Subscribed to {characteristic}"),
        ));

        let journal = self.journal.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        self.journal.tasks.spawn(async move {
            let (device_id, characteristic) = key.clone();
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    value = values.next() => {
                        let Some(value) = value else { break };
                        journal.record(
                            LogEntry::new(
                                device_id.clone(),
                                Direction::Incoming,
                                LogKind::Notify,
                                format!("Notification from {characteristic}"),
                            )
                            .with_payload(value),
                        );
                    }
                }
            }
            subscriptions.finished(&key, id);
            debug!(device_id = %device_id, %characteristic, "Notification forwarding ended");
        });
        Ok(())
    }

    /// Stop forwarding notifications. Returns `false` if there was no subscription.
    pub fn unsubscribe_characteristic(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
    ) -> bool {
        let cancelled = self
            .subscriptions
            .cancel(&(device_id.clone(), *characteristic));
        if cancelled {
            self.journal.record(LogEntry::new(
                device_id.clone(),
                Direction::Outgoing,
                LogKind::Info,
                format!("Unsubscribed from {characteristic}"),
            ));
        }
        cancelled
    }

    /// Persisted and in-memory entries for one device.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the persisted log cannot be read.
    pub async fn logs_for(&self, device_id: &DeviceId) -> Result<Vec<LogEntry>> {
        Ok(self.journal.logs.logs_for(device_id).await?)
    }

    /// Every device's entries in timestamp order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the logged devices cannot be listed.
    pub async fn all_logs(&self) -> Result<Vec<LogEntry>> {
        Ok(self.journal.logs.all_logs().await?)
    }

    /// Delete one device's log.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the log cannot be removed.
    pub async fn clear_logs(&self, device_id: &DeviceId) -> Result<()> {
        Ok(self.journal.logs.clear(device_id).await?)
    }

    /// Observe tracker events from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.journal.bus.subscribe()
    }

    /// Stop the tracker: cancel scans, connects and subscriptions, then wait
    /// for pending log writes.
    ///
    /// # Errors
    ///
    /// Returns [`RelinkError::TrackerStopped`] if the tracker already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

// =============================================================================
// ACTOR
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ScanPhase {
    #[default]
    Off,
    Starting,
    Active,
}

#[derive(Debug, Default)]
struct ScanState {
    wanted: bool,
    phase: ScanPhase,
    // Bumped on every start and stop; events tagged with an older value are stale.
    generation: u64,
    token: Option<CancellationToken>,
    radio_failures: u32,
    unpaired_seen: HashSet<DeviceId>,
}

/// The subscription to radio connection events.
#[derive(Debug, Default)]
struct LinkWatch {
    // Subscribing or subscribed.
    active: bool,
    // Bumped on every subscribe; reports tagged with an older value are stale.
    generation: u64,
    failures: u32,
}

struct TrackerActor {
    config: TrackerConfig,
    radio: Arc<dyn Radio>,
    journal: Journal,
    subscriptions: Arc<Subscriptions>,
    inbox: mpsc::Receiver<Command>,
    loopback_rx: mpsc::UnboundedReceiver<Command>,
    loopback_tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,

    table: DeviceStateTable,
    paired: BTreeSet<DeviceId>,
    scan_results: HashMap<DeviceId, DiscoveredDevice>,
    scan: ScanState,
    links: LinkWatch,
}

impl TrackerActor {
    async fn run(mut self) {
        self.watch_connections();

        let period = self.config.housekeeping_interval();
        let mut housekeeping = time::interval_at(time::Instant::now() + period, period);
        housekeeping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let reply = loop {
            let command = tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => command,
                    None => break None,
                },
                Some(command) = self.loopback_rx.recv() => command,
                _ = housekeeping.tick() => {
                    self.housekeeping();
                    continue;
                }
            };
            match command {
                Command::Shutdown(reply) => break Some(reply),
                command => self.dispatch(command),
            }
        };

        self.stop().await;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    async fn stop(&mut self) {
        info!("Connection tracker shutting down");
        self.shutdown.cancel();
        self.subscriptions.cancel_all();
        if self.scan.phase != ScanPhase::Off {
            if let Err(e) = self.radio.stop_scan().await {
                warn!(error = %e, "Failed to stop scan during shutdown");
            }
        }
        self.journal.tasks.close();
        self.journal.tasks.wait().await;
        self.journal.logs.flush().await;
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::EnsureScanning(reply) => {
                self.start_scan();
                let _ = reply.send(());
            }
            Command::StopScanning(reply) => {
                self.stop_scan();
                let _ = reply.send(());
            }
            Command::SetPaired(paired, reply) => {
                self.set_paired(paired);
                let _ = reply.send(());
            }
            Command::Paired(device_id, reply) => {
                self.on_paired(device_id);
                let _ = reply.send(());
            }
            Command::Unpaired(device_id, reply) => {
                self.on_unpaired(&device_id);
                let _ = reply.send(());
            }
            Command::Disconnect(device_id, reply) => self.disconnect(device_id, reply),
            Command::States(reply) => {
                let _ = reply.send(self.table.snapshot());
            }
            Command::StateOf(device_id, reply) => {
                let _ = reply.send(self.table.state(&device_id));
            }
            Command::ScanResults(reply) => {
                let mut results: Vec<_> = self.scan_results.values().cloned().collect();
                results.sort_by(|a, b| a.device_id.cmp(&b.device_id));
                let _ = reply.send(results);
            }
            Command::IsScanning(reply) => {
                let _ = reply.send(self.scan.phase == ScanPhase::Active);
            }
            Command::Shutdown(reply) => {
                // Handled by the run loop; reaching here means a test drove dispatch directly.
                let _ = reply.send(());
            }
            Command::ScanStarted { generation } => self.on_scan_started(generation),
            Command::ScanFailed { generation, error } => self.on_scan_failed(generation, &error),
            Command::ScanEnded { generation } => self.on_scan_ended(generation),
            Command::Rescan { generation } => {
                if generation == self.scan.generation
                    && self.scan.wanted
                    && self.scan.phase == ScanPhase::Off
                {
                    self.start_scan();
                }
            }
            Command::Discovered { generation, event } => self.on_discovered(generation, event),
            Command::LinksStarted { generation } => {
                if generation == self.links.generation {
                    self.links.failures = 0;
                }
            }
            Command::LinksFailed { generation, error } => self.on_links_failed(generation, &error),
            Command::LinksEnded { generation } => self.on_links_ended(generation),
            Command::Resubscribe { generation } => {
                if generation == self.links.generation && !self.links.active {
                    self.watch_connections();
                }
            }
            Command::Connection(event) => self.on_connection(event),
            Command::ConnectFinished { device_id, result } => {
                self.on_connect_finished(device_id, result);
            }
        }
    }

    fn name_of(&self, device_id: &DeviceId) -> Option<String> {
        self.scan_results
            .get(device_id)
            .and_then(|device| device.name.clone())
    }

    fn display_name(&self, device_id: &DeviceId) -> String {
        self.name_of(device_id)
            .unwrap_or_else(|| device_id.to_string())
    }

    fn entry(
        &self,
        device_id: &DeviceId,
        direction: Direction,
        kind: LogKind,
        message: impl Into<String>,
    ) -> LogEntry {
        LogEntry::new(device_id.clone(), direction, kind, message).with_name(self.name_of(device_id))
    }

    // -------------------------------------------------------------------------
    // Scanning
    // -------------------------------------------------------------------------

    fn start_scan(&mut self) {
        self.scan.wanted = true;
        if self.scan.phase != ScanPhase::Off {
            return;
        }

        self.scan.generation += 1;
        self.scan.phase = ScanPhase::Starting;
        self.scan.unpaired_seen.clear();
        let generation = self.scan.generation;
        let token = self.shutdown.child_token();
        if let Some(previous) = self.scan.token.replace(token.clone()) {
            previous.cancel();
        }
        debug!(generation, "Starting scan");

        let radio = Arc::clone(&self.radio);
        let tx = self.loopback_tx.clone();
        self.journal.tasks.spawn(async move {
            let mut discoveries = tokio::select! {
                () = token.cancelled() => return,
                result = radio.start_scan() => match result {
                    Ok(stream) => stream,
                    Err(error) => {
                        let _ = tx.send(Command::ScanFailed { generation, error });
                        return;
                    }
                },
            };
            if tx.send(Command::ScanStarted { generation }).is_err() {
                return;
            }
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    event = discoveries.next() => {
                        let Some(event) = event else {
                            let _ = tx.send(Command::ScanEnded { generation });
                            return;
                        };
                        if tx.send(Command::Discovered { generation, event }).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn stop_scan(&mut self) {
        self.scan.wanted = false;
        self.scan.generation += 1;
        if let Some(token) = self.scan.token.take() {
            token.cancel();
        }
        let was_active = self.scan.phase == ScanPhase::Active;
        self.scan.phase = ScanPhase::Off;
        if was_active {
            self.journal
                .bus
                .publish(TrackerEvent::ScanStateChanged { active: false });
            self.journal.bus.publish(TrackerEvent::info("Scanning stopped"));
        }

        let radio = Arc::clone(&self.radio);
        self.journal.tasks.spawn(async move {
            if let Err(e) = radio.stop_scan().await {
                warn!(error = %e, "Failed to stop scan");
            }
        });
    }

    fn schedule_rescan(&self, delay: Duration) {
        let generation = self.scan.generation;
        let tx = self.loopback_tx.clone();
        let token = self.shutdown.clone();
        debug!(generation, delay_secs = delay.as_secs(), "Rescan scheduled");
        self.journal.tasks.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = time::sleep(delay) => {
                    let _ = tx.send(Command::Rescan { generation });
                }
            }
        });
    }

    fn on_scan_started(&mut self, generation: u64) {
        if generation != self.scan.generation {
            return;
        }
        self.scan.phase = ScanPhase::Active;
        self.scan.radio_failures = 0;
        // The adapter is usable again; pick link changes back up without waiting.
        if !self.links.active {
            self.watch_connections();
        }
        info!("Scanning for paired devices");
        self.journal
            .bus
            .publish(TrackerEvent::ScanStateChanged { active: true });
        self.journal.bus.publish(TrackerEvent::info("Scanning"));
    }

    fn on_scan_failed(&mut self, generation: u64, error: &RadioError) {
        if generation != self.scan.generation {
            return;
        }
        self.scan.phase = ScanPhase::Off;
        self.scan.token = None;

        let delay = if error.is_adapter_unavailable() {
            let delay = self.config.radio_backoff(self.scan.radio_failures);
            self.scan.radio_failures = self.scan.radio_failures.saturating_add(1);
            delay
        } else {
            self.config.rescan_delay()
        };
        self.journal.error(
            &DeviceId::adapter(),
            None,
            format!("Scan failed: {error}; retrying in {}s", delay.as_secs()),
        );
        self.schedule_rescan(delay);
    }

    fn on_scan_ended(&mut self, generation: u64) {
        if generation != self.scan.generation {
            return;
        }
        warn!("Scan ended unexpectedly");
        self.scan.phase = ScanPhase::Off;
        self.scan.token = None;
        self.journal
            .bus
            .publish(TrackerEvent::ScanStateChanged { active: false });
        self.schedule_rescan(self.config.rescan_delay());
    }

    // -------------------------------------------------------------------------
    // Discovery and connection
    // -------------------------------------------------------------------------

    fn on_discovered(&mut self, generation: u64, event: DiscoveryEvent) {
        if generation != self.scan.generation || self.scan.phase == ScanPhase::Off {
            debug!(device_id = %event.device_id, "Dropping discovery from a stopped scan");
            return;
        }

        let device_id = event.device_id;
        let paired = self.paired.contains(&device_id);
        let name = event.name.or_else(|| self.name_of(&device_id));
        let device = DiscoveredDevice {
            device_id: device_id.clone(),
            name: name.clone(),
            rssi: event.rssi,
            paired,
            last_seen_utc: Utc::now(),
        };
        self.scan_results.insert(device_id.clone(), device.clone());
        self.journal.bus.publish(TrackerEvent::DeviceDiscovered(device));

        let first_sighting = if paired {
            !self.table.state(&device_id).is_engaged()
        } else {
            self.scan.unpaired_seen.insert(device_id.clone())
        };
        if first_sighting {
            self.journal.record(self.entry(
                &device_id,
                Direction::Incoming,
                LogKind::Scan,
                describe_sighting(name.as_deref(), event.rssi),
            ));
        }

        match self.table.on_discovered(&device_id, paired) {
            DiscoveryOutcome::Connect => {
                self.journal
                    .state_changed(&device_id, ConnectionState::Discovering);
                self.journal
                    .state_changed(&device_id, ConnectionState::Connecting);
                self.journal.record(self.entry(
                    &device_id,
                    Direction::Outgoing,
                    LogKind::Info,
                    "Auto-connect attempt",
                ));
                self.connect(device_id);
            }
            DiscoveryOutcome::AlreadyConnecting | DiscoveryOutcome::AlreadyConnected => {
                debug!(device_id = %device_id, "Discovery of engaged device ignored");
            }
            DiscoveryOutcome::NotPaired => {}
        }
    }

    fn connect(&self, device_id: DeviceId) {
        let radio = Arc::clone(&self.radio);
        let tx = self.loopback_tx.clone();
        let token = self.shutdown.clone();
        let timeout = self.config.connect_timeout();
        let secs = self.config.connect_timeout_secs;

        self.journal.tasks.spawn(async move {
            let outcome = tokio::select! {
                () = token.cancelled() => return,
                outcome = time::timeout(timeout, radio.connect(&device_id)) => outcome,
            };
            let result = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(RelinkError::from(e)),
                Err(_) => Err(RelinkError::ConnectionTimeout {
                    device_id: device_id.to_string(),
                    secs,
                }),
            };
            let _ = tx.send(Command::ConnectFinished { device_id, result });
        });
    }

    fn on_connect_finished(&mut self, device_id: DeviceId, result: Result<()>) {
        match result {
            Ok(()) => {
                if !self.paired.contains(&device_id)
                    && self.table.state(&device_id) == ConnectionState::Idle
                {
                    debug!(device_id = %device_id, "Connected after unpair; dropping link");
                    self.spawn_disconnect(device_id);
                    return;
                }
                self.on_link_up(device_id);
            }
            Err(error) => {
                if !self.table.on_connect_failed(&device_id) {
                    return;
                }
                self.journal
                    .state_changed(&device_id, ConnectionState::Disconnected);
                self.journal.error(
                    &device_id,
                    self.name_of(&device_id),
                    format!("Connection failed: {error}"),
                );
                self.journal
                    .notify("Connection failed", self.display_name(&device_id));
                self.start_scan();
            }
        }
    }

    fn on_connection(&mut self, event: ConnectionEvent) {
        let device_id = event.device_id;
        if event.connected {
            self.on_link_up(device_id);
            return;
        }

        if !self.table.on_disconnected(&device_id) {
            return;
        }
        self.subscriptions.cancel_device(&device_id);
        self.journal
            .state_changed(&device_id, ConnectionState::Disconnected);
        let message = match &event.error {
            Some(error) => format!("Disconnected: {error}"),
            None => "Disconnected".to_string(),
        };
        self.journal.record(self.entry(
            &device_id,
            Direction::System,
            LogKind::Disconnect,
            message.clone(),
        ));
        info!(device_id = %device_id, "{message}");
        self.journal.bus.publish(TrackerEvent::info(format!(
            "{} disconnected",
            self.display_name(&device_id)
        )));
        self.journal.notify("Disconnected", self.display_name(&device_id));
        if self.paired.contains(&device_id) {
            self.start_scan();
        }
    }

    fn on_link_up(&mut self, device_id: DeviceId) {
        if !self.table.on_connected(&device_id) {
            debug!(device_id = %device_id, "Duplicate connected report ignored");
            return;
        }
        let display = self.display_name(&device_id);
        info!(device_id = %device_id, "Connected");
        self.journal
            .state_changed(&device_id, ConnectionState::Connected);
        self.journal.record(self.entry(
            &device_id,
            Direction::System,
            LogKind::Connect,
            "Connected",
        ));
        self.journal
            .bus
            .publish(TrackerEvent::info(format!("Connected to {display}")));
        self.journal.notify("Connected", display);
        self.discover_services(device_id);
    }

    fn discover_services(&self, device_id: DeviceId) {
        let radio = Arc::clone(&self.radio);
        let journal = self.journal.clone();
        let name = self.name_of(&device_id);
        self.journal.tasks.spawn(async move {
            match radio.discover_services(&device_id).await {
                Ok(services) => {
                    let listed: Vec<String> = services.iter().map(ToString::to_string).collect();
                    journal.record(
                        LogEntry::new(
                            device_id,
                            Direction::Incoming,
                            LogKind::ServiceDiscovery,
                            format!("Discovered {} services: {}", services.len(), listed.join(", ")),
                        )
                        .with_name(name),
                    );
                }
                Err(e) => {
                    journal.error(&device_id, name, format!("Service discovery failed: {e}"));
                }
            }
        });
    }

    fn disconnect(&self, device_id: DeviceId, reply: oneshot::Sender<Result<()>>) {
        let radio = Arc::clone(&self.radio);
        let tx = self.loopback_tx.clone();
        self.journal.tasks.spawn(async move {
            let result = radio.disconnect(&device_id).await.map_err(RelinkError::from);
            if result.is_ok() {
                // Radios that report nothing for self-initiated disconnects still update the table.
                let _ = tx.send(Command::Connection(ConnectionEvent::disconnected(
                    device_id, None,
                )));
            }
            let _ = reply.send(result);
        });
    }

    fn spawn_disconnect(&self, device_id: DeviceId) {
        let radio = Arc::clone(&self.radio);
        self.journal.tasks.spawn(async move {
            if let Err(e) = radio.disconnect(&device_id).await {
                warn!(device_id = %device_id, error = %e, "Disconnect failed");
            }
        });
    }

    fn watch_connections(&mut self) {
        self.links.active = true;
        self.links.generation += 1;
        let generation = self.links.generation;

        let radio = Arc::clone(&self.radio);
        let tx = self.loopback_tx.clone();
        let token = self.shutdown.clone();
        self.journal.tasks.spawn(async move {
            let mut events = tokio::select! {
                () = token.cancelled() => return,
                result = radio.connection_events() => match result {
                    Ok(events) => events,
                    Err(error) => {
                        let _ = tx.send(Command::LinksFailed { generation, error });
                        return;
                    }
                },
            };
            if tx.send(Command::LinksStarted { generation }).is_err() {
                return;
            }
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    event = events.next() => {
                        let Some(event) = event else {
                            let _ = tx.send(Command::LinksEnded { generation });
                            return;
                        };
                        if tx.send(Command::Connection(event)).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn on_links_failed(&mut self, generation: u64, error: &RadioError) {
        if generation != self.links.generation {
            return;
        }
        self.links.active = false;
        let delay = if error.is_adapter_unavailable() {
            let delay = self.config.radio_backoff(self.links.failures);
            self.links.failures = self.links.failures.saturating_add(1);
            delay
        } else {
            self.config.rescan_delay()
        };
        warn!(
            error = %error,
            retry_secs = delay.as_secs(),
            "Connection events unavailable"
        );
        self.schedule_resubscribe(delay);
    }

    fn on_links_ended(&mut self, generation: u64) {
        if generation != self.links.generation {
            return;
        }
        warn!("Connection event stream ended");
        self.links.active = false;
        self.schedule_resubscribe(self.config.rescan_delay());
    }

    fn schedule_resubscribe(&self, delay: Duration) {
        let generation = self.links.generation;
        let tx = self.loopback_tx.clone();
        let token = self.shutdown.clone();
        self.journal.tasks.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = time::sleep(delay) => {
                    let _ = tx.send(Command::Resubscribe { generation });
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Housekeeping
    // -------------------------------------------------------------------------

    /// Forget unpaired scan results not seen within the TTL and delete
    /// device logs with nothing left in the retention window.
    fn housekeeping(&mut self) {
        // A TTL too large to subtract keeps everything.
        let cutoff = chrono::Duration::from_std(self.config.scan_result_ttl())
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        let before = self.scan_results.len();
        let paired = &self.paired;
        let table = &self.table;
        self.scan_results.retain(|id, device| {
            paired.contains(id)
                || table.state(id).is_engaged()
                || cutoff.map_or(true, |cutoff| device.last_seen_utc >= cutoff)
        });
        let results = &self.scan_results;
        self.scan.unpaired_seen.retain(|id| results.contains_key(id));
        debug!(
            forgotten = before - self.scan_results.len(),
            kept = self.scan_results.len(),
            "Housekeeping"
        );

        let logs = self.journal.logs.clone();
        self.journal.tasks.spawn(async move {
            if let Err(e) = logs.prune_expired().await {
                warn!(error = %e, "Failed to prune device logs");
            }
        });
    }

    // -------------------------------------------------------------------------
    // Pairing
    // -------------------------------------------------------------------------

    fn set_paired(&mut self, paired: BTreeSet<DeviceId>) {
        let dropped: Vec<DeviceId> = self
            .table
            .engaged()
            .into_iter()
            .filter(|id| !paired.contains(id))
            .collect();
        self.paired = paired;
        for device in self.scan_results.values_mut() {
            device.paired = self.paired.contains(&device.device_id);
        }

        for device_id in dropped {
            self.subscriptions.cancel_device(&device_id);
            self.table.reset(&device_id);
            self.journal.state_changed(&device_id, ConnectionState::Idle);
            self.journal.record(self.entry(
                &device_id,
                Direction::System,
                LogKind::Info,
                "No longer paired; disconnecting",
            ));
            self.spawn_disconnect(device_id);
        }
    }

    fn on_paired(&mut self, device_id: DeviceId) {
        self.paired.insert(device_id.clone());
        if let Some(device) = self.scan_results.get_mut(&device_id) {
            device.paired = true;
        }
        self.journal
            .record(self.entry(&device_id, Direction::Outgoing, LogKind::Pair, "Paired"));
        self.journal.notify("Device paired", self.display_name(&device_id));

        let radio = Arc::clone(&self.radio);
        let journal = self.journal.clone();
        let name = self.name_of(&device_id);
        self.journal.tasks.spawn(async move {
            if let Err(e) = radio.pair(&device_id).await {
                journal.error(&device_id, name, format!("OS bonding failed: {e}"));
            }
        });

        self.start_scan();
    }

    fn on_unpaired(&mut self, device_id: &DeviceId) {
        self.paired.remove(device_id);
        if let Some(device) = self.scan_results.get_mut(device_id) {
            device.paired = false;
        }
        self.subscriptions.cancel_device(device_id);
        let previous = self.table.reset(device_id);

        let radio = Arc::clone(&self.radio);
        let journal = self.journal.clone();
        let name = self.name_of(device_id);
        let id = device_id.clone();
        self.journal.tasks.spawn(async move {
            if previous.is_engaged() {
                if let Err(e) = radio.disconnect(&id).await {
                    warn!(device_id = %id, error = %e, "Disconnect on unpair failed");
                }
            }
            if let Err(e) = radio.unpair(&id).await {
                journal.error(&id, name, format!("Removing OS bond failed: {e}"));
            }
        });

        self.journal.state_changed(device_id, ConnectionState::Idle);
        self.journal
            .record(self.entry(device_id, Direction::Outgoing, LogKind::Unpair, "Unpaired"));
        self.journal.notify("Device unpaired", self.display_name(device_id));
    }
}

fn describe_sighting(name: Option<&str>, rssi: Option<i16>) -> String {
    let name = name.unwrap_or("unnamed device");
    match rssi {
        Some(rssi) => format!("Discovered {name} (RSSI {rssi} dBm)"),
        None => format!("Discovered {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::RetentionPolicy;
    use crate::notify::RecordingNotifier;
    use crate::radio::{ConnectBehavior, MockRadio};
    use crate::storage::MemoryStore;
    use uuid::Uuid;

    struct Fixture {
        radio: Arc<MockRadio>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        handle: TrackerHandle,
        events: Subscription,
    }

    fn device() -> DeviceId {
        DeviceId::parse("AA:BB:CC:DD:EE:FF").unwrap()
    }

    fn heart_rate() -> CharacteristicRef {
        CharacteristicRef {
            service: Uuid::from_u128(0x180D),
            characteristic: Uuid::from_u128(0x2A37),
        }
    }

    async fn fixture(paired: &[DeviceId]) -> Fixture {
        let f = fixture_on(Arc::new(MockRadio::new()), paired).await;
        wait_for_listener(&f.radio).await;
        f
    }

    async fn fixture_on(radio: Arc<MockRadio>, paired: &[DeviceId]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = PairingRegistry::new(store.clone());
        for id in paired {
            registry.add_paired(id).unwrap();
        }
        let notifier = Arc::new(RecordingNotifier::default());
        let logs = LogStore::new(store.clone(), RetentionPolicy::default());
        let handle = Tracker::new(radio.clone(), registry, logs)
            .with_notifier(notifier.clone())
            .start()
            .await
            .unwrap();
        let events = handle.subscribe();
        Fixture {
            radio,
            store,
            notifier,
            handle,
            events,
        }
    }

    async fn wait_for_listener(radio: &MockRadio) {
        time::timeout(Duration::from_secs(120), async {
            while radio.connection_listener_count() == 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection events were never subscribed");
    }

    async fn wait_for(
        events: &mut Subscription,
        mut predicate: impl FnMut(&TrackerEvent) -> bool,
    ) -> TrackerEvent {
        time::timeout(Duration::from_secs(120), async {
            loop {
                let event = events.recv().await.expect("event bus closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for tracker event")
    }

    async fn wait_for_state(events: &mut Subscription, id: &DeviceId, wanted: ConnectionState) {
        wait_for(events, |event| {
            matches!(event, TrackerEvent::StateChanged { device_id, state }
                if device_id == id && *state == wanted)
        })
        .await;
    }

    async fn wait_for_scan(events: &mut Subscription, active: bool) {
        wait_for(events, |event| {
            *event == TrackerEvent::ScanStateChanged { active }
        })
        .await;
    }

    async fn entries_of_kind(handle: &TrackerHandle, id: &DeviceId, kind: LogKind) -> Vec<LogEntry> {
        handle
            .logs_for(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|entry| entry.kind() == kind)
            .collect()
    }

    #[tokio::test]
    async fn test_duplicate_discovery_yields_one_connect() {
        let mut f = fixture(&[device()]).await;
        f.handle.ensure_scanning().await.unwrap();
        wait_for_scan(&mut f.events, true).await;

        let sentinel = DeviceId::parse("11:22:33:44:55:66").unwrap();
        assert!(f.radio.emit_discovery(DiscoveryEvent::new(device()).with_rssi(-50)));
        assert!(f.radio.emit_discovery(DiscoveryEvent::new(device()).with_rssi(-51)));
        assert!(f.radio.emit_discovery(DiscoveryEvent::new(sentinel.clone())));

        let (mut connected, mut sentinel_seen) = (false, false);
        wait_for(&mut f.events, |event| {
            match event {
                TrackerEvent::StateChanged { device_id, state } if *device_id == device() => {
                    connected |= *state == ConnectionState::Connected;
                }
                TrackerEvent::DeviceDiscovered(d) if d.device_id == sentinel => {
                    sentinel_seen = true;
                }
                _ => {}
            }
            connected && sentinel_seen
        })
        .await;
        // Let the duplicate connected report from the event stream arrive.
        time::sleep(Duration::from_millis(200)).await;

        assert_eq!(f.radio.connect_count(&device()), 1);
        assert_eq!(
            f.handle.state_of(&device()).await.unwrap(),
            ConnectionState::Connected
        );
        assert_eq!(
            entries_of_kind(&f.handle, &device(), LogKind::Connect).await.len(),
            1
        );
        assert_eq!(
            entries_of_kind(&f.handle, &device(), LogKind::Scan).await.len(),
            1
        );
        assert!(f
            .notifier
            .sent()
            .iter()
            .any(|(title, _)| title == "Connected"));
    }

    #[tokio::test]
    async fn test_unpaired_device_is_listed_but_not_connected() {
        let mut f = fixture(&[]).await;
        f.handle.ensure_scanning().await.unwrap();
        wait_for_scan(&mut f.events, true).await;

        f.radio
            .emit_discovery(DiscoveryEvent::new(device()).with_name("Strap"));
        f.radio.emit_discovery(DiscoveryEvent::new(device()));
        let mut sightings = 0;
        wait_for(&mut f.events, |event| {
            if matches!(event, TrackerEvent::DeviceDiscovered(_)) {
                sightings += 1;
            }
            sightings == 2
        })
        .await;

        let results = f.handle.scan_results().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name.as_deref(), Some("Strap"));
        assert!(!results[0].paired);
        assert_eq!(f.radio.connect_count(&device()), 0);
        assert_eq!(
            entries_of_kind(&f.handle, &device(), LogKind::Scan).await.len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_releases_guard() {
        let mut f = fixture(&[device()]).await;
        f.radio.set_connect_behavior(&device(), ConnectBehavior::Hang);
        f.handle.ensure_scanning().await.unwrap();
        wait_for_scan(&mut f.events, true).await;

        f.radio.emit_discovery(DiscoveryEvent::new(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connecting).await;
        wait_for_state(&mut f.events, &device(), ConnectionState::Disconnected).await;

        let errors = entries_of_kind(&f.handle, &device(), LogKind::Error).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message().contains("timed out after 15 seconds"));

        f.radio.emit_discovery(DiscoveryEvent::new(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connecting).await;
        assert_eq!(f.radio.connect_count(&device()), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_logs_error_and_notifies() {
        let mut f = fixture(&[device()]).await;
        f.radio.set_connect_behavior(
            &device(),
            ConnectBehavior::Fail("peer unreachable".into()),
        );
        f.handle.ensure_scanning().await.unwrap();
        wait_for_scan(&mut f.events, true).await;

        f.radio.emit_discovery(DiscoveryEvent::new(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Disconnected).await;

        let errors = entries_of_kind(&f.handle, &device(), LogKind::Error).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message().contains("peer unreachable"));
        assert!(f.handle.is_scanning().await.unwrap());
        // Notifications are spawned; give them a moment.
        time::sleep(Duration::from_millis(50)).await;
        assert!(f
            .notifier
            .sent()
            .iter()
            .any(|(title, _)| title == "Connection failed"));
    }

    #[tokio::test]
    async fn test_link_loss_rearms_scanning() {
        let mut f = fixture(&[device()]).await;
        f.radio.emit_connection(ConnectionEvent::connected(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connected).await;
        assert_eq!(f.radio.scan_start_count(), 0);

        f.radio
            .emit_connection(ConnectionEvent::disconnected(device(), Some("link loss".into())));
        wait_for_state(&mut f.events, &device(), ConnectionState::Disconnected).await;
        wait_for_scan(&mut f.events, true).await;

        assert_eq!(f.radio.scan_start_count(), 1);
        let disconnects = entries_of_kind(&f.handle, &device(), LogKind::Disconnect).await;
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].message(), "Disconnected: link loss");
    }

    #[tokio::test]
    async fn test_sightings_of_connected_device_are_not_logged() {
        let mut f = fixture(&[device()]).await;
        f.handle.ensure_scanning().await.unwrap();
        wait_for_scan(&mut f.events, true).await;
        f.radio.emit_discovery(DiscoveryEvent::new(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connected).await;

        for rssi in [-60, -61, -62] {
            f.radio
                .emit_discovery(DiscoveryEvent::new(device()).with_rssi(rssi));
        }
        let mut sightings = 0;
        wait_for(&mut f.events, |event| {
            if matches!(event, TrackerEvent::DeviceDiscovered(_)) {
                sightings += 1;
            }
            sightings == 3
        })
        .await;

        assert_eq!(
            entries_of_kind(&f.handle, &device(), LogKind::Scan).await.len(),
            1
        );
        assert_eq!(f.radio.connect_count(&device()), 1);
    }

    #[tokio::test]
    async fn test_link_loss_is_tracked_after_failed_subscription() {
        let radio = Arc::new(MockRadio::new());
        radio.queue_connection_events_error(RadioError::AdapterPoweredOff);
        let mut f = fixture_on(radio, &[device()]).await;

        f.handle.ensure_scanning().await.unwrap();
        wait_for_scan(&mut f.events, true).await;
        wait_for_listener(&f.radio).await;

        f.radio.emit_discovery(DiscoveryEvent::new(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connected).await;

        f.radio
            .emit_connection(ConnectionEvent::disconnected(device(), Some("link loss".into())));
        wait_for_state(&mut f.events, &device(), ConnectionState::Disconnected).await;

        f.radio.emit_discovery(DiscoveryEvent::new(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connected).await;
        assert_eq!(f.radio.connect_count(&device()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_events_back_off_while_adapter_is_off() {
        let radio = Arc::new(MockRadio::new());
        radio.queue_connection_events_error(RadioError::AdapterPoweredOff);
        radio.queue_connection_events_error(RadioError::AdapterPoweredOff);

        let started = time::Instant::now();
        let f = fixture_on(radio, &[device()]).await;
        wait_for_listener(&f.radio).await;

        // 2 s then 4 s.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_connection_stream_is_resubscribed() {
        let f = fixture(&[device()]).await;

        let ended = time::Instant::now();
        f.radio.end_connection_events();
        wait_for_listener(&f.radio).await;

        assert!(ended.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_housekeeping_forgets_stale_unpaired_results() {
        let tracker = Tracker::new(
            Arc::new(MockRadio::new()),
            PairingRegistry::new(Arc::new(MemoryStore::new())),
            LogStore::new(Arc::new(MemoryStore::new()), RetentionPolicy::default()),
        );
        let (mut actor, _handle) = tracker.into_parts(BTreeSet::from([device()]));
        let stranger = DeviceId::parse("11:22:33:44:55:66").unwrap();
        let recent = DeviceId::parse("22:33:44:55:66:77").unwrap();
        let an_hour_ago = Utc::now() - chrono::Duration::hours(1);

        for (id, last_seen_utc) in [
            (device(), an_hour_ago),
            (stranger.clone(), an_hour_ago),
            (recent.clone(), Utc::now()),
        ] {
            let paired = id == device();
            actor.scan_results.insert(
                id.clone(),
                DiscoveredDevice {
                    device_id: id,
                    name: None,
                    rssi: None,
                    paired,
                    last_seen_utc,
                },
            );
        }
        actor.scan.unpaired_seen.insert(stranger.clone());

        actor.housekeeping();

        let kept: BTreeSet<DeviceId> = actor.scan_results.keys().cloned().collect();
        assert_eq!(kept, BTreeSet::from([device(), recent]));
        assert!(!actor.scan.unpaired_seen.contains(&stranger));
    }

    #[tokio::test]
    async fn test_stale_discovery_is_dropped() {
        let tracker = Tracker::new(
            Arc::new(MockRadio::new()),
            PairingRegistry::new(Arc::new(MemoryStore::new())),
            LogStore::new(Arc::new(MemoryStore::new()), RetentionPolicy::default()),
        );
        let (mut actor, _handle) = tracker.into_parts(BTreeSet::from([device()]));

        actor.start_scan();
        let old = actor.scan.generation;
        actor.dispatch(Command::ScanStarted { generation: old });
        actor.stop_scan();
        actor.start_scan();
        actor.dispatch(Command::Discovered {
            generation: old,
            event: DiscoveryEvent::new(device()),
        });

        assert_eq!(actor.table.state(&device()), ConnectionState::Idle);
        assert!(actor.scan_results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_schedules_rescan() {
        let mut f = fixture(&[device()]).await;
        f.radio
            .queue_scan_error(RadioError::ScanRejected("busy".into()));

        let started = time::Instant::now();
        f.handle.ensure_scanning().await.unwrap();
        wait_for_scan(&mut f.events, true).await;

        assert!(started.elapsed() >= Duration::from_secs(5));
        let errors = entries_of_kind(&f.handle, &DeviceId::adapter(), LogKind::Error).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message().contains("busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_unavailable_backs_off() {
        let mut f = fixture(&[device()]).await;
        f.radio.queue_scan_error(RadioError::AdapterPoweredOff);
        f.radio.queue_scan_error(RadioError::AdapterPoweredOff);

        let started = time::Instant::now();
        f.handle.ensure_scanning().await.unwrap();
        wait_for_scan(&mut f.events, true).await;

        // 2 s then 4 s.
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert_eq!(
            entries_of_kind(&f.handle, &DeviceId::adapter(), LogKind::Error)
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_pair_write_failure_is_reported() {
        let f = fixture(&[]).await;
        f.store.set_fail_writes(true);

        let result = f.handle.pair(&device()).await;
        assert!(matches!(result, Err(RelinkError::Storage(_))));
        assert!(!f.handle.is_scanning().await.unwrap());
        assert!(entries_of_kind(&f.handle, &device(), LogKind::Pair)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_pair_then_discovery_connects() {
        let mut f = fixture(&[]).await;
        assert!(f.handle.pair(&device()).await.unwrap());
        wait_for_scan(&mut f.events, true).await;

        f.radio.emit_discovery(DiscoveryEvent::new(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connected).await;

        assert_eq!(
            f.handle.refresh_pairings().await.unwrap(),
            BTreeSet::from([device()])
        );
        assert_eq!(
            entries_of_kind(&f.handle, &device(), LogKind::Pair).await.len(),
            1
        );
        time::sleep(Duration::from_millis(50)).await;
        assert!(f.radio.is_bonded(&device()));
    }

    #[tokio::test]
    async fn test_unpair_disconnects_and_resets() {
        let mut f = fixture(&[device()]).await;
        f.radio.emit_connection(ConnectionEvent::connected(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connected).await;

        assert!(f.handle.unpair(&device()).await.unwrap());
        assert_eq!(
            f.handle.state_of(&device()).await.unwrap(),
            ConnectionState::Idle
        );
        assert!(f.handle.refresh_pairings().await.unwrap().is_empty());
        assert_eq!(
            entries_of_kind(&f.handle, &device(), LogKind::Unpair)
                .await
                .len(),
            1
        );
        time::sleep(Duration::from_millis(50)).await;
        assert!(!f.radio.is_connected(&device()));
        // The disconnect event after reset adds no Disconnect entry.
        assert!(entries_of_kind(&f.handle, &device(), LogKind::Disconnect)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_gatt_operations_are_logged() {
        let mut f = fixture(&[device()]).await;
        f.radio.emit_connection(ConnectionEvent::connected(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connected).await;
        f.radio.set_value(&device(), heart_rate(), b"Hi".to_vec());

        let value = f
            .handle
            .read_characteristic(&device(), &heart_rate())
            .await
            .unwrap();
        assert_eq!(value, b"Hi");
        let reads = entries_of_kind(&f.handle, &device(), LogKind::Read).await;
        assert_eq!(reads[0].payload_text(), Some("Hi"));
        assert_eq!(reads[0].direction(), Direction::Incoming);

        f.handle
            .write_characteristic(&device(), &heart_rate(), vec![0x01, 0xFF])
            .await
            .unwrap();
        assert_eq!(
            f.radio.written(&device(), heart_rate()),
            Some(vec![0x01, 0xFF])
        );
        let writes = entries_of_kind(&f.handle, &device(), LogKind::Write).await;
        assert_eq!(writes[0].payload_hex().as_deref(), Some("01 FF"));
        assert_eq!(writes[0].payload_text(), None);

        f.handle
            .subscribe_characteristic(&device(), &heart_rate())
            .await
            .unwrap();
        assert_eq!(f.radio.notify(&device(), heart_rate(), &[0x48]), 1);
        wait_for(&mut f.events, |event| {
            matches!(event, TrackerEvent::LogAppended(e) if e.kind() == LogKind::Notify)
        })
        .await;

        assert!(f.handle.unsubscribe_characteristic(&device(), &heart_rate()));
        assert!(!f.handle.unsubscribe_characteristic(&device(), &heart_rate()));
    }

    #[tokio::test]
    async fn test_gatt_failure_is_logged_and_returned() {
        let f = fixture(&[device()]).await;

        let result = f.handle.read_characteristic(&device(), &heart_rate()).await;
        assert!(matches!(result, Err(RelinkError::NotConnected(_))));
        let errors = entries_of_kind(&f.handle, &device(), LogKind::Error).await;
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_user_disconnect_updates_state() {
        let mut f = fixture(&[device()]).await;
        f.radio.emit_connection(ConnectionEvent::connected(device()));
        wait_for_state(&mut f.events, &device(), ConnectionState::Connected).await;

        f.handle.disconnect(&device()).await.unwrap();
        wait_for_state(&mut f.events, &device(), ConnectionState::Disconnected).await;
        assert_eq!(
            entries_of_kind(&f.handle, &device(), LogKind::Disconnect)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_stops() {
        let f = fixture(&[device()]).await;
        f.handle.ensure_scanning().await.unwrap();
        f.handle.pair(&device()).await.unwrap();

        f.handle.shutdown().await.unwrap();
        assert!(matches!(
            f.handle.states().await,
            Err(RelinkError::TrackerStopped)
        ));

        let logs = LogStore::new(f.store.clone(), RetentionPolicy::default());
        let persisted = logs.load(&device()).await.unwrap();
        assert!(persisted.iter().any(|entry| entry.kind() == LogKind::Pair));
    }
}
