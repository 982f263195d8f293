//! Per-device event log store.
//!
//! Each device's log is a list of JSON records under `device_logs/<id>`.
//! Appends keep the newest `max_entries` records; the age rule is applied
//! when loading and by [`LogStore::prune_expired`], which also deletes logs
//! with nothing left in the window. Entries recorded in this process are held
//! in memory until their write lands and are merged into every read, so an
//! entry is visible before it is persisted.
//!
//! Appends to one device are serialised by a per-device async mutex inside
//! the process and by [`KeyValueStore::update_list`] across processes;
//! appends to different devices never wait on each other.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::log_entry::LogEntry;
use crate::storage::{KeyValueStore, StorageError, StorageResult, StoredValue, Update};
use crate::types::DeviceId;

/// Key prefix of per-device logs.
pub const DEVICE_LOG_PREFIX: &str = "device_logs/";

/// Storage key of `device_id`'s log.
#[must_use]
pub fn device_log_key(device_id: &DeviceId) -> String {
    format!("{DEVICE_LOG_PREFIX}{device_id}")
}

/// Bounds applied to every device log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Hard cap of entries per device; oldest are dropped first.
    pub max_entries: usize,
    /// Entries older than this (relative to load time) are dropped.
    pub max_age: chrono::Duration,
    /// Entries newer than this are never dropped by the age rule.
    pub min_recent: chrono::Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age: chrono::Duration::hours(24),
            min_recent: chrono::Duration::minutes(30),
        }
    }
}

impl RetentionPolicy {
    /// Whether `entry` survives the age rule at `now`.
    #[must_use]
    pub fn retains(&self, entry: &LogEntry, now: DateTime<Utc>) -> bool {
        let ts = entry.timestamp();
        ts >= now - self.max_age || ts >= now - self.min_recent
    }

    /// Apply the age rule and sort ascending by timestamp.
    #[must_use]
    pub fn apply(&self, mut entries: Vec<LogEntry>, now: DateTime<Utc>) -> Vec<LogEntry> {
        entries.retain(|entry| self.retains(entry, now));
        entries.sort_by_key(LogEntry::timestamp);
        entries
    }

    /// Keep only the newest `max_entries` of a timestamp-sorted sequence.
    fn cap(&self, mut entries: Vec<LogEntry>) -> Vec<LogEntry> {
        if entries.len() > self.max_entries {
            entries.drain(..entries.len() - self.max_entries);
        }
        entries
    }
}

/// Union by id, then stable sort by timestamp.
///
/// In-memory entries whose id is already persisted are ignored, so merging a
/// subset of `persisted` returns `persisted` unchanged apart from ordering.
#[must_use]
pub fn merge(mut persisted: Vec<LogEntry>, in_memory: &[LogEntry]) -> Vec<LogEntry> {
    let known: HashSet<String> = persisted.iter().map(|e| e.id().to_string()).collect();
    persisted.extend(
        in_memory
            .iter()
            .filter(|entry| !known.contains(entry.id()))
            .cloned(),
    );
    persisted.sort_by_key(LogEntry::timestamp);
    persisted
}

#[derive(Default)]
struct DeviceSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    // Bumped by `clear` so appends recorded earlier are discarded.
    generation: u64,
    // Recorded entries whose write has not landed yet, or failed.
    cache: Vec<LogEntry>,
}

impl DeviceSlot {
    // A slot at generation 0 with nothing cached and no lock holder carries no
    // state; dropping it is the same as keeping it.
    fn is_unused(&self) -> bool {
        self.generation == 0 && self.cache.is_empty() && Arc::strong_count(&self.lock) == 1
    }
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    policy: RetentionPolicy,
    slots: Mutex<HashMap<DeviceId, DeviceSlot>>,
    pending: TaskTracker,
}

/// Durable per-device log with an in-memory cache.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl LogStore {
    /// Create a log store over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, policy: RetentionPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                policy,
                slots: Mutex::new(HashMap::new()),
                pending: TaskTracker::new(),
            }),
        }
    }

    /// The retention policy in force.
    #[must_use]
    pub fn policy(&self) -> RetentionPolicy {
        self.inner.policy
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<DeviceId, DeviceSlot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn device_lock(&self, device_id: &DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        self.slots()
            .entry(device_id.clone())
            .or_default()
            .lock
            .clone()
    }

    fn generation(&self, device_id: &DeviceId) -> u64 {
        self.slots()
            .get(device_id)
            .map_or(0, |slot| slot.generation)
    }

    /// Persist `entry` at the end of its device's log, then apply the hard cap.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the log cannot be read or written.
    pub async fn append(&self, entry: LogEntry) -> StorageResult<()> {
        let generation = self.generation(entry.device_id());
        self.append_if_current(entry, generation).await
    }

    async fn append_if_current(&self, entry: LogEntry, generation: u64) -> StorageResult<()> {
        let device_id = entry.device_id().clone();
        let result = self.append_locked(entry, generation).await;
        self.release_slot(&device_id);
        result
    }

    async fn append_locked(&self, entry: LogEntry, generation: u64) -> StorageResult<()> {
        let device_id = entry.device_id().clone();
        let lock = self.device_lock(&device_id);
        let _guard = lock.lock().await;

        if self.generation(&device_id) != generation {
            debug!(device_id = %device_id, "Dropping entry recorded before the log was cleared");
            return Ok(());
        }

        let record = entry.to_record()?;
        let key = device_log_key(&device_id);
        let max_entries = self.inner.policy.max_entries;
        let store = Arc::clone(&self.inner.store);

        run_blocking(&key, move |key| {
            let mut record = Some(record);
            store.update_list(key, &mut |records| {
                records.extend(record.take());
                if records.len() > max_entries {
                    records.drain(..records.len() - max_entries);
                }
            })
        })
        .await
    }

    fn release_slot(&self, device_id: &DeviceId) {
        let mut slots = self.slots();
        if slots.get(device_id).is_some_and(DeviceSlot::is_unused) {
            slots.remove(device_id);
        }
    }

    fn landed(&self, device_id: &DeviceId, id: &str) {
        if let Some(slot) = self.slots().get_mut(device_id) {
            slot.cache.retain(|entry| entry.id() != id);
        }
        self.release_slot(device_id);
    }

    /// Make `entry` visible immediately and persist it in the background.
    ///
    /// Must be called from within a Tokio runtime. Once the write lands the
    /// entry leaves the cache. Persistence failures are logged and the entry
    /// stays readable from the cache until it ages out.
    pub fn record(&self, entry: LogEntry) {
        let policy = self.inner.policy;
        let generation = {
            let mut slots = self.slots();
            let slot = slots.entry(entry.device_id().clone()).or_default();
            let now = Utc::now();
            slot.cache.retain(|cached| policy.retains(cached, now));
            slot.cache.push(entry.clone());
            if slot.cache.len() > policy.max_entries {
                let excess = slot.cache.len() - policy.max_entries;
                slot.cache.drain(..excess);
            }
            slot.generation
        };

        let this = self.clone();
        self.inner.pending.spawn(async move {
            let device_id = entry.device_id().clone();
            let id = entry.id().to_string();
            match this.append_if_current(entry, generation).await {
                Ok(()) => this.landed(&device_id, &id),
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Failed to persist log entry");
                }
            }
        });
    }

    /// Wait until every entry passed to [`LogStore::record`] so far has been written.
    pub async fn flush(&self) {
        self.inner.pending.close();
        self.inner.pending.wait().await;
        self.inner.pending.reopen();
    }

    /// Persisted entries for `device_id` after the age rule, oldest first.
    ///
    /// Records that fail to decode are skipped.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the log cannot be read.
    pub async fn load(&self, device_id: &DeviceId) -> StorageResult<Vec<LogEntry>> {
        let key = device_log_key(device_id);
        let store = Arc::clone(&self.inner.store);
        let records = run_blocking(&key, move |key| store.get_list(key)).await?;

        let entries = records
            .iter()
            .filter_map(|record| match LogEntry::from_record(record) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Skipping corrupted log entry");
                    None
                }
            })
            .collect();

        Ok(self.inner.policy.apply(entries, Utc::now()))
    }

    /// Entries recorded in this process whose write has not landed.
    #[must_use]
    pub fn cached(&self, device_id: &DeviceId) -> Vec<LogEntry> {
        self.slots()
            .get(device_id)
            .map(|slot| slot.cache.clone())
            .unwrap_or_default()
    }

    /// Persisted and cached entries for `device_id`, merged and bounded.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the persisted log cannot be read.
    pub async fn logs_for(&self, device_id: &DeviceId) -> StorageResult<Vec<LogEntry>> {
        let persisted = self.load(device_id).await?;
        let cached = self.inner.policy.apply(self.cached(device_id), Utc::now());
        Ok(self.inner.policy.cap(merge(persisted, &cached)))
    }

    /// Every device's entries, merged into one timestamp-ordered sequence.
    ///
    /// A device whose persisted log cannot be read contributes its cached
    /// entries only.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the set of logged devices cannot be listed.
    pub async fn all_logs(&self) -> StorageResult<Vec<LogEntry>> {
        let mut devices = self.list_devices_with_logs().await?;
        devices.extend(self.slots().keys().cloned());

        let mut all = Vec::new();
        for device_id in &devices {
            match self.logs_for(device_id).await {
                Ok(entries) => all.extend(entries),
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Failed to load device log");
                    all.extend(self.inner.policy.apply(self.cached(device_id), Utc::now()));
                }
            }
        }
        all.sort_by_key(LogEntry::timestamp);
        Ok(all)
    }

    /// Delete the persisted log and the cache for `device_id`.
    ///
    /// Entries recorded before this call but not yet written are discarded.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the log cannot be removed.
    pub async fn clear(&self, device_id: &DeviceId) -> StorageResult<()> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let key = device_log_key(device_id);
        let store = Arc::clone(&self.inner.store);
        run_blocking(&key, move |key| store.update(key, &mut |_| Ok(Update::Remove))).await?;

        if let Some(slot) = self.slots().get_mut(device_id) {
            slot.generation += 1;
            slot.cache.clear();
        }
        debug!(device_id = %device_id, "Cleared device log");
        Ok(())
    }

    /// Apply the age rule to every persisted log. Logs with no entry left in
    /// the window are deleted. Returns the devices whose log was deleted.
    ///
    /// Records that fail to decode are dropped.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the logged devices cannot be listed. A log
    /// that cannot be rewritten is skipped with a warning.
    pub async fn prune_expired(&self) -> StorageResult<Vec<DeviceId>> {
        let mut deleted = Vec::new();
        for device_id in self.list_devices_with_logs().await? {
            match self.prune_device(&device_id).await {
                Ok(true) => deleted.push(device_id),
                Ok(false) => {}
                Err(e) => warn!(device_id = %device_id, error = %e, "Failed to prune device log"),
            }
        }
        if !deleted.is_empty() {
            debug!(count = deleted.len(), "Deleted expired device logs");
        }
        Ok(deleted)
    }

    async fn prune_device(&self, device_id: &DeviceId) -> StorageResult<bool> {
        let lock = self.device_lock(device_id);
        let guard = lock.lock().await;

        let key = device_log_key(device_id);
        let store = Arc::clone(&self.inner.store);
        let policy = self.inner.policy;
        let result = run_blocking(&key, move |key| {
            let mut deleted = false;
            store.update(key, &mut |current| {
                let records = match current {
                    None => return Ok(Update::Keep),
                    Some(StoredValue::StringList(records)) => records,
                    Some(_) => {
                        return Err(StorageError::TypeMismatch {
                            key: key.to_string(),
                            expected: "string list",
                        })
                    }
                };
                let now = Utc::now();
                let total = records.len();
                let kept: Vec<String> = records
                    .into_iter()
                    .filter(|record| {
                        LogEntry::from_record(record).is_ok_and(|entry| policy.retains(&entry, now))
                    })
                    .collect();
                deleted = kept.is_empty();
                Ok(if deleted {
                    Update::Remove
                } else if kept.len() == total {
                    Update::Keep
                } else {
                    Update::Replace(StoredValue::StringList(kept))
                })
            })?;
            Ok(deleted)
        })
        .await;

        drop(guard);
        drop(lock);
        self.release_slot(device_id);
        result
    }

    /// Devices with a persisted log.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the keys cannot be listed.
    pub async fn list_devices_with_logs(&self) -> StorageResult<BTreeSet<DeviceId>> {
        let store = Arc::clone(&self.inner.store);
        let keys = run_blocking(DEVICE_LOG_PREFIX, move |prefix| {
            store.keys_with_prefix(prefix)
        })
        .await?;

        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(DEVICE_LOG_PREFIX))
            .filter_map(|raw| DeviceId::parse(raw).ok())
            .collect())
    }
}

/// Run a storage call on the blocking pool.
async fn run_blocking<T, F>(key: &str, f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce(&str) -> StorageResult<T> + Send + 'static,
{
    let owned = key.to_string();
    tokio::task::spawn_blocking(move || f(&owned))
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_string(),
            source: std::io::Error::other(e),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_entry::{Direction, LogKind};
    use crate::storage::{FileStore, MemoryStore, StoredValue};
    use chrono::Duration;

    fn device(value: &str) -> DeviceId {
        DeviceId::parse(value).unwrap()
    }

    fn entry(device_id: &DeviceId, message: &str) -> LogEntry {
        LogEntry::new(device_id.clone(), Direction::System, LogKind::Info, message)
    }

    fn memory_log_store() -> (Arc<MemoryStore>, LogStore) {
        let store = Arc::new(MemoryStore::new());
        let logs = LogStore::new(store.clone(), RetentionPolicy::default());
        (store, logs)
    }

    #[tokio::test]
    async fn test_append_then_load_contains_entry() {
        let (_store, logs) = memory_log_store();
        let id = device("AA:BB:CC:DD:EE:FF");
        let appended = entry(&id, "hello");

        tokio_test::assert_ok!(logs.append(appended.clone()).await);
        let loaded = tokio_test::assert_ok!(logs.load(&id).await);
        assert_eq!(loaded, vec![appended]);
    }

    #[test]
    fn test_load_unknown_device_is_empty() {
        let (_store, logs) = memory_log_store();
        let loaded = tokio_test::block_on(logs.load(&device("11:22:33:44:55:66"))).unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_hard_cap_keeps_most_recent_thousand() {
        let (_store, logs) = memory_log_store();
        let id = device("AA:BB:CC:DD:EE:FF");
        let base = Utc::now() - Duration::minutes(10);

        for i in 0..1001 {
            let e = entry(&id, &format!("entry {i}")).at(base + Duration::milliseconds(i));
            logs.append(e).await.unwrap();
        }

        let loaded = logs.load(&id).await.unwrap();
        assert_eq!(loaded.len(), 1000);
        assert_eq!(loaded.first().unwrap().message(), "entry 1");
        assert_eq!(loaded.last().unwrap().message(), "entry 1000");
    }

    #[tokio::test]
    async fn test_age_rule_boundaries() {
        let (_store, logs) = memory_log_store();
        let id = device("AA:BB:CC:DD:EE:FF");
        let now = Utc::now();

        let kept = entry(&id, "kept").at(now - Duration::hours(24) + Duration::minutes(1));
        let dropped = entry(&id, "dropped").at(now - Duration::hours(24) - Duration::minutes(1));
        logs.append(dropped).await.unwrap();
        logs.append(kept.clone()).await.unwrap();

        assert_eq!(logs.load(&id).await.unwrap(), vec![kept]);
    }

    #[test]
    fn test_recent_window_survives_short_max_age() {
        let policy = RetentionPolicy {
            max_entries: 10,
            max_age: Duration::minutes(5),
            min_recent: Duration::minutes(30),
        };
        let id = device("A1");
        let now = Utc::now();
        let recent = entry(&id, "recent").at(now - Duration::minutes(20));
        let old = entry(&id, "old").at(now - Duration::minutes(40));

        let kept = policy.apply(vec![old, recent.clone()], now);
        assert_eq!(kept, vec![recent]);
    }

    #[tokio::test]
    async fn test_load_sorts_by_timestamp() {
        let (_store, logs) = memory_log_store();
        let id = device("A1");
        let now = Utc::now();
        let later = entry(&id, "later").at(now);
        let earlier = entry(&id, "earlier").at(now - Duration::seconds(5));

        logs.append(later.clone()).await.unwrap();
        logs.append(earlier.clone()).await.unwrap();
        assert_eq!(logs.load(&id).await.unwrap(), vec![earlier, later]);
    }

    #[tokio::test]
    async fn test_corrupted_records_are_skipped() {
        let (store, logs) = memory_log_store();
        let id = device("A1");
        let good = entry(&id, "good");
        store.insert_raw(
            &device_log_key(&id),
            StoredValue::StringList(vec![
                "{broken".to_string(),
                good.to_record().unwrap(),
                r#"{"id":"x","timestamp":0,"deviceId":"A1","direction":9,"kind":0,"message":""}"#
                    .to_string(),
            ]),
        );

        assert_eq!(logs.load(&id).await.unwrap(), vec![good]);
    }

    #[test]
    fn test_merge_subset_returns_persisted() {
        let id = device("A1");
        let now = Utc::now();
        let a = entry(&id, "a").at(now - Duration::seconds(2));
        let b = entry(&id, "b").at(now - Duration::seconds(1));
        let c = entry(&id, "c").at(now);

        let persisted = vec![c.clone(), a.clone(), b.clone()];
        let merged = merge(persisted, &[a.clone(), c.clone()]);
        assert_eq!(merged, vec![a, b, c]);
    }

    #[test]
    fn test_merge_appends_unpersisted_entries() {
        let id = device("A1");
        let now = Utc::now();
        let persisted = entry(&id, "persisted").at(now - Duration::seconds(1));
        let fresh = entry(&id, "fresh").at(now);

        let merged = merge(vec![persisted.clone()], &[fresh.clone(), persisted.clone()]);
        assert_eq!(merged, vec![persisted, fresh]);
    }

    #[tokio::test]
    async fn test_recorded_entries_visible_before_and_after_flush() {
        let (_store, logs) = memory_log_store();
        let id = device("A1");
        let e = entry(&id, "recorded");

        logs.record(e.clone());
        assert_eq!(logs.logs_for(&id).await.unwrap(), vec![e.clone()]);

        logs.flush().await;
        assert_eq!(logs.load(&id).await.unwrap(), vec![e.clone()]);
        assert_eq!(logs.logs_for(&id).await.unwrap(), vec![e]);
    }

    #[tokio::test]
    async fn test_record_survives_persist_failure_in_cache() {
        let (store, logs) = memory_log_store();
        let id = device("A1");
        store.set_fail_writes(true);

        let e = entry(&id, "unpersisted");
        logs.record(e.clone());
        logs.flush().await;

        assert!(logs.load(&id).await.unwrap().is_empty());
        assert_eq!(logs.logs_for(&id).await.unwrap(), vec![e]);
    }

    #[tokio::test]
    async fn test_landed_entries_leave_the_cache() {
        let (_store, logs) = memory_log_store();
        let id = device("A1");
        logs.record(entry(&id, "one"));
        logs.record(entry(&id, "two"));
        logs.flush().await;

        assert!(logs.cached(&id).is_empty());
        assert!(logs.slots().is_empty());
        assert_eq!(logs.logs_for(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unpersisted_cache_drops_aged_entries() {
        let (store, logs) = memory_log_store();
        let id = device("A1");
        store.set_fail_writes(true);

        logs.record(entry(&id, "stale").at(Utc::now() - Duration::hours(25)));
        logs.record(entry(&id, "fresh"));
        logs.flush().await;

        let cached: Vec<_> = logs.cached(&id).iter().map(|e| e.message().to_string()).collect();
        assert_eq!(cached, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_prune_deletes_logs_outside_the_window() {
        let (store, logs) = memory_log_store();
        let stale = device("A1");
        let mixed = device("B2");
        let old = Utc::now() - Duration::hours(25);

        logs.append(entry(&stale, "gone").at(old)).await.unwrap();
        logs.append(entry(&mixed, "gone too").at(old)).await.unwrap();
        logs.append(entry(&mixed, "kept")).await.unwrap();

        assert_eq!(logs.prune_expired().await.unwrap(), vec![stale]);
        assert_eq!(
            logs.list_devices_with_logs().await.unwrap(),
            BTreeSet::from([mixed.clone()])
        );
        assert_eq!(store.get_list(&device_log_key(&mixed)).unwrap().len(), 1);
        assert!(logs.slots().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_appends_through_separate_stores_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let id = device("AA:BB:CC:DD:EE:FF");

        let writers: Vec<_> = (0..2)
            .map(|writer| {
                let store = Arc::new(FileStore::open(dir.path()).unwrap());
                let logs = LogStore::new(store, RetentionPolicy::default());
                let id = id.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        logs.append(entry(&id, &format!("{writer}-{i}"))).await.unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let logs = LogStore::new(
            Arc::new(FileStore::open(dir.path()).unwrap()),
            RetentionPolicy::default(),
        );
        assert_eq!(logs.load(&id).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_clear_removes_persisted_and_cached() {
        let (_store, logs) = memory_log_store();
        let id = device("A1");
        let other = device("B2");
        logs.record(entry(&id, "one"));
        logs.record(entry(&other, "two"));
        logs.flush().await;

        logs.clear(&id).await.unwrap();
        assert!(logs.logs_for(&id).await.unwrap().is_empty());
        assert_eq!(logs.logs_for(&other).await.unwrap().len(), 1);
        assert_eq!(
            logs.list_devices_with_logs().await.unwrap(),
            BTreeSet::from([other])
        );
    }

    #[tokio::test]
    async fn test_concurrent_appends_to_one_device_are_not_lost() {
        let (_store, logs) = memory_log_store();
        let id = device("A1");

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let logs = logs.clone();
                let e = entry(&id, &format!("e{i}"));
                tokio::spawn(async move { logs.append(e).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(logs.load(&id).await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_all_logs_merges_devices_in_time_order() {
        let (_store, logs) = memory_log_store();
        let a = device("A1");
        let b = device("B2");
        let now = Utc::now();

        logs.append(entry(&a, "a-old").at(now - Duration::seconds(3)))
            .await
            .unwrap();
        logs.append(entry(&b, "b-mid").at(now - Duration::seconds(2)))
            .await
            .unwrap();
        logs.record(entry(&a, "a-new").at(now));

        let messages: Vec<String> = logs
            .all_logs()
            .await
            .unwrap()
            .iter()
            .map(|e| e.message().to_string())
            .collect();
        assert_eq!(messages, vec!["a-old", "b-mid", "a-new"]);
    }

    #[tokio::test]
    async fn test_cold_start_reconstructs_from_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let id = device("aa:bb:cc:dd:ee:ff");
        let e = entry(&id, "before restart").with_payload(vec![0x01, 0x41]);
        {
            let logs = LogStore::new(
                Arc::new(FileStore::open(dir.path()).unwrap()),
                RetentionPolicy::default(),
            );
            logs.record(e.clone());
            logs.flush().await;
        }

        let logs = LogStore::new(
            Arc::new(FileStore::open(dir.path()).unwrap()),
            RetentionPolicy::default(),
        );
        assert_eq!(
            logs.list_devices_with_logs().await.unwrap(),
            BTreeSet::from([id.clone()])
        );
        assert_eq!(logs.all_logs().await.unwrap(), vec![e]);
    }
}
