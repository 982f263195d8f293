//! Durable key-value persistence shared by the foreground and background
//! processes.
//!
//! Values are strings, string sets or string lists. [`FileStore`] keeps one
//! JSON file per key and replaces it atomically, so the other process never
//! reads a torn value. Read-modify-write goes through [`KeyValueStore::update`],
//! which [`FileStore`] serialises across processes with an exclusive lock on a
//! per-key `.lock` file. [`MemoryStore`] is the in-process equivalent used in
//! tests.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use fs2::FileExt;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Characters left untouched when turning a key into a file name.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

const FILE_EXTENSION: &str = "json";
const LOCK_EXTENSION: &str = "lock";

// Distinguishes temp files of concurrent writers within one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors raised by a [`KeyValueStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The value for a key could not be read.
    #[error("Failed to read '{key}': {source}")]
    Read {
        /// Key being read.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The value for a key could not be written.
    #[error("Failed to write '{key}': {source}")]
    Write {
        /// Key being written.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The storage directory could not be created.
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A value could not be encoded.
    #[error("Failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A stored value could not be decoded.
    #[error("Corrupted value for '{key}': {message}")]
    Deserialize {
        /// Key being decoded.
        key: String,
        /// Decoder message.
        message: String,
    },

    /// The key holds a value of another type.
    #[error("Key '{key}' does not hold a {expected}")]
    TypeMismatch {
        /// Key being read.
        key: String,
        /// Requested value type.
        expected: &'static str,
    },

    /// Writes were switched off on a [`MemoryStore`].
    #[error("Writes are disabled on this store")]
    WritesDisabled,
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A typed value held under one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    /// A single string.
    String(String),
    /// A set of unique strings.
    StringSet(BTreeSet<String>),
    /// An ordered list of strings.
    StringList(Vec<String>),
}

/// Outcome of an [`KeyValueStore::update`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Leave the stored value as it is.
    Keep,
    /// Store this value.
    Replace(StoredValue),
    /// Delete the key.
    Remove,
}

/// String-keyed durable storage.
///
/// Absent keys read as `None` or as an empty collection. Implementations must
/// be safe to share between tasks.
pub trait KeyValueStore: Send + Sync {
    /// Read the raw value under `key`.
    fn get(&self, key: &str) -> StorageResult<Option<StoredValue>>;

    /// Replace the value under `key`.
    fn set(&self, key: &str, value: StoredValue) -> StorageResult<()>;

    /// Delete `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// All keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Read the value under `key`, decide, and write the decision back as one
    /// step. No other `update` of the same key, in this process or another
    /// one sharing the store, runs in between.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<StoredValue>) -> StorageResult<Update>,
    ) -> StorageResult<()>;

    /// Read a string value.
    fn get_string(&self, key: &str) -> StorageResult<Option<String>> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoredValue::String(value)) => Ok(Some(value)),
            Some(_) => Err(mismatch(key, "string")),
        }
    }

    /// Write a string value.
    fn set_string(&self, key: &str, value: String) -> StorageResult<()> {
        self.set(key, StoredValue::String(value))
    }

    /// Read a string set; an absent key is an empty set.
    fn get_set(&self, key: &str) -> StorageResult<BTreeSet<String>> {
        match self.get(key)? {
            None => Ok(BTreeSet::new()),
            Some(StoredValue::StringSet(value)) => Ok(value),
            Some(_) => Err(mismatch(key, "string set")),
        }
    }

    /// Write a string set.
    fn set_set(&self, key: &str, value: BTreeSet<String>) -> StorageResult<()> {
        self.set(key, StoredValue::StringSet(value))
    }

    /// Read a string list; an absent key is an empty list.
    fn get_list(&self, key: &str) -> StorageResult<Vec<String>> {
        match self.get(key)? {
            None => Ok(Vec::new()),
            Some(StoredValue::StringList(value)) => Ok(value),
            Some(_) => Err(mismatch(key, "string list")),
        }
    }

    /// Write a string list.
    fn set_list(&self, key: &str, value: Vec<String>) -> StorageResult<()> {
        self.set(key, StoredValue::StringList(value))
    }

    /// Edit a string set in place. `apply` returns whether it changed the
    /// set; unchanged sets are not written. Returns that flag.
    fn update_set(
        &self,
        key: &str,
        apply: &mut dyn FnMut(&mut BTreeSet<String>) -> bool,
    ) -> StorageResult<bool> {
        let mut changed = false;
        self.update(key, &mut |current| {
            let mut set = match current {
                None => BTreeSet::new(),
                Some(StoredValue::StringSet(set)) => set,
                Some(_) => return Err(mismatch(key, "string set")),
            };
            changed = apply(&mut set);
            Ok(if changed {
                Update::Replace(StoredValue::StringSet(set))
            } else {
                Update::Keep
            })
        })?;
        Ok(changed)
    }

    /// Edit a string list in place and write it back. An empty result
    /// deletes the key.
    fn update_list(
        &self,
        key: &str,
        apply: &mut dyn FnMut(&mut Vec<String>),
    ) -> StorageResult<()> {
        self.update(key, &mut |current| {
            let mut list = match current {
                None => Vec::new(),
                Some(StoredValue::StringList(list)) => list,
                Some(_) => return Err(mismatch(key, "string list")),
            };
            apply(&mut list);
            Ok(if list.is_empty() {
                Update::Remove
            } else {
                Update::Replace(StoredValue::StringList(list))
            })
        })
    }
}

fn mismatch(key: &str, expected: &'static str) -> StorageError {
    StorageError::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}

/// Returns the default data directory.
///
/// On Linux: `/var/lib/relink/`
/// Elsewhere: the platform data directory for `relink`.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/relink")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "relink")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data"))
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// File-backed store: one `<percent-encoded key>.json` file per key.
#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CreateDir`] if the directory cannot be created.
    pub fn open(data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|source| StorageError::CreateDir {
            path: data_dir.clone(),
            source,
        })?;
        debug!(path = %data_dir.display(), "Opened file store");
        Ok(Self { data_dir })
    }

    /// Directory holding the key files.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let encoded = utf8_percent_encode(key, KEY_ENCODE_SET).to_string();
        self.data_dir.join(format!("{encoded}.{FILE_EXTENSION}"))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let encoded = utf8_percent_encode(key, KEY_ENCODE_SET).to_string();
        self.data_dir.join(format!("{encoded}.{LOCK_EXTENSION}"))
    }

    /// Take the cross-process lock of `key`. Released when the file drops.
    fn lock_key(key: &str, lock_path: &Path) -> StorageResult<File> {
        loop {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(lock_path)
                .map_err(Self::write_err(key))?;
            // Blocks while another process holds it.
            file.lock_exclusive().map_err(Self::write_err(key))?;
            if still_linked(&file, lock_path) {
                return Ok(file);
            }
        }
    }

    fn write_err(key: &str) -> impl Fn(std::io::Error) -> StorageError + '_ {
        move |source| StorageError::Write {
            key: key.to_string(),
            source,
        }
    }

    fn decode_file_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(&format!(".{FILE_EXTENSION}"))?;
        percent_decode_str(stem)
            .decode_utf8()
            .ok()
            .map(|key| key.into_owned())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<StoredValue>> {
        let path = self.key_path(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::Read {
                    key: key.to_string(),
                    source,
                })
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StorageError::Deserialize {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    fn set(&self, key: &str, value: StoredValue) -> StorageResult<()> {
        let path = self.key_path(key);
        let content = serde_json::to_string(&value)?;

        // Write beside the target and rename over it so readers never see a
        // partially written file.
        let tmp_path = path.with_extension(format!(
            "{FILE_EXTENSION}.tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let write_err = Self::write_err(key);
        std::fs::write(&tmp_path, content).map_err(&write_err)?;
        if let Err(source) = std::fs::rename(&tmp_path, &path) {
            std::fs::remove_file(&tmp_path).ok();
            return Err(write_err(source));
        }
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<StoredValue>) -> StorageResult<Update>,
    ) -> StorageResult<()> {
        let lock_path = self.lock_path(key);
        let _lock = Self::lock_key(key, &lock_path)?;

        match apply(self.get(key)?)? {
            Update::Keep => Ok(()),
            Update::Replace(value) => self.set(key, value),
            Update::Remove => {
                self.remove(key)?;
                // Unlinked while held; waiters on the old inode notice and retry.
                #[cfg(unix)]
                std::fs::remove_file(&lock_path).ok();
                Ok(())
            }
        }
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        match std::fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Write {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let read_err = |source| StorageError::Read {
            key: prefix.to_string(),
            source,
        };
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match Self::decode_file_name(name) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => {
                    if !name.contains(".tmp-") && !name.ends_with(LOCK_EXTENSION) {
                        warn!(file = name, "Ignoring unexpected file in data directory");
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Whether `path` still names the open `file`. A holder that deleted the key
/// also unlinks its lock file, which leaves earlier openers on a dead inode.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> bool {
    true
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// In-process store. Values are lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, StoredValue>>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StorageError::WritesDisabled`].
    pub fn set_fail_writes(&self, fail: bool) {
        *lock(&self.fail_writes) = fail;
    }

    /// Store an arbitrary raw value, bypassing the write-failure switch.
    pub fn insert_raw(&self, key: &str, value: StoredValue) {
        lock(&self.values).insert(key.to_string(), value);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if *lock(&self.fail_writes) {
            Err(StorageError::WritesDisabled)
        } else {
            Ok(())
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<StoredValue>> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: StoredValue) -> StorageResult<()> {
        self.check_writable()?;
        lock(&self.values).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.check_writable()?;
        lock(&self.values).remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<StoredValue>) -> StorageResult<Update>,
    ) -> StorageResult<()> {
        let mut values = lock(&self.values);
        match apply(values.get(key).cloned())? {
            Update::Keep => {}
            Update::Replace(value) => {
                self.check_writable()?;
                values.insert(key.to_string(), value);
            }
            Update::Remove => {
                self.check_writable()?;
                values.remove(key);
            }
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = lock(&self.values)
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
