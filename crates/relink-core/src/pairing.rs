//! Pairing registry: the durable set of device ids the user has paired.
//!
//! The set lives under a single storage key so both processes see the same
//! registry. Every read goes to storage; nothing here caches. Changes go
//! through [`KeyValueStore::update_set`], so a pair in one process and an
//! unpair in the other never overwrite each other.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::storage::{KeyValueStore, StorageResult, Update};
use crate::types::DeviceId;

/// Storage key holding the paired set.
pub const PAIRED_DEVICES_KEY: &str = "paired_devices";

/// Durable set of paired device ids.
#[derive(Clone)]
pub struct PairingRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for PairingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingRegistry").finish_non_exhaustive()
    }
}

impl PairingRegistry {
    /// Create a registry over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns `true` if `id` is paired.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the set cannot be read. A failed read is
    /// never reported as "not paired".
    pub fn is_paired(&self, id: &DeviceId) -> StorageResult<bool> {
        Ok(self.store.get_set(PAIRED_DEVICES_KEY)?.contains(id.as_str()))
    }

    /// Add `id`. Returns `true` if it was not paired before.
    ///
    /// The set is persisted before this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the set cannot be read or written.
    pub fn add_paired(&self, id: &DeviceId) -> StorageResult<bool> {
        let added = self
            .store
            .update_set(PAIRED_DEVICES_KEY, &mut |set| set.insert(id.to_string()))?;
        if added {
            info!(device_id = %id, "Device paired");
        } else {
            debug!(device_id = %id, "Device already paired");
        }
        Ok(added)
    }

    /// Remove `id`. Returns `true` if it was paired.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the set cannot be read or written.
    pub fn remove_paired(&self, id: &DeviceId) -> StorageResult<bool> {
        let removed = self
            .store
            .update_set(PAIRED_DEVICES_KEY, &mut |set| set.remove(id.as_str()))?;
        if removed {
            info!(device_id = %id, "Device unpaired");
        }
        Ok(removed)
    }

    /// Fresh snapshot of the paired set.
    ///
    /// Stored values that are not valid identifiers are skipped.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the set cannot be read.
    pub fn load_all(&self) -> StorageResult<BTreeSet<DeviceId>> {
        let raw = self.store.get_set(PAIRED_DEVICES_KEY)?;
        Ok(raw
            .into_iter()
            .filter_map(|value| match DeviceId::parse(&value) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(value = %value, error = %e, "Skipping invalid paired device id");
                    None
                }
            })
            .collect())
    }

    /// Remove every paired device.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the key cannot be removed.
    pub fn clear_all(&self) -> StorageResult<()> {
        self.store
            .update(PAIRED_DEVICES_KEY, &mut |_| Ok(Update::Remove))?;
        info!("Pairing registry cleared");
        Ok(())
    }
}
