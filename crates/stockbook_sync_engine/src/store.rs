//! Device state store boundary.
//!
//! The storage engine itself is external; the sync engine only needs
//! string key/value access to read tracked partitions, apply merges,
//! and persist its own reserved keys (device identity, status).

use crate::error::SyncResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use stockbook_sync_protocol::{DeviceId, DEVICE_ID_KEY, TRACKED_PARTITIONS};

/// Key/value access to the device-local state store.
pub trait StateStore: Send + Sync {
    /// Reads the value stored under a key.
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    /// Writes a value under a key.
    fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    /// Removes a key, if present.
    fn remove(&self, key: &str) -> SyncResult<()>;
}

/// Reads the current local snapshot: every tracked partition that has
/// a value. Untracked keys are never touched.
pub fn read_snapshot(store: &dyn StateStore) -> SyncResult<BTreeMap<String, String>> {
    let mut snapshot = BTreeMap::new();
    for key in TRACKED_PARTITIONS {
        if let Some(value) = store.get(key)? {
            snapshot.insert((*key).to_string(), value);
        }
    }
    Ok(snapshot)
}

/// Loads the persisted device identity, generating and persisting a
/// fresh one on first run.
pub fn load_or_create_device_id(store: &dyn StateStore) -> SyncResult<DeviceId> {
    if let Some(existing) = store.get(DEVICE_ID_KEY)? {
        if !existing.is_empty() {
            return Ok(DeviceId::from(existing));
        }
    }
    let device_id = DeviceId::generate();
    store.set(DEVICE_ID_KEY, device_id.as_str())?;
    Ok(device_id)
}

/// An in-memory state store for tests and embedders without a durable
/// backend.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// A store wrapper that fails every operation. Test helper.
#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
impl StateStore for FailingStore {
    fn get(&self, _key: &str) -> SyncResult<Option<String>> {
        Err(crate::error::SyncError::Store("store unavailable".into()))
    }

    fn set(&self, _key: &str, _value: &str) -> SyncResult<()> {
        Err(crate::error::SyncError::Store("store unavailable".into()))
    }

    fn remove(&self, _key: &str) -> SyncResult<()> {
        Err(crate::error::SyncError::Store("store unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get("items").unwrap(), None);

        store.set("items", "[]").unwrap();
        assert_eq!(store.get("items").unwrap(), Some("[]".to_string()));

        store.remove("items").unwrap();
        assert_eq!(store.get("items").unwrap(), None);
    }

    #[test]
    fn snapshot_reads_only_tracked_keys() {
        let store = MemoryStateStore::new();
        store.set("items", "[]").unwrap();
        store.set("settings", "{}").unwrap();
        store.set("pin_hash", "secret").unwrap();
        store.set(DEVICE_ID_KEY, "device-a").unwrap();

        let snapshot = read_snapshot(&store).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key("items"));
        assert!(snapshot.contains_key("settings"));
        assert!(!snapshot.contains_key("pin_hash"));
        assert!(!snapshot.contains_key(DEVICE_ID_KEY));
    }

    #[test]
    fn device_id_is_stable_across_loads() {
        let store = MemoryStateStore::new();
        let first = load_or_create_device_id(&store).unwrap();
        let second = load_or_create_device_id(&store).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn store_failure_propagates() {
        assert!(read_snapshot(&FailingStore).is_err());
        assert!(load_or_create_device_id(&FailingStore).is_err());
    }
}
