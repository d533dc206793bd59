//! Tracked partition whitelist.
//!
//! The engine only ever reads, writes, or fingerprints partitions on
//! this whitelist. Everything else in the device state store is
//! invisible to sync.

/// The partition holding the inventory item records.
///
/// This is the only partition merged at record granularity; all other
/// partitions are replaced whole-value on merge.
pub const ITEMS_PARTITION: &str = "items";

/// All partitions eligible for synchronization.
pub const TRACKED_PARTITIONS: &[&str] =
    &["items", "categories", "suppliers", "locations", "settings"];

/// Reserved local key for the persisted device identity. Never synchronized.
pub const DEVICE_ID_KEY: &str = "_sync.device_id";

/// Reserved local key for the persisted sync status. Never synchronized.
pub const STATUS_KEY: &str = "_sync.status";

/// Returns true if the key names a tracked partition.
pub fn is_tracked(key: &str) -> bool {
    TRACKED_PARTITIONS.contains(&key)
}
