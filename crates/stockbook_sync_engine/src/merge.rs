//! Merge resolution for remote snapshots.
//!
//! Default rule, per tracked key: whole-value replacement, remote
//! authoritative. The items partition is the one exception: it is
//! merged per record, union by identity with last-write-wins on the
//! record's effective timestamp, so two devices editing different
//! records concurrently both keep their edits.
//!
//! [`resolve`] is pure: it computes the full post-merge map before the
//! engine writes anything, keeping the merge all-or-nothing.

use crate::error::{SyncError, SyncResult};
use std::collections::BTreeMap;
use stockbook_sync_protocol::{StockRecord, ITEMS_PARTITION, TRACKED_PARTITIONS};

/// Computes the post-merge tracked-state map for a remote snapshot.
///
/// Keys absent from the result must be removed locally. Untracked
/// remote keys are ignored. A records partition that fails to parse on
/// either side aborts the whole merge with [`SyncError::Merge`].
pub fn resolve(
    local: &BTreeMap<String, String>,
    remote: &BTreeMap<String, String>,
) -> SyncResult<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();

    for key in TRACKED_PARTITIONS {
        if *key == ITEMS_PARTITION {
            let local_items = local.get(*key).map(String::as_str);
            let remote_items = remote.get(*key).map(String::as_str);
            if local_items.is_none() && remote_items.is_none() {
                continue;
            }
            let value = merge_records(
                local_items.unwrap_or("[]"),
                remote_items.unwrap_or("[]"),
            )?;
            merged.insert((*key).to_string(), value);
        } else if let Some(value) = remote.get(*key) {
            merged.insert((*key).to_string(), value.clone());
        }
    }

    Ok(merged)
}

/// Merges two items partition values: union by record identity, the
/// newer effective timestamp wins, local wins ties. Records unique to
/// one side are kept as-is. Output is ordered by record id so the
/// result is deterministic on every device.
pub fn merge_records(local_json: &str, remote_json: &str) -> SyncResult<String> {
    let local_records = StockRecord::parse_collection(local_json)
        .map_err(|e| SyncError::Merge(format!("local items unreadable: {e}")))?;
    let remote_records = StockRecord::parse_collection(remote_json)
        .map_err(|e| SyncError::Merge(format!("remote items unreadable: {e}")))?;

    let mut by_id: BTreeMap<String, StockRecord> = BTreeMap::new();
    for record in local_records {
        by_id.insert(record.id.clone(), record);
    }
    for record in remote_records {
        match by_id.get(&record.id) {
            Some(existing) if record.effective_timestamp() <= existing.effective_timestamp() => {}
            _ => {
                by_id.insert(record.id.clone(), record);
            }
        }
    }

    let merged: Vec<StockRecord> = by_id.into_values().collect();
    StockRecord::serialize_collection(&merged)
        .map_err(|e| SyncError::Merge(format!("merged items unserializable: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items(records: serde_json::Value) -> String {
        records.to_string()
    }

    fn parsed(json: &str) -> Vec<StockRecord> {
        StockRecord::parse_collection(json).unwrap()
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn concurrent_edits_to_different_records_both_survive() {
        // Device A edited record X, device B edited record Y.
        let local = items(json!([
            {"id": "x", "qty": 9, "updatedAt": 300},
            {"id": "y", "qty": 1, "updatedAt": 100},
        ]));
        let remote = items(json!([
            {"id": "x", "qty": 5, "updatedAt": 100},
            {"id": "y", "qty": 7, "updatedAt": 300},
        ]));

        let merged = parsed(&merge_records(&local, &remote).unwrap());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].fields["qty"], json!(9)); // x: local was newer
        assert_eq!(merged[1].fields["qty"], json!(7)); // y: remote was newer
    }

    #[test]
    fn offline_edit_beats_older_remote_value() {
        // Device A pushed qty 5 at t=100; device B edited the same
        // record offline to qty 3 at t=200 and then pulls.
        let local = items(json!([{"id": "1", "qty": 3, "updatedAt": 200}]));
        let remote = items(json!([{"id": "1", "qty": 5, "updatedAt": 100}]));

        let merged = parsed(&merge_records(&local, &remote).unwrap());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].fields["qty"], json!(3));
        assert_eq!(merged[0].updated_at, Some(200));
    }

    #[test]
    fn records_unique_to_one_side_are_kept() {
        let local = items(json!([{"id": "a", "updatedAt": 100}]));
        let remote = items(json!([{"id": "b", "updatedAt": 100}]));

        let merged = parsed(&merge_records(&local, &remote).unwrap());
        let ids: Vec<&str> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn timestamp_tie_keeps_local() {
        let local = items(json!([{"id": "1", "qty": 3, "updatedAt": 100}]));
        let remote = items(json!([{"id": "1", "qty": 5, "updatedAt": 100}]));

        let merged = parsed(&merge_records(&local, &remote).unwrap());
        assert_eq!(merged[0].fields["qty"], json!(3));
    }

    #[test]
    fn created_at_is_the_fallback_timestamp() {
        let local = items(json!([{"id": "1", "qty": 3, "createdAt": 50}]));
        let remote = items(json!([{"id": "1", "qty": 5, "updatedAt": 100}]));

        let merged = parsed(&merge_records(&local, &remote).unwrap());
        assert_eq!(merged[0].fields["qty"], json!(5));
    }

    #[test]
    fn unreadable_items_abort_the_merge() {
        assert!(matches!(
            merge_records("[]", "not json"),
            Err(SyncError::Merge(_))
        ));
        assert!(matches!(
            merge_records("not json", "[]"),
            Err(SyncError::Merge(_))
        ));
    }

    #[test]
    fn resolve_replaces_whole_values() {
        let local = map(&[("categories", "[\"old\"]"), ("settings", "{}")]);
        let remote = map(&[("categories", "[\"new\"]")]);

        let merged = resolve(&local, &remote).unwrap();
        assert_eq!(merged.get("categories").unwrap(), "[\"new\"]");
        // Absent remotely means removed locally.
        assert!(!merged.contains_key("settings"));
    }

    #[test]
    fn resolve_adds_keys_only_present_remotely() {
        let local = map(&[]);
        let remote = map(&[("suppliers", "[]")]);

        let merged = resolve(&local, &remote).unwrap();
        assert_eq!(merged.get("suppliers").unwrap(), "[]");
    }

    #[test]
    fn resolve_ignores_untracked_remote_keys() {
        let local = map(&[]);
        let remote = map(&[("pin_hash", "secret"), ("settings", "{}")]);

        let merged = resolve(&local, &remote).unwrap();
        assert!(!merged.contains_key("pin_hash"));
        assert!(merged.contains_key("settings"));
    }

    #[test]
    fn resolve_merges_items_instead_of_replacing() {
        let local_items = items(json!([{"id": "x", "qty": 9, "updatedAt": 300}]));
        let remote_items = items(json!([{"id": "y", "qty": 7, "updatedAt": 100}]));
        let local = map(&[("items", &local_items)]);
        let remote = map(&[("items", &remote_items)]);

        let merged = resolve(&local, &remote).unwrap();
        let records = parsed(merged.get("items").unwrap());
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn resolve_keeps_local_items_when_remote_has_none() {
        let local_items = items(json!([{"id": "x", "updatedAt": 100}]));
        let local = map(&[("items", &local_items)]);
        let remote = map(&[("settings", "{}")]);

        let merged = resolve(&local, &remote).unwrap();
        let records = parsed(merged.get("items").unwrap());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "x");
    }

    #[test]
    fn resolve_is_all_or_nothing_on_bad_items() {
        let local = map(&[("items", "[]"), ("settings", "{}")]);
        let remote = map(&[("items", "garbage"), ("settings", "{\"a\":1}")]);

        assert!(resolve(&local, &remote).is_err());
    }
}
