//! Snapshot fingerprinting.
//!
//! The signature answers two questions cheaply: "did local state
//! change since the last confirmed sync" and "does freshly merged
//! local state match what was just merged". It is compared only for
//! equality and never transmitted.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Computes a deterministic fingerprint of a tracked-state map.
///
/// Keys are visited in sorted order (the map guarantees it) and each
/// key and value is length-prefixed, so the result is independent of
/// insertion order and unambiguous across key/value boundaries.
pub fn signature(values: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in values {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing to a String cannot fail.
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
