//! # Stockbook Sync Protocol
//!
//! Payload types for the Stockbook state-synchronization engine.
//!
//! This crate provides:
//! - The tracked partition whitelist
//! - `RemoteSnapshot` / `RemoteRow` (the single remote replica row)
//! - `StockRecord` for record-level merge of the items partition
//! - `DeviceId` provenance metadata
//!
//! This is a pure data crate with no I/O operations. All wire payloads
//! are JSON; partition values themselves are opaque strings owned by
//! the domain layer.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod partition;
mod record;
mod snapshot;

pub use partition::{is_tracked, DEVICE_ID_KEY, ITEMS_PARTITION, STATUS_KEY, TRACKED_PARTITIONS};
pub use record::StockRecord;
pub use snapshot::{DeviceId, RemoteRow, RemoteSnapshot};
