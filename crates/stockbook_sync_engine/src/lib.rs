//! State-synchronization engine for Stockbook devices.
//!
//! Each device keeps its working state in a local key/value store and
//! mirrors the tracked portion of it into a single mutable row per
//! sync space on a remote replica. The engine detects local changes by
//! content signature, pushes the full snapshot when the signature
//! moves, and pulls the remote row when its server-maintained change
//! marker moves. Pulled snapshots are merged all-or-nothing: tracked
//! values are replaced wholesale, except the items partition, which is
//! merged per record with last-write-wins on record timestamps.
//!
//! [`SyncService`] is the usual entry point: it spawns a background
//! task that bootstraps with a pull-then-push pass and then reacts to
//! a poll ticker, embedder triggers, and an optional realtime channel.
//! [`SyncEngine`] is also usable directly when the embedder wants to
//! drive cycles itself.
//!
//! The remote side is abstracted behind [`RemoteReplica`];
//! [`RestReplica`] speaks a PostgREST-style row API over any
//! [`HttpClient`], and [`MemoryRemote`] serves as an in-process
//! replica for tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod config;
mod engine;
mod error;
mod merge;
mod remote;
mod rest;
mod runner;
mod signature;
mod state;
mod store;

pub use backoff::PullBackoff;
pub use config::{RetryConfig, SyncConfig};
pub use engine::{PullKind, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use merge::{merge_records, resolve};
pub use remote::{write_row_with_fallback, MemoryRemote, RealtimeEvent, RemoteReplica};
pub use rest::{HttpClient, HttpResponse, RestReplica};
pub use runner::{SyncHandle, SyncService, Trigger};
pub use signature::signature;
pub use state::{SyncState, SyncStatus};
pub use store::{load_or_create_device_id, read_snapshot, MemoryStateStore, StateStore};
