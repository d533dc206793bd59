//! Engine status and its projection to the UI.

use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use stockbook_sync_protocol::STATUS_KEY;
use tokio::sync::watch;
use tracing::warn;

/// The observable state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Configuration is missing; the engine performs no network activity.
    Disabled,
    /// The engine is attempting to reach the remote replica.
    Connecting,
    /// The last sync cycle completed without errors.
    Connected,
    /// The last sync cycle recorded an error.
    Error,
}

/// A small projection of engine state for external consumers.
///
/// Mutated exclusively by the engine after each meaningful transition;
/// persisted to the state store and re-broadcast on a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Current engine state.
    pub state: SyncState,
    /// Completion time of the last full cycle, epoch milliseconds.
    pub last_sync_at: Option<i64>,
    /// Most recent cycle error, if the last cycle failed.
    pub last_error: Option<String>,
    /// Time of the last successful push.
    pub last_push_at: Option<i64>,
    /// Time of the last successful pull attempt (including heartbeats).
    pub last_pull_at: Option<i64>,
    /// Most recent push error, cleared on push success.
    pub last_push_error: Option<String>,
    /// Most recent pull error, cleared on pull success.
    pub last_pull_error: Option<String>,
    /// True while automatic pulls are suspended after repeated network
    /// failures. Only a manual sync request lifts it.
    pub pull_suspended: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Disabled,
            last_sync_at: None,
            last_error: None,
            last_push_at: None,
            last_pull_at: None,
            last_push_error: None,
            last_pull_error: None,
            pull_suspended: false,
        }
    }
}

/// Writes status transitions to the state store and broadcasts them.
pub(crate) struct StatusReporter {
    store: Arc<dyn StateStore>,
    tx: watch::Sender<SyncStatus>,
}

impl StatusReporter {
    pub(crate) fn new(store: Arc<dyn StateStore>) -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { store, tx }
    }

    /// Applies a mutation, broadcasts the new status, and persists it.
    /// Persistence failures are logged, never propagated: a broken
    /// status record must not break sync.
    pub(crate) fn update(&self, mutate: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_modify(mutate);
        let status = self.tx.borrow().clone();
        match serde_json::to_string(&status) {
            Ok(json) => {
                if let Err(e) = self.store.set(STATUS_KEY, &json) {
                    warn!(error = %e, "failed to persist sync status");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize sync status"),
        }
    }

    pub(crate) fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
