//! The sync engine: push and pull pipelines over one sync space.
//!
//! All engine state lives on the instance (confirmed signature, seen
//! marker, backoff, the applying-remote flag), so one process can run
//! independent engines for independent sync spaces. No error escapes
//! [`SyncEngine::cycle`]; every failure is captured into the status
//! projection instead.

use crate::backoff::PullBackoff;
use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::merge;
use crate::remote::{write_row_with_fallback, RealtimeEvent, RemoteReplica};
use crate::signature::signature;
use crate::state::{now_ms, StatusReporter, SyncState, SyncStatus};
use crate::store::{load_or_create_device_id, read_snapshot, StateStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use stockbook_sync_protocol::{is_tracked, DeviceId, RemoteRow, RemoteSnapshot, TRACKED_PARTITIONS};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// What initiated a pull attempt. Backoff cooldown and suspension gate
/// polled pulls only; realtime and manual pulls always run (manual
/// additionally resets the backoff before the cycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullKind {
    /// Timer-driven background pull.
    Polled,
    /// Pull prompted by a realtime change notification.
    Realtime,
    /// Explicit user request.
    Manual,
}

/// The state-synchronization engine for one sync space.
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn StateStore>,
    remote: Arc<dyn RemoteReplica>,
    device_id: DeviceId,
    reporter: StatusReporter,
    /// Signature last known to be consistent with the remote.
    confirmed_signature: Mutex<Option<String>>,
    /// Last remote change marker observed by a pull.
    last_seen_marker: Mutex<Option<String>>,
    /// Set while merge writes are in flight, so the engine's own
    /// writes are not mistaken for local edits.
    applying_remote: AtomicBool,
    backoff: Mutex<PullBackoff>,
    /// Bumped after every applied merge so consumers re-read state.
    changes: watch::Sender<u64>,
}

impl SyncEngine {
    /// Creates an engine. Fails with [`SyncError::Config`] when the
    /// configuration is incomplete and with [`SyncError::Store`] when
    /// the device identity cannot be loaded or created.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn StateStore>,
        remote: Arc<dyn RemoteReplica>,
    ) -> SyncResult<Self> {
        if !config.is_enabled() {
            return Err(SyncError::Config(
                "missing sync endpoint, credentials, or space id".into(),
            ));
        }
        let device_id = load_or_create_device_id(store.as_ref())?;
        let reporter = StatusReporter::new(Arc::clone(&store));
        let (changes, _rx) = watch::channel(0u64);

        Ok(Self {
            config,
            store,
            remote,
            device_id,
            reporter,
            confirmed_signature: Mutex::new(None),
            last_seen_marker: Mutex::new(None),
            applying_remote: AtomicBool::new(false),
            backoff: Mutex::new(PullBackoff::new()),
            changes,
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns this device's identity.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Returns the current status projection.
    pub fn status(&self) -> SyncStatus {
        self.reporter.current()
    }

    /// Subscribes to status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.reporter.subscribe()
    }

    /// Subscribes to local-change notifications emitted after merges.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// True while the engine is writing a remote merge into the store.
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.load(Ordering::SeqCst)
    }

    /// First contact after start: pull before push, so a restarted
    /// engine re-derives its confirmed signature from the remote
    /// instead of clobbering the row with possibly stale local state.
    pub async fn bootstrap(&self) {
        self.reporter.update(|s| s.state = SyncState::Connecting);
        self.pull(PullKind::Polled).await;
        self.push().await;
        self.finish_cycle();
    }

    /// Runs one push-then-pull cycle. A manual cycle first clears
    /// backoff and suspension.
    pub async fn cycle(&self, manual: bool) {
        if manual {
            self.backoff.lock().reset();
            self.reporter.update(|s| s.pull_suspended = false);
        }
        self.push().await;
        self.pull(if manual {
            PullKind::Manual
        } else {
            PullKind::Polled
        })
        .await;
        self.finish_cycle();
    }

    /// Explicit "sync now": clears backoff/suspension and runs a cycle.
    pub async fn sync_now(&self) {
        self.cycle(true).await;
    }

    /// Best-effort final push on shutdown.
    pub async fn shutdown_flush(&self) {
        self.push().await;
    }

    /// Pushes the local snapshot if it differs from the last confirmed
    /// signature. Never returns an error; failures land in the status.
    pub async fn push(&self) {
        if self.is_applying_remote() {
            debug!("push skipped: remote merge in progress");
            return;
        }

        let snapshot = match read_snapshot(self.store.as_ref()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "push aborted: state store unreadable");
                self.reporter
                    .update(|s| s.last_push_error = Some(e.to_string()));
                return;
            }
        };

        let local_sig = signature(&snapshot);
        if self.confirmed_signature.lock().as_deref() == Some(local_sig.as_str()) {
            debug!("push skipped: no local changes since last confirmed sync");
            return;
        }

        let remote_snapshot = RemoteSnapshot::new(
            now_ms(),
            self.device_id.clone(),
            self.config.app_version.as_str(),
            snapshot,
        );
        let payload = match remote_snapshot.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.reporter.update(|s| {
                    s.last_push_error = Some(format!("snapshot serialization failed: {e}"))
                });
                return;
            }
        };
        let row = RemoteRow::new(self.config.space_id.clone(), payload);

        let result = self
            .retried(&self.config.push_retry, || {
                let row = row.clone();
                async move { write_row_with_fallback(self.remote.as_ref(), &row).await }
            })
            .await;

        match result {
            Ok(()) => {
                *self.confirmed_signature.lock() = Some(local_sig);
                self.reporter.update(|s| {
                    s.last_push_at = Some(now_ms());
                    s.last_push_error = None;
                });
                info!("pushed local snapshot");
            }
            Err(e) => {
                // Confirmed signature stays untouched so the next
                // cycle retries the same diff.
                warn!(error = %e, "push failed");
                self.reporter
                    .update(|s| s.last_push_error = Some(e.to_string()));
            }
        }
    }

    /// Pulls and merges the remote snapshot if the remote changed.
    /// Never returns an error; failures land in the status.
    pub async fn pull(&self, kind: PullKind) {
        if kind == PullKind::Polled && self.backoff.lock().should_skip(Instant::now()) {
            debug!("pull skipped: cooldown or suspension");
            return;
        }

        let snapshot = match read_snapshot(self.store.as_ref()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "pull aborted: state store unreadable");
                self.reporter
                    .update(|s| s.last_pull_error = Some(e.to_string()));
                return;
            }
        };
        let local_sig = signature(&snapshot);

        // Push-before-pull: never let a pull overwrite local edits
        // that have not been pushed yet.
        if let Some(confirmed) = self.confirmed_signature.lock().as_ref() {
            if *confirmed != local_sig {
                debug!("pull skipped: unpushed local changes");
                return;
            }
        }

        let marker = match self
            .retried(&self.config.pull_retry, || async move {
                self.remote.read_marker(&self.config.space_id).await
            })
            .await
        {
            Ok(marker) => marker,
            Err(e) => {
                self.record_pull_failure(&e);
                return;
            }
        };
        self.backoff.lock().record_success();

        let Some(marker) = marker else {
            // No remote row yet: nothing to pull on first-ever sync.
            self.mark_pull_ok();
            return;
        };

        if self.last_seen_marker.lock().as_deref() == Some(marker.as_str()) {
            // Cheap heartbeat: remote unchanged.
            self.mark_pull_ok();
            return;
        }

        let row = match self
            .retried(&self.config.pull_retry, || async move {
                self.remote.read_row(&self.config.space_id).await
            })
            .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.mark_pull_ok();
                return;
            }
            Err(e) => {
                self.record_pull_failure(&e);
                return;
            }
        };

        let remote_snapshot = match row.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "remote payload unreadable, local state untouched");
                self.reporter.update(|s| {
                    s.last_pull_error = Some(format!("unreadable remote payload: {e}"))
                });
                return;
            }
        };

        // Our own last push coming back around: confirm the marker
        // without a spurious merge.
        if remote_snapshot.updated_by == self.device_id
            && signature(&remote_snapshot.values) == local_sig
        {
            *self.last_seen_marker.lock() = Some(marker);
            *self.confirmed_signature.lock() = Some(local_sig);
            self.mark_pull_ok();
            return;
        }

        match self.apply_remote(&snapshot, &remote_snapshot.values) {
            Ok(()) => {
                // Confirmed tracks what the remote row now holds. When
                // the merge kept newer local records, the local state
                // no longer matches it and the next push uploads the
                // merged union.
                let tracked_remote: BTreeMap<String, String> = remote_snapshot
                    .values
                    .iter()
                    .filter(|(key, _)| is_tracked(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                *self.confirmed_signature.lock() = Some(signature(&tracked_remote));
                *self.last_seen_marker.lock() = Some(marker);
                self.mark_pull_ok();
                self.changes.send_modify(|n| *n += 1);
                info!(updated_by = %remote_snapshot.updated_by, "merged remote snapshot");
            }
            Err(e) => {
                warn!(error = %e, "merge failed, local state untouched");
                self.reporter
                    .update(|s| s.last_pull_error = Some(e.to_string()));
            }
        }
    }

    /// Subscribes to the remote's realtime channel, if it has one.
    pub async fn subscribe_realtime(&self) -> Option<mpsc::Receiver<RealtimeEvent>> {
        match self.remote.subscribe(&self.config.space_id).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "realtime subscription failed");
                None
            }
        }
    }

    /// Resolves the merge fully in memory, then applies it under the
    /// applying-remote flag.
    fn apply_remote(
        &self,
        local: &BTreeMap<String, String>,
        remote_values: &BTreeMap<String, String>,
    ) -> SyncResult<()> {
        let merged = merge::resolve(local, remote_values)?;

        self.applying_remote.store(true, Ordering::SeqCst);
        let written = (|| {
            for key in TRACKED_PARTITIONS {
                match merged.get(*key) {
                    Some(value) => self.store.set(key, value)?,
                    None => {
                        if local.contains_key(*key) {
                            self.store.remove(key)?;
                        }
                    }
                }
            }
            Ok(())
        })();
        self.applying_remote.store(false, Ordering::SeqCst);
        written
    }

    /// Marks a finished cycle in the status projection.
    pub(crate) fn finish_cycle(&self) {
        self.reporter.update(|s| {
            s.last_sync_at = Some(now_ms());
            match s.last_push_error.clone().or_else(|| s.last_pull_error.clone()) {
                Some(error) => {
                    s.state = SyncState::Error;
                    s.last_error = Some(error);
                }
                None => {
                    s.state = SyncState::Connected;
                    s.last_error = None;
                }
            }
        });
    }

    fn mark_pull_ok(&self) {
        let suspended = self.backoff.lock().is_suspended();
        self.reporter.update(|s| {
            s.last_pull_at = Some(now_ms());
            s.last_pull_error = None;
            s.pull_suspended = suspended;
        });
    }

    fn record_pull_failure(&self, error: &SyncError) {
        let mut crossed_threshold = false;
        let suspended;
        {
            let mut backoff = self.backoff.lock();
            if error.is_network() {
                crossed_threshold = backoff
                    .record_network_failure(self.config.pull_cooldown, self.config.suspend_after);
            }
            suspended = backoff.is_suspended();
        }
        if crossed_threshold {
            warn!(
                threshold = self.config.suspend_after,
                "automatic pulls suspended after repeated network failures"
            );
        }
        self.reporter.update(|s| {
            s.last_pull_error = Some(error.to_string());
            s.pull_suspended = suspended;
        });
    }

    /// Runs a network call with the configured per-call timeout,
    /// retrying network-class failures with linearly increasing delay.
    async fn retried<T, F, Fut>(&self, retry: &RetryConfig, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut last: Option<SyncError> = None;
        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            }
            let result = match tokio::time::timeout(self.config.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::timeout("remote call exceeded its deadline")),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_network() && attempt + 1 < retry.max_attempts => {
                    debug!(error = %e, attempt, "network failure, retrying");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| SyncError::network("no attempts made")))
    }
}
