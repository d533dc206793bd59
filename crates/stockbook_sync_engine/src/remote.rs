//! Remote replica boundary.
//!
//! The engine needs exactly four things from a remote store: read the
//! change marker, read the full row, write the row, and (optionally)
//! subscribe to change notifications. Any backend that can do those
//! can carry a sync space; the sync logic never sees anything else.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use stockbook_sync_protocol::RemoteRow;
use tokio::sync::mpsc;
use tracing::debug;

/// Events delivered by a realtime change subscription.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    /// The channel is established; background polling may slow down.
    Subscribed,
    /// The remote row was written (by any device).
    Change(RemoteRow),
    /// The channel failed; polling falls back to the short interval.
    ChannelError(String),
    /// The channel timed out; polling falls back to the short interval.
    TimedOut,
}

/// A remote replica holding one row per sync space.
#[async_trait]
pub trait RemoteReplica: Send + Sync {
    /// Reads only the server-maintained change marker for a space.
    /// Returns `None` when the row does not exist yet.
    async fn read_marker(&self, space_id: &str) -> SyncResult<Option<String>>;

    /// Reads the full row for a space.
    async fn read_row(&self, space_id: &str) -> SyncResult<Option<RemoteRow>>;

    /// Writes the row via upsert.
    async fn upsert_row(&self, row: &RemoteRow) -> SyncResult<()>;

    /// Writes the row via update-by-id. Fallback for backends that
    /// reject upsert syntax.
    async fn update_row(&self, row: &RemoteRow) -> SyncResult<()>;

    /// Writes the row via plain insert. Fallback for the first-ever
    /// sync when the row does not exist.
    async fn insert_row(&self, row: &RemoteRow) -> SyncResult<()>;

    /// Subscribes to change notifications for a space. `Ok(None)`
    /// means the backend has no realtime channel; the engine then
    /// relies purely on polling.
    async fn subscribe(&self, space_id: &str)
        -> SyncResult<Option<mpsc::Receiver<RealtimeEvent>>>;
}

/// Writes a row with the upsert → update → insert fallback chain.
///
/// Network-class failures abort the chain immediately (the caller's
/// retry loop owns those); application-level rejections fall through
/// to the next strategy.
pub async fn write_row_with_fallback(
    remote: &dyn RemoteReplica,
    row: &RemoteRow,
) -> SyncResult<()> {
    match remote.upsert_row(row).await {
        Ok(()) => return Ok(()),
        Err(e) if e.is_network() => return Err(e),
        Err(e) => debug!(error = %e, "upsert rejected, trying update"),
    }

    match remote.update_row(row).await {
        Ok(()) => return Ok(()),
        Err(e) if e.is_network() => return Err(e),
        Err(e) => debug!(error = %e, "update rejected, trying insert"),
    }

    remote.insert_row(row).await
}

/// An in-memory remote replica for tests.
///
/// Acts as the shared "server" between engines in integration tests:
/// counts calls, injects failures, gates operations, and broadcasts
/// realtime change events to subscribers.
#[derive(Default)]
pub struct MemoryRemote {
    row: Mutex<Option<RemoteRow>>,
    marker_seq: AtomicU64,
    marker_reads: AtomicU64,
    row_reads: AtomicU64,
    writes: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_next_reads: AtomicU64,
    fail_next_writes: AtomicU64,
    reject_upsert: AtomicBool,
    gated: AtomicBool,
    gate: tokio::sync::Notify,
    realtime: AtomicBool,
    subscribers: Mutex<Vec<mpsc::Sender<RealtimeEvent>>>,
}

impl MemoryRemote {
    /// Creates an empty remote with no row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables the realtime channel for future subscribers.
    pub fn enable_realtime(&self) {
        self.realtime.store(true, Ordering::SeqCst);
    }

    /// Makes every read fail with a network error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every write fail with a network error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes only the next `n` reads fail with a network error, so
    /// retry loops can be exercised against a transient outage.
    pub fn set_fail_next_reads(&self, n: u64) {
        self.fail_next_reads.store(n, Ordering::SeqCst);
    }

    /// Makes only the next `n` writes fail with a network error.
    pub fn set_fail_next_writes(&self, n: u64) {
        self.fail_next_writes.store(n, Ordering::SeqCst);
    }

    /// Makes upsert fail with an application-level rejection, so the
    /// write fallback chain is exercised.
    pub fn set_reject_upsert(&self, reject: bool) {
        self.reject_upsert.store(reject, Ordering::SeqCst);
    }

    /// Blocks every operation until [`MemoryRemote::open_gate`].
    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Releases operations blocked by the gate.
    pub fn open_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    /// Number of marker reads served (including failed ones).
    pub fn marker_reads(&self) -> u64 {
        self.marker_reads.load(Ordering::SeqCst)
    }

    /// Number of full row reads served.
    pub fn row_reads(&self) -> u64 {
        self.row_reads.load(Ordering::SeqCst)
    }

    /// Number of write attempts served (all three strategies).
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns the current row, if any.
    pub fn row(&self) -> Option<RemoteRow> {
        self.row.lock().clone()
    }

    /// Number of live realtime subscribers. Dead subscribers are only
    /// pruned when a broadcast fails to reach them.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Emits a channel error to all subscribers.
    pub fn emit_channel_error(&self, message: impl Into<String>) {
        let event = RealtimeEvent::ChannelError(message.into());
        self.broadcast(event);
    }

    async fn pass_gate(&self) {
        loop {
            if !self.gated.load(Ordering::SeqCst) {
                return;
            }
            // Register for the wakeup before re-checking the flag, so
            // an open_gate between the check and the await is not lost.
            let notified = self.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.gated.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn broadcast(&self, event: RealtimeEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    fn store_row(&self, row: &RemoteRow) {
        let seq = self.marker_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = row.clone();
        stored.updated_at = format!("m{seq}");
        *self.row.lock() = Some(stored.clone());
        self.broadcast(RealtimeEvent::Change(stored));
    }

    fn check_write(&self) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) || take_one(&self.fail_next_writes) {
            return Err(SyncError::network("connection refused"));
        }
        Ok(())
    }

    fn check_read(&self, what: &str) -> SyncResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) || take_one(&self.fail_next_reads) {
            return Err(SyncError::timeout(what));
        }
        Ok(())
    }
}

/// Decrements a failure budget, returning true while it lasts.
fn take_one(budget: &AtomicU64) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteReplica for MemoryRemote {
    async fn read_marker(&self, space_id: &str) -> SyncResult<Option<String>> {
        self.pass_gate().await;
        self.marker_reads.fetch_add(1, Ordering::SeqCst);
        self.check_read("marker read")?;
        Ok(self
            .row
            .lock()
            .as_ref()
            .filter(|row| row.id == space_id)
            .map(|row| row.updated_at.clone()))
    }

    async fn read_row(&self, space_id: &str) -> SyncResult<Option<RemoteRow>> {
        self.pass_gate().await;
        self.row_reads.fetch_add(1, Ordering::SeqCst);
        self.check_read("row read")?;
        Ok(self
            .row
            .lock()
            .clone()
            .filter(|row| row.id == space_id))
    }

    async fn upsert_row(&self, row: &RemoteRow) -> SyncResult<()> {
        self.pass_gate().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        if self.reject_upsert.load(Ordering::SeqCst) {
            return Err(SyncError::Query("upsert syntax not supported".into()));
        }
        self.store_row(row);
        Ok(())
    }

    async fn update_row(&self, row: &RemoteRow) -> SyncResult<()> {
        self.pass_gate().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        let exists = self
            .row
            .lock()
            .as_ref()
            .is_some_and(|existing| existing.id == row.id);
        if !exists {
            return Err(SyncError::Query("no row to update".into()));
        }
        self.store_row(row);
        Ok(())
    }

    async fn insert_row(&self, row: &RemoteRow) -> SyncResult<()> {
        self.pass_gate().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        if self.row.lock().is_some() {
            return Err(SyncError::Query("duplicate row".into()));
        }
        self.store_row(row);
        Ok(())
    }

    async fn subscribe(
        &self,
        _space_id: &str,
    ) -> SyncResult<Option<mpsc::Receiver<RealtimeEvent>>> {
        if !self.realtime.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let (tx, rx) = mpsc::channel(32);
        // The channel comes up immediately in the mock.
        let _ = tx.try_send(RealtimeEvent::Subscribed);
        self.subscribers.lock().push(tx);
        Ok(Some(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(space: &str) -> RemoteRow {
        RemoteRow::new(space, "{}")
    }

    #[tokio::test]
    async fn marker_advances_on_every_write() {
        let remote = MemoryRemote::new();
        assert_eq!(remote.read_marker("s").await.unwrap(), None);

        remote.upsert_row(&row("s")).await.unwrap();
        let first = remote.read_marker("s").await.unwrap().unwrap();

        remote.upsert_row(&row("s")).await.unwrap();
        let second = remote.read_marker("s").await.unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn fallback_chain_survives_upsert_rejection() {
        let remote = MemoryRemote::new();
        remote.set_reject_upsert(true);

        // No row yet: upsert rejected, update finds nothing, insert wins.
        write_row_with_fallback(&remote, &row("s")).await.unwrap();
        assert!(remote.row().is_some());
        assert_eq!(remote.writes(), 3);

        // Row exists: upsert rejected, update wins.
        write_row_with_fallback(&remote, &row("s")).await.unwrap();
        assert_eq!(remote.writes(), 5);
    }

    #[tokio::test]
    async fn fallback_chain_stops_on_network_failure() {
        let remote = MemoryRemote::new();
        remote.set_fail_writes(true);

        let result = write_row_with_fallback(&remote, &row("s")).await;
        assert!(matches!(result, Err(SyncError::Network { .. })));
        // Network failures abort; only the upsert was attempted.
        assert_eq!(remote.writes(), 1);
    }

    #[tokio::test]
    async fn subscription_delivers_changes() {
        let remote = MemoryRemote::new();
        remote.enable_realtime();

        let mut rx = remote.subscribe("s").await.unwrap().unwrap();
        assert!(matches!(rx.recv().await, Some(RealtimeEvent::Subscribed)));

        remote.upsert_row(&row("s")).await.unwrap();
        match rx.recv().await {
            Some(RealtimeEvent::Change(changed)) => assert_eq!(changed.id, "s"),
            other => panic!("expected change event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscription_disabled_by_default() {
        let remote = MemoryRemote::new();
        assert!(remote.subscribe("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_read_failures_expire() {
        let remote = MemoryRemote::new();
        remote.upsert_row(&row("s")).await.unwrap();
        remote.set_fail_next_reads(2);

        assert!(remote.read_marker("s").await.unwrap_err().is_network());
        assert!(remote.read_row("s").await.unwrap_err().is_network());
        // Budget spent: the third read succeeds.
        assert!(remote.read_marker("s").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn transient_write_failures_expire() {
        let remote = MemoryRemote::new();
        remote.set_fail_next_writes(1);

        assert!(remote.upsert_row(&row("s")).await.unwrap_err().is_network());
        remote.upsert_row(&row("s")).await.unwrap();
        assert!(remote.row().is_some());
    }

    #[tokio::test]
    async fn gate_blocks_and_releases() {
        let remote = std::sync::Arc::new(MemoryRemote::new());

        for _ in 0..2 {
            remote.close_gate();

            let reader = {
                let remote = remote.clone();
                tokio::spawn(async move { remote.read_marker("s").await })
            };
            tokio::task::yield_now().await;
            assert!(!reader.is_finished());

            remote.open_gate();
            reader.await.unwrap().unwrap();
        }
    }
}
