//! Background sync service.
//!
//! Owns one engine on a spawned task and drives it from three sources:
//! a poll ticker, embedder triggers (local edits, foreground, explicit
//! sync-now), and the remote's realtime channel when it has one. At
//! most one cycle runs at a time; triggers that arrive mid-cycle are
//! coalesced into a single trailing rerun.

use crate::config::SyncConfig;
use crate::engine::{PullKind, SyncEngine};
use crate::error::SyncResult;
use crate::remote::{RealtimeEvent, RemoteReplica};
use crate::state::{StatusReporter, SyncStatus};
use crate::store::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A reason to run a sync cycle outside the regular poll schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The embedder wrote tracked local state.
    LocalMutation,
    /// The application returned to the foreground.
    Foreground,
    /// An explicit user request. Also lifts pull suspension.
    SyncNow,
    /// Stop the service after a best-effort final push.
    Shutdown,
}

/// Starts and owns the background sync task.
pub struct SyncService;

impl SyncService {
    /// Starts the sync service.
    ///
    /// With an incomplete configuration the service starts disabled:
    /// the status records [`SyncState::Disabled`], no task is spawned,
    /// and every handle operation is a no-op.
    pub fn start(
        config: SyncConfig,
        store: Arc<dyn StateStore>,
        remote: Arc<dyn RemoteReplica>,
    ) -> SyncResult<SyncHandle> {
        if !config.is_enabled() {
            info!("sync disabled: configuration incomplete");
            let reporter = StatusReporter::new(store);
            reporter.update(|s| *s = SyncStatus::default());
            let status_rx = reporter.subscribe();
            let (changes_tx, changes_rx) = watch::channel(0u64);
            return Ok(SyncHandle {
                engine: None,
                triggers: None,
                status_rx,
                changes_rx,
                task: None,
                _idle: Some(IdleChannels {
                    _reporter: reporter,
                    _changes: changes_tx,
                }),
            });
        }

        let engine = Arc::new(SyncEngine::new(config, store, remote)?);
        let status_rx = engine.subscribe_status();
        let changes_rx = engine.subscribe_changes();
        let (triggers_tx, triggers_rx) = mpsc::channel(32);
        let task = tokio::spawn(run_loop(Arc::clone(&engine), triggers_rx));

        Ok(SyncHandle {
            engine: Some(engine),
            triggers: Some(triggers_tx),
            status_rx,
            changes_rx,
            task: Some(task),
            _idle: None,
        })
    }
}

/// Keeps a disabled handle's channels alive.
struct IdleChannels {
    _reporter: StatusReporter,
    _changes: watch::Sender<u64>,
}

/// Handle to a running (or disabled) sync service.
pub struct SyncHandle {
    engine: Option<Arc<SyncEngine>>,
    triggers: Option<mpsc::Sender<Trigger>>,
    status_rx: watch::Receiver<SyncStatus>,
    changes_rx: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
    _idle: Option<IdleChannels>,
}

impl SyncHandle {
    /// Returns false when the service started disabled.
    pub fn is_enabled(&self) -> bool {
        self.engine.is_some()
    }

    /// Returns the current status projection.
    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribes to status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Subscribes to change notifications emitted after remote merges.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes_rx.clone()
    }

    /// Tells the service that tracked local state was written. Writes
    /// performed by the engine's own merge are ignored, so merges do
    /// not re-trigger sync.
    pub fn notify_local_change(&self) {
        if let Some(engine) = &self.engine {
            if engine.is_applying_remote() {
                return;
            }
        }
        self.send(Trigger::LocalMutation);
    }

    /// Tells the service the application returned to the foreground.
    pub fn notify_foreground(&self) {
        self.send(Trigger::Foreground);
    }

    /// Requests an immediate cycle, lifting pull suspension.
    pub fn sync_now(&self) {
        self.send(Trigger::SyncNow);
    }

    /// Stops the service after a best-effort final push.
    pub async fn stop(mut self) {
        if let Some(triggers) = self.triggers.take() {
            let _ = triggers.send(Trigger::Shutdown).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, trigger: Trigger) {
        if let Some(triggers) = &self.triggers {
            // A full queue already guarantees a follow-up cycle.
            if triggers.try_send(trigger).is_err() {
                debug!(?trigger, "trigger queue full, coalesced");
            }
        }
    }
}

async fn run_loop(engine: Arc<SyncEngine>, mut triggers: mpsc::Receiver<Trigger>) {
    engine.bootstrap().await;

    let mut realtime = engine.subscribe_realtime().await;
    // The short interval applies until the realtime channel reports
    // itself subscribed.
    let mut ticker = make_ticker(engine.config().fallback_poll_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if realtime.is_none() {
                    realtime = engine.subscribe_realtime().await;
                }
                engine.cycle(false).await;
                if drain_then_rerun(&engine, &mut triggers).await {
                    break;
                }
            }
            trigger = triggers.recv() => {
                let Some(trigger) = trigger else {
                    // Handle dropped without stop(): exit quietly.
                    break;
                };
                if trigger == Trigger::Shutdown {
                    engine.shutdown_flush().await;
                    break;
                }
                engine.cycle(trigger == Trigger::SyncNow).await;
                if drain_then_rerun(&engine, &mut triggers).await {
                    break;
                }
            }
            event = next_event(&mut realtime) => {
                match event {
                    Some(RealtimeEvent::Subscribed) => {
                        debug!("realtime channel subscribed, slowing poll");
                        ticker = make_ticker(engine.config().poll_interval);
                    }
                    Some(RealtimeEvent::Change(_)) => {
                        engine.pull(PullKind::Realtime).await;
                        engine.finish_cycle();
                    }
                    Some(RealtimeEvent::ChannelError(message)) => {
                        warn!(message, "realtime channel failed, falling back to polling");
                        realtime = None;
                        ticker = make_ticker(engine.config().fallback_poll_interval);
                    }
                    Some(RealtimeEvent::TimedOut) => {
                        warn!("realtime channel timed out, falling back to polling");
                        realtime = None;
                        ticker = make_ticker(engine.config().fallback_poll_interval);
                    }
                    None => {
                        realtime = None;
                        ticker = make_ticker(engine.config().fallback_poll_interval);
                    }
                }
            }
        }
    }
}

/// Drains triggers queued during the cycle that just ran. Any queued
/// work collapses into at most one trailing cycle. Returns true when a
/// shutdown was drained.
async fn drain_then_rerun(engine: &SyncEngine, triggers: &mut mpsc::Receiver<Trigger>) -> bool {
    let mut rerun = false;
    let mut manual = false;
    while let Ok(trigger) = triggers.try_recv() {
        match trigger {
            Trigger::Shutdown => {
                engine.shutdown_flush().await;
                return true;
            }
            Trigger::SyncNow => {
                rerun = true;
                manual = true;
            }
            Trigger::LocalMutation | Trigger::Foreground => rerun = true,
        }
    }
    if rerun {
        engine.cycle(manual).await;
    }
    false
}

async fn next_event(realtime: &mut Option<mpsc::Receiver<RealtimeEvent>>) -> Option<RealtimeEvent> {
    match realtime {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Bootstrap already synced, so the first tick waits a full period.
fn make_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::remote::MemoryRemote;
    use crate::state::SyncState;
    use crate::store::MemoryStateStore;
    use stockbook_sync_protocol::{RemoteRow, RemoteSnapshot};

    fn quiet_config() -> SyncConfig {
        // Long intervals keep the ticker out of trigger-driven tests.
        SyncConfig::new("space-1", "memory://", "test-key")
            .with_poll_interval(Duration::from_secs(600))
            .with_fallback_poll_interval(Duration::from_secs(600))
            .with_pull_cooldown(Duration::ZERO)
            .with_push_retry(RetryConfig::no_retry())
            .with_pull_retry(RetryConfig::no_retry())
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn disabled_config_starts_disabled_and_noops() {
        let store = Arc::new(MemoryStateStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let handle = SyncService::start(
            SyncConfig::new("space-1", "", ""),
            store,
            remote.clone(),
        )
        .unwrap();

        assert!(!handle.is_enabled());
        assert_eq!(handle.status().state, SyncState::Disabled);

        handle.notify_local_change();
        handle.sync_now();
        handle.stop().await;

        assert_eq!(remote.marker_reads(), 0);
        assert_eq!(remote.writes(), 0);
    }

    #[tokio::test]
    async fn local_mutation_trigger_pushes() {
        let store = Arc::new(MemoryStateStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let handle = SyncService::start(quiet_config(), store.clone(), remote.clone()).unwrap();

        assert!(wait_until(|| handle.status().state == SyncState::Connected).await);

        store.set("items", "[{\"id\":\"1\",\"qty\":4}]").unwrap();
        handle.notify_local_change();

        assert!(
            wait_until(|| remote
                .row()
                .is_some_and(|row| row.payload.contains("\"qty\":4")))
            .await
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn queued_triggers_coalesce_into_one_rerun() {
        let store = Arc::new(MemoryStateStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let handle = SyncService::start(quiet_config(), store.clone(), remote.clone()).unwrap();

        assert!(wait_until(|| handle.status().state == SyncState::Connected).await);
        let after_bootstrap = remote.marker_reads();

        // Block the first triggered cycle mid-pull, queue a burst of
        // further triggers behind it, then release.
        remote.close_gate();
        handle.notify_local_change();
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..5 {
            handle.notify_local_change();
        }
        remote.open_gate();

        // The burst collapses into exactly one trailing cycle.
        assert!(wait_until(|| remote.marker_reads() == after_bootstrap + 2).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.marker_reads(), after_bootstrap + 2);
        handle.stop().await;
    }

    #[tokio::test]
    async fn realtime_change_is_pulled() {
        let remote = Arc::new(MemoryRemote::new());
        remote.enable_realtime();

        let store_a = Arc::new(MemoryStateStore::new());
        let store_b = Arc::new(MemoryStateStore::new());
        let a = SyncService::start(quiet_config(), store_a.clone(), remote.clone()).unwrap();
        let b = SyncService::start(quiet_config(), store_b.clone(), remote.clone()).unwrap();

        assert!(wait_until(|| a.status().state == SyncState::Connected).await);
        assert!(wait_until(|| b.status().state == SyncState::Connected).await);

        store_a.set("settings", "{\"currency\":\"EUR\"}").unwrap();
        a.notify_local_change();

        // B learns about the change from the realtime channel, not a
        // poll (both poll intervals are ten minutes).
        assert!(
            wait_until(|| {
                store_b
                    .get("settings")
                    .unwrap()
                    .is_some_and(|v| v.contains("EUR"))
            })
            .await
        );

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn channel_failure_falls_back_to_polling_and_resubscribes() {
        let remote = Arc::new(MemoryRemote::new());
        remote.enable_realtime();

        // Realtime healthy means a ten minute poll; degraded polling
        // is fast enough to observe.
        let config = quiet_config().with_fallback_poll_interval(Duration::from_millis(50));
        let store = Arc::new(MemoryStateStore::new());
        let handle = SyncService::start(config, store.clone(), remote.clone()).unwrap();

        assert!(wait_until(|| handle.status().state == SyncState::Connected).await);
        assert!(wait_until(|| remote.subscriber_count() == 1).await);

        remote.emit_channel_error("socket closed");

        // An external edit lands while the channel is down; the short
        // fallback poll still picks it up.
        let external = RemoteSnapshot::new(
            1_700_000_000_000,
            "device-ext".into(),
            "0.3.0",
            [("settings".to_string(), "{\"currency\":\"EUR\"}".to_string())].into(),
        );
        remote
            .upsert_row(&RemoteRow::new("space-1", external.to_json().unwrap()))
            .await
            .unwrap();

        assert!(
            wait_until(|| {
                store
                    .get("settings")
                    .unwrap()
                    .is_some_and(|v| v.contains("EUR"))
            })
            .await
        );
        // The poll that converged also resubscribed the channel (the
        // dead subscriber was pruned by the broadcast above).
        assert_eq!(remote.subscriber_count(), 1);

        // The restored channel delivers changes again, even though the
        // healthy poll interval is ten minutes.
        let newer = RemoteSnapshot::new(
            1_700_000_000_001,
            "device-ext".into(),
            "0.3.0",
            [("settings".to_string(), "{\"currency\":\"GBP\"}".to_string())].into(),
        );
        remote
            .upsert_row(&RemoteRow::new("space-1", newer.to_json().unwrap()))
            .await
            .unwrap();
        assert!(
            wait_until(|| {
                store
                    .get("settings")
                    .unwrap()
                    .is_some_and(|v| v.contains("GBP"))
            })
            .await
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_flushes_pending_local_changes() {
        let store = Arc::new(MemoryStateStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let handle = SyncService::start(quiet_config(), store.clone(), remote.clone()).unwrap();

        assert!(wait_until(|| handle.status().state == SyncState::Connected).await);

        store.set("categories", "[\"tools\"]").unwrap();
        handle.stop().await;

        let row = remote.row().unwrap();
        assert!(row.payload.contains("tools"));
    }

    #[tokio::test]
    async fn sync_now_recovers_from_suspension() {
        let config = quiet_config().with_suspend_after(1);
        let store = Arc::new(MemoryStateStore::new());
        let remote = Arc::new(MemoryRemote::new());
        remote.set_fail_reads(true);

        let handle = SyncService::start(config, store, remote.clone()).unwrap();
        assert!(wait_until(|| handle.status().pull_suspended).await);

        remote.set_fail_reads(false);
        handle.sync_now();
        assert!(
            wait_until(|| {
                let status = handle.status();
                !status.pull_suspended && status.state == SyncState::Connected
            })
            .await
        );
        handle.stop().await;
    }
}
