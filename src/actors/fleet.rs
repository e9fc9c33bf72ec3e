//! FleetMonitorActor - periodic supervision of one fleet
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → fetch → drift (load / observe / save) → battery watch
//!            → suspected offline → double-check → spawn recovery sweep
//!     ↑
//!     └─── Commands (PollNow, AwaitSweep, Shutdown)
//! ```
//!
//! At most one recovery sweep runs per fleet. While it is in flight, later
//! cycles still evaluate drift and battery but skip the recovery stage.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::FleetSnapshot;
use crate::alerts::{Notifier, format_battery_message, format_drift_message, format_offline_summary};
use crate::client::ManagementApi;
use crate::config::ResolvedFleetConfig;
use crate::monitors::battery::BatteryWatch;
use crate::monitors::double_check::DoubleCheckGate;
use crate::monitors::drift::{DriftDetector, DriftOutcome, DriftState, RestartPolicy};
use crate::monitors::health::HealthClassifier;
use crate::storage::{StateStore, StorageError};

use super::messages::{CycleReport, FleetCommand};
use super::recovery::{RecoveryOrchestrator, SweepReport};

/// Actor that supervises a single fleet
pub struct FleetMonitorActor {
    config: ResolvedFleetConfig,
    api: Arc<dyn ManagementApi>,
    notifier: Arc<dyn Notifier>,
    state_store: Arc<dyn StateStore>,
    classifier: Arc<dyn HealthClassifier>,
    detector: DriftDetector,
    gate: DoubleCheckGate,
    battery: Option<BatteryWatch>,
    command_rx: mpsc::Receiver<FleetCommand>,
    /// Recovery sweep started by an earlier cycle
    sweep: Option<JoinHandle<SweepReport>>,
}

impl FleetMonitorActor {
    pub fn new(
        config: ResolvedFleetConfig,
        api: Arc<dyn ManagementApi>,
        notifier: Arc<dyn Notifier>,
        state_store: Arc<dyn StateStore>,
        command_rx: mpsc::Receiver<FleetCommand>,
    ) -> Self {
        Self {
            classifier: config.health_policy.classifier(),
            detector: DriftDetector::new(config.drift_window, config.drift_restart),
            gate: DoubleCheckGate::new(config.double_check),
            battery: config.battery_threshold.map(BatteryWatch::new),
            config,
            api,
            notifier,
            state_store,
            command_rx,
            sweep: None,
        }
    }

    /// Run the actor's main loop until Shutdown or until every handle is dropped
    #[instrument(skip(self), fields(fleet = %self.config.id))]
    pub async fn run(mut self) {
        debug!("starting fleet monitor");

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("monitoring cycle failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        FleetCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let result = self.run_cycle().await;
                            let _ = respond_to.send(result);
                        }

                        FleetCommand::AwaitSweep { respond_to } => {
                            let report = self.join_sweep().await;
                            let _ = respond_to.send(report);
                        }

                        FleetCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        if let Some(sweep) = self.sweep.take() {
            if !sweep.is_finished() {
                warn!("aborting unfinished recovery sweep");
            }
            sweep.abort();
        }
        debug!("fleet monitor stopped");
    }

    /// Single cycle without the timer; waits for the sweep it started
    #[instrument(skip(self), fields(fleet = %self.config.id))]
    pub async fn run_once(mut self) -> Result<(CycleReport, Option<SweepReport>)> {
        let report = self.run_cycle().await?;
        let sweep = self.join_sweep().await;
        Ok((report, sweep))
    }

    /// One full monitoring cycle. A failed fetch skips the cycle and leaves
    /// the drift state untouched.
    #[instrument(skip(self), fields(fleet = %self.config.id))]
    async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.reap_sweep().await;

        let snapshot = self
            .api
            .fetch()
            .await
            .context("failed to fetch fleet status")?;

        let drift = self.evaluate_drift(&snapshot).await;
        let low_battery = self.check_battery(&snapshot).await;

        let suspected = DoubleCheckGate::provisional(&snapshot, self.classifier.as_ref());
        let mut report = CycleReport {
            device_count: snapshot.len(),
            drift,
            low_battery,
            suspected: suspected.len(),
            confirmed: vec![],
            sweep_started: false,
        };

        if suspected.is_empty() {
            debug!("all {} devices alive", snapshot.len());
            return Ok(report);
        }

        if self.sweep.is_some() {
            info!("recovery sweep still running, skipping recovery this cycle");
            return Ok(report);
        }

        let confirmed = self
            .gate
            .run(self.api.as_ref(), self.classifier.as_ref(), suspected)
            .await
            .context("double-check poll failed")?;

        if confirmed.is_empty() {
            info!("suspected devices recovered on their own");
            return Ok(report);
        }

        let summary = format_offline_summary(&self.config.name, &confirmed);
        warn!("{summary}");
        self.notifier.notify(&summary).await;

        report.confirmed = confirmed.iter().filter_map(|d| d.id.clone()).collect();
        report.sweep_started = true;

        let orchestrator = RecoveryOrchestrator::new(
            self.api.clone(),
            self.notifier.clone(),
            self.classifier.clone(),
            self.config.settle,
            self.config.name.clone(),
        );
        self.sweep = Some(tokio::spawn(async move { orchestrator.sweep(confirmed).await }));

        Ok(report)
    }

    /// Load, observe and persist. `None` when the state could not be read;
    /// nothing is observed or written then, so a pending drift survives
    /// until the store answers again. Save failures are logged and the
    /// decision is re-derived next cycle.
    async fn evaluate_drift(&self, snapshot: &FleetSnapshot) -> Option<DriftOutcome> {
        let fleet_id = &self.config.id;

        let mut state = match self.state_store.load(fleet_id).await {
            Ok(state) => state,
            Err(e @ (StorageError::SerializationError(_) | StorageError::Corrupt(_))) => {
                error!("drift state is unreadable, starting over: {e}");
                DriftState::default()
            }
            Err(e) => {
                warn!("failed to load drift state, skipping drift check: {e}");
                return None;
            }
        };
        let before = state.clone();

        let outcome = self.detector.observe(&mut state, snapshot.len() as u64, Utc::now());
        log_drift(&outcome, self.config.drift_restart);

        if state != before {
            if let Err(e) = self.state_store.save(fleet_id, &state).await {
                error!("failed to persist drift state: {e}");
            }
        }

        if let DriftOutcome::Confirmed(drift) = &outcome {
            let message = format_drift_message(&self.config.name, fleet_id, &self.config.server_name, drift);
            self.notifier.notify(&message).await;
        }

        Some(outcome)
    }

    async fn check_battery(&mut self, snapshot: &FleetSnapshot) -> usize {
        let Some(watch) = self.battery.as_mut() else {
            return 0;
        };

        let low = watch.evaluate(snapshot);
        for device in &low {
            let message = format_battery_message(&self.config.name, device);
            warn!("{message}");
            self.notifier.notify(&message).await;
        }
        low.len()
    }

    /// Log and clear a sweep that finished since the last cycle
    async fn reap_sweep(&mut self) {
        if self.sweep.as_ref().is_some_and(JoinHandle::is_finished) {
            self.join_sweep().await;
        }
    }

    async fn join_sweep(&mut self) -> Option<SweepReport> {
        let sweep = self.sweep.take()?;
        match sweep.await {
            Ok(report) => {
                info!("previous recovery sweep: {report}");
                Some(report)
            }
            Err(e) => {
                error!("recovery sweep task failed: {e}");
                None
            }
        }
    }
}

fn log_drift(outcome: &DriftOutcome, restart: RestartPolicy) {
    let message = describe_drift(outcome, restart);
    match outcome {
        DriftOutcome::Unchanged | DriftOutcome::Waiting { .. } => debug!("{message}"),
        DriftOutcome::Restarted { .. } | DriftOutcome::Confirmed(_) => warn!("{message}"),
        _ => info!("{message}"),
    }
}

fn describe_drift(outcome: &DriftOutcome, restart: RestartPolicy) -> String {
    match outcome {
        DriftOutcome::Initialized(count) => format!("initial device count {count}"),
        DriftOutcome::Unchanged => "device count unchanged".to_string(),
        DriftOutcome::Detected { confirmed, observed } => {
            format!("device count {observed} differs from confirmed {confirmed}, waiting for confirmation")
        }
        DriftOutcome::Restarted {
            confirmed,
            previous,
            observed,
        } => {
            let window = match restart {
                RestartPolicy::AnyChange => "window restarted",
                RestartPolicy::SinceDivergence => "window kept",
            };
            format!("conflicting drift: pending {previous} replaced by {observed} (confirmed {confirmed}), {window}")
        }
        DriftOutcome::Reverted { confirmed, previous } => {
            format!("device count back to {confirmed}, discarding pending {previous}")
        }
        DriftOutcome::Waiting {
            observed, remaining, ..
        } => format!("device count {observed} pending, {}s left", remaining.as_secs()),
        DriftOutcome::Confirmed(drift) => {
            format!("device count changed: {} -> {}", drift.previous, drift.current)
        }
    }
}

/// Handle for controlling a FleetMonitorActor
#[derive(Clone)]
pub struct FleetHandle {
    sender: mpsc::Sender<FleetCommand>,
    pub fleet_id: String,
}

impl FleetHandle {
    /// Spawn a new fleet monitor actor
    pub fn spawn(
        config: ResolvedFleetConfig,
        api: Arc<dyn ManagementApi>,
        notifier: Arc<dyn Notifier>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let fleet_id = config.id.clone();

        let actor = FleetMonitorActor::new(config, api, notifier, state_store, cmd_rx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            fleet_id,
        }
    }

    /// Run a cycle immediately
    pub async fn poll_now(&self) -> Result<CycleReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(FleetCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")?
    }

    /// Wait for the current recovery sweep; `None` when none is running
    pub async fn await_sweep(&self) -> Result<Option<SweepReport>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(FleetCommand::AwaitSweep { respond_to: tx })
            .await
            .context("failed to send AwaitSweep command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(FleetCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Defaults, FleetConfig};
    use crate::monitors::drift::{DriftConfirmed, PendingDrift};
    use crate::storage::{MemoryStateStore, StorageResult};
    use crate::testing::{RecordingNotifier, ScriptedApi, device};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn config() -> ResolvedFleetConfig {
        let fleet = FleetConfig {
            id: "fleet".into(),
            name: Some("Fleet".into()),
            host: Some("10.0.0.1".into()),
            // keep the ticker out of the way of PollNow
            interval_secs: Some(3600),
            settle_secs: Some(10),
            double_check_secs: Some(5),
            ..Default::default()
        };
        fleet.resolve(&Defaults::default(), "box").unwrap()
    }

    struct Fixture {
        handle: FleetHandle,
        api: Arc<ScriptedApi>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<MemoryStateStore>,
    }

    /// The first snapshot is consumed by the actor's immediate first tick
    async fn spawn(snapshots: Vec<FleetSnapshot>, store: MemoryStateStore) -> Fixture {
        let api = Arc::new(ScriptedApi::new(snapshots));
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(store);
        let handle = FleetHandle::spawn(config(), api.clone(), notifier.clone(), store.clone());
        Fixture {
            handle,
            api,
            notifier,
            store,
        }
    }

    fn snapshot(devices: Vec<crate::DeviceRecord>) -> FleetSnapshot {
        FleetSnapshot::new("fleet", devices)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_leaves_state_untouched() {
        let fixture = spawn(vec![], MemoryStateStore::new()).await;

        // the first tick failed to fetch too; nothing was stored
        assert!(fixture.handle.poll_now().await.is_err());
        assert_eq!(fixture.store.load("fleet").await.unwrap(), DriftState::default());
        fixture.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_check_drop_has_no_side_effects() {
        let fixture = spawn(
            vec![
                snapshot(vec![device("1", true), device("2", true)]),
                snapshot(vec![device("1", true), device("2", false)]),
                snapshot(vec![device("1", true), device("2", true)]),
            ],
            MemoryStateStore::new(),
        )
        .await;

        let report = fixture.handle.poll_now().await.unwrap();
        assert_eq!(report.suspected, 1);
        assert!(report.confirmed.is_empty());
        assert!(!report.sweep_started);

        assert!(fixture.api.actions().is_empty());
        assert!(fixture.notifier.messages().is_empty());
        assert!(fixture.handle.await_sweep().await.unwrap().is_none());
        fixture.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_outage_starts_sweep() {
        let dead = snapshot(vec![device("1", true), device("2", false)]);
        let fixture = spawn(
            vec![
                snapshot(vec![device("1", true), device("2", true)]),
                dead.clone(),
                dead.clone(),
                // rechecks after reset, reboot and usb_reset
                dead.clone(),
                dead.clone(),
                dead,
            ],
            MemoryStateStore::new(),
        )
        .await;

        let report = fixture.handle.poll_now().await.unwrap();
        assert_eq!(report.confirmed, vec!["2".to_string()]);
        assert!(report.sweep_started);

        let sweep = fixture.handle.await_sweep().await.unwrap().unwrap();
        assert_eq!(sweep.exhausted, 1);

        let actions: Vec<String> = fixture.api.actions().into_iter().map(|(a, _)| a).collect();
        assert_eq!(actions, vec!["reset", "reboot", "usb_reset"]);

        let messages = fixture.notifier.messages();
        assert_eq!(messages.len(), 5);
        assert!(messages[0].starts_with("⚠️ [Fleet] 1 modem(s) offline"));
        assert!(messages[4].starts_with("❌ [Fleet] modem2 (IMEI 2)"));
        fixture.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_confirmation_notifies_and_persists() {
        let store = MemoryStateStore::new();
        let first_seen = Utc::now() - TimeDelta::seconds(400);
        store
            .save(
                "fleet",
                &DriftState {
                    confirmed_count: Some(3),
                    pending: Some(PendingDrift {
                        value: 2,
                        first_seen,
                    }),
                },
            )
            .await
            .unwrap();

        let two = || snapshot(vec![device("1", true), device("2", true)]);
        let fixture = spawn(vec![two(), two()], store).await;

        // the initial tick confirmed the drift; the next poll sees it stable
        let report = fixture.handle.poll_now().await.unwrap();
        assert_eq!(report.drift, Some(DriftOutcome::Unchanged));

        let state = fixture.store.load("fleet").await.unwrap();
        assert_eq!(state.confirmed_count, Some(2));
        assert_eq!(state.pending, None);

        assert_eq!(
            fixture.notifier.messages(),
            vec!["📶 Fleet (fleet) on box: modem count changed (confirmed): was 3 → now 2 (1 removed)"]
        );
        fixture.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_waits_for_sweep() {
        let api = Arc::new(ScriptedApi::new(vec![
            snapshot(vec![device("1", false)]),
            snapshot(vec![device("1", false)]),
            snapshot(vec![device("1", true)]),
        ]));
        let notifier = Arc::new(RecordingNotifier::default());
        let (_tx, rx) = mpsc::channel(1);
        let actor = FleetMonitorActor::new(config(), api.clone(), notifier, Arc::new(MemoryStateStore::new()), rx);

        let (report, sweep) = actor.run_once().await.unwrap();
        assert_matches!(report.drift, Some(DriftOutcome::Initialized(1)));
        assert_eq!(sweep.unwrap().recovered_count(), 1);
        assert_eq!(api.actions(), vec![("reset".to_string(), "1".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_battery_notified_once() {
        let mut low = device("1", true);
        low.battery = Some(20);
        let fixture = spawn(vec![snapshot(vec![low.clone()]), snapshot(vec![low])], MemoryStateStore::new()).await;

        let report = fixture.handle.poll_now().await.unwrap();
        assert_eq!(report.low_battery, 0);
        assert_matches!(report.drift, Some(DriftOutcome::Unchanged));

        assert_eq!(
            fixture.notifier.messages(),
            vec!["🔋 [Fleet] modem1 (IMEI 1): battery at 20% (threshold 40%)"]
        );
        fixture.handle.shutdown().await.unwrap();
    }

    /// Memory store whose next loads fail with the queued errors
    #[derive(Default)]
    struct FailingLoads {
        inner: MemoryStateStore,
        errors: Mutex<VecDeque<StorageError>>,
    }

    impl FailingLoads {
        fn fail_next(&self, error: StorageError) {
            self.errors.lock().unwrap().push_back(error);
        }
    }

    #[async_trait]
    impl StateStore for FailingLoads {
        async fn load(&self, fleet_id: &str) -> StorageResult<DriftState> {
            let error = self.errors.lock().unwrap().pop_front();
            match error {
                Some(error) => Err(error),
                None => self.inner.load(fleet_id).await,
            }
        }

        async fn save(&self, fleet_id: &str, state: &DriftState) -> StorageResult<()> {
            self.inner.save(fleet_id, state).await
        }
    }

    fn single_cycle(
        api: &Arc<ScriptedApi>,
        notifier: &Arc<RecordingNotifier>,
        store: &Arc<FailingLoads>,
    ) -> FleetMonitorActor {
        let (_tx, rx) = mpsc::channel(1);
        FleetMonitorActor::new(config(), api.clone(), notifier.clone(), store.clone(), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unloadable_state_skips_drift_and_keeps_pending() {
        let pending = DriftState {
            confirmed_count: Some(3),
            pending: Some(PendingDrift {
                value: 2,
                first_seen: Utc::now() - TimeDelta::seconds(400),
            }),
        };
        let store = Arc::new(FailingLoads::default());
        store.save("fleet", &pending).await.unwrap();
        store.fail_next(StorageError::IoError(std::io::Error::other("disk gone")));

        let two = || snapshot(vec![device("1", true), device("2", true)]);
        let api = Arc::new(ScriptedApi::new(vec![two(), two()]));
        let notifier = Arc::new(RecordingNotifier::default());

        let (report, _) = single_cycle(&api, &notifier, &store).run_once().await.unwrap();
        assert_eq!(report.drift, None);
        assert_eq!(report.device_count, 2);
        assert_eq!(store.load("fleet").await.unwrap(), pending);
        assert!(notifier.messages().is_empty());

        // store readable again: the drift is confirmed instead of absorbed
        let (report, _) = single_cycle(&api, &notifier, &store).run_once().await.unwrap();
        assert_eq!(
            report.drift,
            Some(DriftOutcome::Confirmed(DriftConfirmed {
                previous: 3,
                current: 2
            }))
        );
        assert_eq!(store.load("fleet").await.unwrap().confirmed_count, Some(2));
        assert_eq!(notifier.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_state_starts_over() {
        let store = Arc::new(FailingLoads::default());
        store.fail_next(StorageError::SerializationError("expected value".into()));
        let api = Arc::new(ScriptedApi::new(vec![snapshot(vec![device("1", true)])]));
        let notifier = Arc::new(RecordingNotifier::default());

        let (report, _) = single_cycle(&api, &notifier, &store).run_once().await.unwrap();
        assert_eq!(report.drift, Some(DriftOutcome::Initialized(1)));
        assert_eq!(store.load("fleet").await.unwrap().confirmed_count, Some(1));
    }

    #[test]
    fn test_restart_wording_follows_policy() {
        let restarted = DriftOutcome::Restarted {
            confirmed: 10,
            previous: 8,
            observed: 7,
        };
        assert_eq!(
            describe_drift(&restarted, RestartPolicy::AnyChange),
            "conflicting drift: pending 8 replaced by 7 (confirmed 10), window restarted"
        );
        assert_eq!(
            describe_drift(&restarted, RestartPolicy::SinceDivergence),
            "conflicting drift: pending 8 replaced by 7 (confirmed 10), window kept"
        );
    }
}
