//! Escalating per-device recovery
//!
//! The ladder is plain data ([`LADDER`]) walked by a small interpreter that
//! stops at the first step after which the device is alive again. Every
//! device runs in its own task; a sweep collects all outcomes.
//!
//! ```text
//! reset ──settle──▶ alive? ──no──▶ reboot ──settle──▶ alive? ──no──▶ usb_reset ──settle──▶ alive? ──no──▶ give up
//!                     │yes                              │yes                                  │yes
//!                     ▼                                 ▼                                     ▼
//!                 Recovered                         Recovered                             Recovered
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::DeviceRecord;
use crate::alerts::Notifier;
use crate::client::{ActionError, ManagementApi};
use crate::monitors::health::{Health, HealthClassifier};

/// One recovery action, mildest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecoveryStep {
    Reset,
    Reboot,
    UsbReset,
}

pub const LADDER: [RecoveryStep; 3] = [RecoveryStep::Reset, RecoveryStep::Reboot, RecoveryStep::UsbReset];

impl RecoveryStep {
    pub fn name(self) -> &'static str {
        match self {
            RecoveryStep::Reset => "reset",
            RecoveryStep::Reboot => "reboot",
            RecoveryStep::UsbReset => "usb_reset",
        }
    }

    fn start_message(self, prefix: &str) -> String {
        match self {
            RecoveryStep::Reset => format!("🛠 {prefix}: starting reset"),
            RecoveryStep::Reboot => format!("🔁 {prefix}: reset did not help, rebooting"),
            RecoveryStep::UsbReset => format!("🧰 {prefix}: reboot did not help, running usb_reset"),
        }
    }

    async fn perform(self, api: &dyn ManagementApi, id: &str) -> Result<(), ActionError> {
        match self {
            RecoveryStep::Reset => api.reset(id).await,
            RecoveryStep::Reboot => api.reboot(id).await,
            RecoveryStep::UsbReset => api.usb_reset(id).await,
        }
    }
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a device's ladder stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LadderStep {
    Step(RecoveryStep),
    GiveUp,
}

impl fmt::Display for LadderStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LadderStep::Step(step) => write!(f, "{step}"),
            LadderStep::GiveUp => f.write_str("give_up"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Recovered,
    Exhausted,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub device_id: String,
    pub dev: String,
    pub step_taken: LadderStep,
    pub outcome: Outcome,
    pub error: Option<String>,
}

/// Aggregate of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub recovered: BTreeMap<RecoveryStep, usize>,
    pub exhausted: usize,
    pub aborted: BTreeMap<LadderStep, usize>,
    /// Device tasks that panicked or were cancelled
    pub panicked: usize,
    pub outcomes: Vec<RecoveryOutcome>,
}

impl SweepReport {
    fn record(&mut self, outcome: RecoveryOutcome) {
        match (outcome.outcome, outcome.step_taken) {
            (Outcome::Recovered, LadderStep::Step(step)) => *self.recovered.entry(step).or_default() += 1,
            (Outcome::Recovered, LadderStep::GiveUp) | (Outcome::Exhausted, _) => self.exhausted += 1,
            (Outcome::Aborted, step) => *self.aborted.entry(step).or_default() += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn total(&self) -> usize {
        self.outcomes.len() + self.panicked
    }

    pub fn recovered_count(&self) -> usize {
        self.recovered.values().sum()
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} device(s): recovered", self.total())?;
        for step in LADDER {
            write!(f, " {step}={}", self.recovered.get(&step).copied().unwrap_or(0))?;
        }
        let aborted: usize = self.aborted.values().sum();
        write!(
            f,
            ", exhausted={}, aborted={aborted}, panicked={}",
            self.exhausted, self.panicked
        )
    }
}

#[derive(Clone)]
pub struct RecoveryOrchestrator {
    api: Arc<dyn ManagementApi>,
    notifier: Arc<dyn Notifier>,
    classifier: Arc<dyn HealthClassifier>,
    settle: Duration,
    label: String,
}

impl RecoveryOrchestrator {
    pub fn new(
        api: Arc<dyn ManagementApi>,
        notifier: Arc<dyn Notifier>,
        classifier: Arc<dyn HealthClassifier>,
        settle: Duration,
        label: impl Into<String>,
    ) -> Self {
        Self {
            api,
            notifier,
            classifier,
            settle,
            label: label.into(),
        }
    }

    /// Recover every device concurrently and wait for all of them
    #[instrument(skip_all, fields(fleet = %self.label, devices = devices.len()))]
    pub async fn sweep(&self, devices: Vec<DeviceRecord>) -> SweepReport {
        let mut tasks = JoinSet::new();
        for device in devices {
            let orchestrator = self.clone();
            tasks.spawn(async move { orchestrator.recover_device(device).await });
        }

        let mut report = SweepReport::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!("recovery task failed: {e}");
                    report.panicked += 1;
                }
            }
        }

        info!("recovery sweep finished: {report}");
        report
    }

    /// Walk the ladder for one device
    pub async fn recover_device(&self, device: DeviceRecord) -> RecoveryOutcome {
        let prefix = format!("[{}] {}", self.label, device.label());
        let outcome = |step_taken, outcome, error| RecoveryOutcome {
            device_id: device.id.clone().unwrap_or_default(),
            dev: device.dev.clone(),
            step_taken,
            outcome,
            error,
        };

        let Some(id) = device.id.as_deref() else {
            warn!("{prefix}: cannot recover a device without IMEI");
            return outcome(
                LadderStep::Step(LADDER[0]),
                Outcome::Aborted,
                Some("device has no identifier".to_string()),
            );
        };

        for step in LADDER {
            self.notifier.notify(&step.start_message(&prefix)).await;
            info!("{prefix}: {step}");

            match self.attempt(step, id).await {
                Ok(Health::Alive) => {
                    self.notifier
                        .notify(&format!("✅ {prefix}: recovered after {step}"))
                        .await;
                    info!("{prefix}: recovered after {step}");
                    return outcome(LadderStep::Step(step), Outcome::Recovered, None);
                }
                Ok(Health::Offline) => {}
                Err(e) => {
                    self.notifier
                        .notify(&format!("❗ {prefix}: recovery failed during {step}: {e}"))
                        .await;
                    warn!("{prefix}: recovery failed during {step}: {e}");
                    return outcome(LadderStep::Step(step), Outcome::Aborted, Some(e.to_string()));
                }
            }
        }

        self.notifier
            .notify(&format!("❌ {prefix}: could not restore the modem"))
            .await;
        warn!("{prefix}: not recovered");
        outcome(LadderStep::GiveUp, Outcome::Exhausted, None)
    }

    /// Issue the action, let the device settle, then recheck it.
    /// A device missing from the recheck snapshot counts as offline.
    async fn attempt(&self, step: RecoveryStep, id: &str) -> Result<Health, ActionError> {
        step.perform(self.api.as_ref(), id).await?;
        tokio::time::sleep(self.settle).await;

        let snapshot = self.api.fetch().await?;
        Ok(snapshot
            .find(id)
            .map_or(Health::Offline, |device| self.classifier.classify(device)))
    }
}
