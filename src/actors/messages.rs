//! Message types for actor communication
//!
//! Each actor owns an mpsc command channel; request/response commands carry
//! a oneshot sender for the reply.

use chrono::NaiveDate;
use tokio::sync::oneshot;

use crate::actors::recovery::SweepReport;
use crate::monitors::drift::DriftOutcome;
use crate::storage::{RunCounters, RunStatus};

/// Commands that can be sent to a FleetMonitorActor
#[derive(Debug)]
pub enum FleetCommand {
    /// Run one monitoring cycle immediately (bypassing the interval timer)
    PollNow {
        respond_to: oneshot::Sender<anyhow::Result<CycleReport>>,
    },

    /// Wait for the in-flight recovery sweep, if any, and return its report
    AwaitSweep {
        respond_to: oneshot::Sender<Option<SweepReport>>,
    },

    /// Stop the actor; an unfinished sweep is aborted
    Shutdown,
}

/// Commands that can be sent to a BenchmarkActor
#[derive(Debug)]
pub enum BenchmarkCommand {
    /// Try to run today's benchmark now, ignoring the schedule window.
    /// The run-lock still applies.
    RunNow {
        respond_to: oneshot::Sender<anyhow::Result<BenchmarkSummary>>,
    },

    Shutdown,
}

/// Commands that can be sent to a BandwidthActor
#[derive(Debug)]
pub enum BandwidthCommand {
    /// Collect every port's counters now, outside the interval
    CollectNow {
        respond_to: oneshot::Sender<anyhow::Result<BandwidthSummary>>,
    },

    Shutdown,
}

/// What one monitoring cycle saw and did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub device_count: usize,
    /// `None` when the drift state could not be loaded this cycle
    pub drift: Option<DriftOutcome>,
    pub low_battery: usize,
    /// Devices suspected offline by the first poll
    pub suspected: usize,
    /// Devices confirmed offline by the double-check
    pub confirmed: Vec<String>,
    pub sweep_started: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenchmarkSummary {
    /// The run-lock for the day was already taken
    Skipped { day: NaiveDate, status: RunStatus },
    Completed {
        day: NaiveDate,
        status: RunStatus,
        counters: RunCounters,
    },
}

/// Result of one bandwidth collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthSummary {
    pub ports: usize,
    /// Rows written to the metrics sink
    pub stored: usize,
    /// Ports whose report could not be fetched or parsed
    pub failed: usize,
}
