//! Debounced detection of fleet size changes
//!
//! A changed device count only becomes a [`DriftConfirmed`] event once the
//! same new value has been observed for the whole confirmation window. The
//! detector itself is pure: the caller loads a [`DriftState`], feeds one
//! observation and persists the state afterwards.
//!
//! ```text
//!  Uninitialized ──first value──▶ Stable ◀──────────── confirmed / reverted ──┐
//!                                   │                                        │
//!                                   └──value differs──▶ PendingConfirmation ─┘
//!                                                         │      ▲
//!                                                         └──────┘ other value: restart
//! ```

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Persisted per-fleet drift state.
///
/// Serialized as `{"confirmedCount": 10, "pending": {"value": 8, "firstSeen": 1700000000}}`.
/// Files written by the older scripts (`last_count`, `first_seen`) are read too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftState {
    #[serde(default, alias = "last_count", skip_serializing_if = "Option::is_none")]
    pub confirmed_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingDrift>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDrift {
    pub value: u64,
    #[serde(alias = "first_seen", with = "chrono::serde::ts_seconds")]
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftPhase {
    Uninitialized,
    Stable,
    PendingConfirmation,
}

impl DriftState {
    pub fn phase(&self) -> DriftPhase {
        match (self.confirmed_count, &self.pending) {
            (None, _) => DriftPhase::Uninitialized,
            (Some(_), None) => DriftPhase::Stable,
            (Some(_), Some(_)) => DriftPhase::PendingConfirmation,
        }
    }
}

/// How a pending drift reacts to yet another value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Any new value restarts the confirmation window
    #[default]
    AnyChange,
    /// The window keeps running from the first divergence, only the value is replaced
    SinceDivergence,
}

/// A drift that held for the whole window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftConfirmed {
    pub previous: u64,
    pub current: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftOutcome {
    /// First observation of this fleet
    Initialized(u64),
    Unchanged,
    /// A new value started the confirmation window
    Detected { confirmed: u64, observed: u64 },
    /// A different value replaced the pending one
    Restarted {
        confirmed: u64,
        previous: u64,
        observed: u64,
    },
    /// The count went back to the confirmed value before confirmation
    Reverted { confirmed: u64, previous: u64 },
    Waiting {
        confirmed: u64,
        observed: u64,
        remaining: Duration,
    },
    Confirmed(DriftConfirmed),
}

#[derive(Debug, Clone, Copy)]
pub struct DriftDetector {
    window: TimeDelta,
    restart: RestartPolicy,
}

impl DriftDetector {
    pub fn new(window: Duration, restart: RestartPolicy) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            restart,
        }
    }

    /// Feed one observed count, mutating `state` in place.
    pub fn observe(&self, state: &mut DriftState, observed: u64, now: DateTime<Utc>) -> DriftOutcome {
        let Some(confirmed) = state.confirmed_count else {
            state.confirmed_count = Some(observed);
            state.pending = None;
            return DriftOutcome::Initialized(observed);
        };

        // a pending value equal to the confirmed one carries no information
        if state.pending.as_ref().is_some_and(|p| p.value == confirmed) {
            state.pending = None;
        }

        let Some(pending) = state.pending.clone() else {
            if observed == confirmed {
                return DriftOutcome::Unchanged;
            }
            state.pending = Some(PendingDrift {
                value: observed,
                first_seen: now,
            });
            return DriftOutcome::Detected { confirmed, observed };
        };

        if observed == confirmed {
            state.pending = None;
            return DriftOutcome::Reverted {
                confirmed,
                previous: pending.value,
            };
        }

        if observed != pending.value {
            let first_seen = match self.restart {
                RestartPolicy::AnyChange => now,
                RestartPolicy::SinceDivergence => pending.first_seen,
            };
            state.pending = Some(PendingDrift {
                value: observed,
                first_seen,
            });
            return DriftOutcome::Restarted {
                confirmed,
                previous: pending.value,
                observed,
            };
        }

        let elapsed = now.signed_duration_since(pending.first_seen);
        if elapsed < self.window {
            return DriftOutcome::Waiting {
                confirmed,
                observed,
                remaining: (self.window - elapsed).to_std().unwrap_or_default(),
            };
        }

        state.confirmed_count = Some(observed);
        state.pending = None;
        DriftOutcome::Confirmed(DriftConfirmed {
            previous: confirmed,
            current: observed,
        })
    }
}
