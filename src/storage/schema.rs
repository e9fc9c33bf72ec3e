//! Run-lock records and benchmark samples
//!
//! ## Tables
//!
//! - `benchmark_runs`: one row per `(fleet_id, run_day)`, the daily run-lock.
//!   Created as `running` by whoever wins the insert, finished once as
//!   `success` or `failed` with result counters.
//! - `benchmark_samples`: insert-only, one row per speedtest attempt. The raw
//!   endpoint answer is kept next to the parsed numbers.
//! - `bandwidth_samples`: insert-only, one row per proxy port and collection.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(StorageError::Corrupt(format!("unknown run status `{other}`"))),
        }
    }
}

/// Device counts of a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total: u32,
    pub ok: u32,
    pub fail: u32,
}

/// One row of the daily run-lock table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub fleet_id: String,
    pub day: NaiveDate,
    /// IANA name of the zone the day was computed in
    pub tz: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: Option<RunCounters>,
    pub note: Option<String>,
}

/// One speedtest attempt against one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSample {
    pub fleet_id: String,
    pub day: NaiveDate,
    pub tz: String,
    pub device_id: String,
    pub nick: Option<String>,
    /// Online flag as reported, kept verbatim
    pub online: Option<String>,
    /// 1-based
    pub attempt: u32,
    pub success: bool,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub ping_ms: Option<f64>,
    pub raw: Value,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Daily traffic counters of one proxy port at one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub fleet_id: String,
    pub fleet_name: String,
    pub device_id: String,
    pub port_id: String,
    pub login: Option<String>,
    pub day_in_bytes: u64,
    pub day_out_bytes: u64,
    pub collected_at: DateTime<Utc>,
}
