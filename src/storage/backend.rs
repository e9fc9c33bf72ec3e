//! Storage traits for the daily benchmark and the sampled metrics
//!
//! Backends implement both traits; they are separate so the run-lock
//! contract can be reasoned about on its own.

use async_trait::async_trait;
use chrono::NaiveDate;

use super::error::StorageResult;
use super::schema::{BandwidthSample, BenchmarkSample, RunCounters, RunRecord, RunStatus};

/// Result of trying to take the run-lock for a day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// This caller owns the run and must finish it
    Acquired,
    /// Someone else already ran or is running it
    Held(RunStatus),
}

/// Idempotent once-per-day run-lock keyed by `(fleet_id, day)`.
///
/// ## Contract
///
/// - Exactly one of any number of concurrent `try_acquire` calls for the same
///   key observes [`Acquire::Acquired`].
/// - `running` and `success` are never re-acquired on the same day.
/// - `failed` is re-acquired only when `retry_failed` is set, and then only by
///   one of the racing callers.
#[async_trait]
pub trait RunLockStore: Send + Sync {
    async fn try_acquire(
        &self,
        fleet_id: &str,
        day: NaiveDate,
        tz: &str,
        retry_failed: bool,
    ) -> StorageResult<Acquire>;

    /// Record the final status of an acquired run
    async fn finish(
        &self,
        fleet_id: &str,
        day: NaiveDate,
        status: RunStatus,
        counters: RunCounters,
        note: Option<&str>,
    ) -> StorageResult<()>;

    async fn get_run(&self, fleet_id: &str, day: NaiveDate) -> StorageResult<Option<RunRecord>>;
}

/// Insert-only sink for sampled metrics, one row per sample
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn insert_samples(&self, samples: Vec<BenchmarkSample>) -> StorageResult<()>;

    /// Samples of one fleet and day in insertion order
    async fn query_samples(&self, fleet_id: &str, day: NaiveDate) -> StorageResult<Vec<BenchmarkSample>>;

    async fn insert_bandwidth(&self, samples: Vec<BandwidthSample>) -> StorageResult<()>;

    /// Bandwidth rows of one fleet in insertion order
    async fn query_bandwidth(&self, fleet_id: &str) -> StorageResult<Vec<BandwidthSample>>;
}
