//! In-memory storage backend
//!
//! Used with `storage: none` and in tests. The run-lock only holds within
//! this process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::debug;

use super::backend::{Acquire, MetricsSink, RunLockStore};
use super::error::{StorageError, StorageResult};
use super::schema::{BandwidthSample, BenchmarkSample, RunCounters, RunRecord, RunStatus};

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    runs: Mutex<HashMap<(String, NaiveDate), RunRecord>>,
    samples: Mutex<Vec<BenchmarkSample>>,
    bandwidth: Mutex<Vec<BandwidthSample>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> StorageResult<MutexGuard<'_, HashMap<(String, NaiveDate), RunRecord>>> {
        self.runs
            .lock()
            .map_err(|_| StorageError::BackendError("run table lock poisoned".to_string()))
    }

    fn samples(&self) -> StorageResult<MutexGuard<'_, Vec<BenchmarkSample>>> {
        self.samples
            .lock()
            .map_err(|_| StorageError::BackendError("sample table lock poisoned".to_string()))
    }

    fn bandwidth(&self) -> StorageResult<MutexGuard<'_, Vec<BandwidthSample>>> {
        self.bandwidth
            .lock()
            .map_err(|_| StorageError::BackendError("bandwidth table lock poisoned".to_string()))
    }
}

#[async_trait]
impl RunLockStore for InMemoryBackend {
    async fn try_acquire(
        &self,
        fleet_id: &str,
        day: NaiveDate,
        tz: &str,
        retry_failed: bool,
    ) -> StorageResult<Acquire> {
        let mut runs = self.runs()?;
        let fresh = RunRecord {
            fleet_id: fleet_id.to_string(),
            day,
            tz: tz.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            counters: None,
            note: None,
        };

        match runs.get_mut(&(fleet_id.to_string(), day)) {
            None => {
                runs.insert((fleet_id.to_string(), day), fresh);
                Ok(Acquire::Acquired)
            }
            Some(existing) if existing.status == RunStatus::Failed && retry_failed => {
                debug!("retrying failed run of {fleet_id} for {day}");
                *existing = fresh;
                Ok(Acquire::Acquired)
            }
            Some(existing) => Ok(Acquire::Held(existing.status)),
        }
    }

    async fn finish(
        &self,
        fleet_id: &str,
        day: NaiveDate,
        status: RunStatus,
        counters: RunCounters,
        note: Option<&str>,
    ) -> StorageResult<()> {
        let mut runs = self.runs()?;
        let run = runs
            .get_mut(&(fleet_id.to_string(), day))
            .ok_or_else(|| StorageError::QueryFailed(format!("no run of {fleet_id} for {day}")))?;

        run.status = status;
        run.finished_at = Some(Utc::now());
        run.counters = Some(counters);
        run.note = note.map(String::from);
        Ok(())
    }

    async fn get_run(&self, fleet_id: &str, day: NaiveDate) -> StorageResult<Option<RunRecord>> {
        Ok(self.runs()?.get(&(fleet_id.to_string(), day)).cloned())
    }
}

#[async_trait]
impl MetricsSink for InMemoryBackend {
    async fn insert_samples(&self, samples: Vec<BenchmarkSample>) -> StorageResult<()> {
        self.samples()?.extend(samples);
        Ok(())
    }

    async fn query_samples(&self, fleet_id: &str, day: NaiveDate) -> StorageResult<Vec<BenchmarkSample>> {
        Ok(self
            .samples()?
            .iter()
            .filter(|sample| sample.fleet_id == fleet_id && sample.day == day)
            .cloned()
            .collect())
    }

    async fn insert_bandwidth(&self, samples: Vec<BandwidthSample>) -> StorageResult<()> {
        self.bandwidth()?.extend(samples);
        Ok(())
    }

    async fn query_bandwidth(&self, fleet_id: &str) -> StorageResult<Vec<BandwidthSample>> {
        Ok(self
            .bandwidth()?
            .iter()
            .filter(|sample| sample.fleet_id == fleet_id)
            .cloned()
            .collect())
    }
}
