//! BenchmarkActor - once-per-day speedtest of every device in a fleet
//!
//! The actor wakes every `poll_secs`, converts the current time into the
//! fleet's time zone and, inside the configured window, competes for the
//! day's run-lock. Only the winner talks to the devices.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::DeviceRecord;
use crate::client::ManagementApi;
use crate::config::{BenchmarkConfig, ResolvedFleetConfig};
use crate::storage::{Acquire, BenchmarkSample, MetricsSink, RunCounters, RunLockStore, RunStatus};
use crate::units::{UnitParseError, field_text, parse_latency_ms, parse_rate_mbps};

use super::messages::{BenchmarkCommand, BenchmarkSummary};

/// Whether a run should start at `now_local`.
///
/// Due inside `[run_at, run_at + window)`; with `allow_late` any time after
/// `run_at` on the same day.
pub fn is_due(now_local: NaiveDateTime, config: &BenchmarkConfig) -> bool {
    let Some(run_at) = now_local
        .date()
        .and_hms_opt(config.run_hour, config.run_minute, 0)
    else {
        return false;
    };

    if now_local < run_at {
        return false;
    }
    config.allow_late || now_local < run_at + TimeDelta::minutes(i64::from(config.window_minutes))
}

/// Measured values of one successful speedtest
#[derive(Debug, Clone, Copy, PartialEq)]
struct Measurement {
    download_mbps: f64,
    upload_mbps: f64,
    ping_ms: f64,
}

fn parse_measurement(data: &Value) -> Result<Measurement, UnitParseError> {
    let rate = |field: &str| {
        field_text(data.get(field))
            .ok_or(UnitParseError::Missing)
            .and_then(|t| parse_rate_mbps(&t))
    };
    let latency = field_text(data.get("ping"))
        .ok_or(UnitParseError::Missing)
        .and_then(|t| parse_latency_ms(&t));

    Ok(Measurement {
        download_mbps: rate("download")?,
        upload_mbps: rate("upload")?,
        ping_ms: latency?,
    })
}

/// Runs the benchmark of one fleet for one day
pub struct BenchmarkRunner {
    fleet_id: String,
    tz: Tz,
    config: BenchmarkConfig,
    api: Arc<dyn ManagementApi>,
    lock: Arc<dyn RunLockStore>,
    sink: Arc<dyn MetricsSink>,
}

impl BenchmarkRunner {
    pub fn new(
        fleet: &ResolvedFleetConfig,
        config: BenchmarkConfig,
        api: Arc<dyn ManagementApi>,
        lock: Arc<dyn RunLockStore>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            fleet_id: fleet.id.clone(),
            tz: fleet.timezone,
            config,
            api,
            lock,
            sink,
        }
    }

    /// Current date in the fleet's time zone
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }

    /// Take the run-lock for `day` and, if it was ours, benchmark every device
    #[instrument(skip(self), fields(fleet = %self.fleet_id))]
    pub async fn run_day(&self, day: NaiveDate) -> Result<BenchmarkSummary> {
        let acquired = self
            .lock
            .try_acquire(&self.fleet_id, day, self.tz.name(), self.config.retry_failed)
            .await
            .context("failed to acquire run-lock")?;

        if let Acquire::Held(status) = acquired {
            debug!("benchmark for {day} already {status}");
            return Ok(BenchmarkSummary::Skipped { day, status });
        }

        info!("benchmark run start: date={day} tz={}", self.tz.name());

        let snapshot = match self.api.fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("failed to fetch devices for benchmark: {e}");
                let note = format!("fetch failed: {e}");
                self.finish(day, RunStatus::Failed, RunCounters::default(), Some(&note))
                    .await?;
                return Ok(BenchmarkSummary::Completed {
                    day,
                    status: RunStatus::Failed,
                    counters: RunCounters::default(),
                });
            }
        };

        let devices = unique_devices(snapshot.devices);
        let mut counters = RunCounters {
            total: devices.len() as u32,
            ..Default::default()
        };

        for (id, device) in &devices {
            if self.measure_device(day, id, device).await {
                counters.ok += 1;
            } else {
                counters.fail += 1;
            }
        }

        let status = if counters.fail == 0 {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        self.finish(day, status, counters, None).await?;

        info!(
            "benchmark run finished: date={day} status={status} ok={} fail={}",
            counters.ok, counters.fail
        );
        Ok(BenchmarkSummary::Completed { day, status, counters })
    }

    async fn finish(&self, day: NaiveDate, status: RunStatus, counters: RunCounters, note: Option<&str>) -> Result<()> {
        self.lock
            .finish(&self.fleet_id, day, status, counters, note)
            .await
            .with_context(|| format!("failed to finish benchmark run for {day}"))
    }

    /// Up to `attempts` speedtests; every attempt becomes one sample
    async fn measure_device(&self, day: NaiveDate, id: &str, device: &DeviceRecord) -> bool {
        let delay = Duration::from_secs(self.config.attempt_delay_secs);
        let mut last_error = None;

        for attempt in 1..=self.config.attempts {
            let mut sample = BenchmarkSample {
                fleet_id: self.fleet_id.clone(),
                day,
                tz: self.tz.name().to_string(),
                device_id: id.to_string(),
                nick: device.nick.clone(),
                online: field_text(device.online.as_ref()),
                attempt,
                success: false,
                download_mbps: None,
                upload_mbps: None,
                ping_ms: None,
                raw: Value::Null,
                error: None,
                recorded_at: Utc::now(),
            };

            match self.api.speedtest(id).await {
                Ok(data) => match parse_measurement(&data) {
                    Ok(measurement) => {
                        sample.success = true;
                        sample.download_mbps = Some(measurement.download_mbps);
                        sample.upload_mbps = Some(measurement.upload_mbps);
                        sample.ping_ms = Some(measurement.ping_ms);
                        sample.raw = data;
                    }
                    Err(e) => {
                        sample.error = Some(format!("parse failed: {e}"));
                        sample.raw = data;
                    }
                },
                Err(e) => {
                    sample.error = Some(e.to_string());
                    sample.raw = json!({ "error": e.to_string() });
                }
            }

            let success = sample.success;
            last_error = sample.error.clone();
            self.record(sample).await;

            if success {
                return true;
            }
            if attempt < self.config.attempts {
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            "speedtest failed: device={} err={}",
            device.label(),
            last_error.as_deref().unwrap_or("unknown")
        );
        false
    }

    /// Sample loss is logged; the run itself continues
    async fn record(&self, sample: BenchmarkSample) {
        let (device, attempt) = (sample.device_id.clone(), sample.attempt);
        if let Err(e) = self.sink.insert_samples(vec![sample]).await {
            warn!("failed to store sample (device={device} attempt={attempt}): {e}");
        }
    }
}

/// Devices with an id, first occurrence wins
fn unique_devices(devices: Vec<DeviceRecord>) -> Vec<(String, DeviceRecord)> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter_map(|device| match device.id.clone() {
            Some(id) if seen.insert(id.clone()) => Some((id, device)),
            Some(_) => None,
            None => {
                debug!("skipping {} without id", device.label());
                None
            }
        })
        .collect()
}

pub struct BenchmarkActor {
    runner: BenchmarkRunner,
    poll: Duration,
    command_rx: mpsc::Receiver<BenchmarkCommand>,
}

impl BenchmarkActor {
    pub fn new(runner: BenchmarkRunner, command_rx: mpsc::Receiver<BenchmarkCommand>) -> Self {
        Self {
            poll: Duration::from_secs(runner.config.poll_secs),
            runner,
            command_rx,
        }
    }

    #[instrument(skip(self), fields(fleet = %self.runner.fleet_id))]
    pub async fn run(mut self) {
        debug!("starting benchmark scheduler");

        let mut ticker = interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    let now_local = Utc::now().with_timezone(&self.runner.tz).naive_local();
                    if !is_due(now_local, &self.runner.config) {
                        continue;
                    }
                    if let Err(e) = self.runner.run_day(now_local.date()).await {
                        error!("benchmark run failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        BenchmarkCommand::RunNow { respond_to } => {
                            let result = self.runner.run_day(self.runner.today()).await;
                            let _ = respond_to.send(result);
                        }

                        BenchmarkCommand::Shutdown => {
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

        debug!("benchmark scheduler stopped");
    }
}

/// Handle for controlling a BenchmarkActor
#[derive(Clone)]
pub struct BenchmarkHandle {
    sender: mpsc::Sender<BenchmarkCommand>,
    pub fleet_id: String,
}

impl BenchmarkHandle {
    pub fn spawn(runner: BenchmarkRunner) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let fleet_id = runner.fleet_id.clone();

        tokio::spawn(BenchmarkActor::new(runner, cmd_rx).run());

        Self {
            sender: cmd_tx,
            fleet_id,
        }
    }

    /// Run today's benchmark outside the schedule window
    pub async fn run_now(&self) -> Result<BenchmarkSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BenchmarkCommand::RunNow { respond_to: tx })
            .await
            .context("failed to send RunNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(BenchmarkCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
