//! BandwidthActor - periodic per-port traffic counters of one fleet
//!
//! Every `interval_secs` the port listing is fetched and each port's daily
//! in/out volume is read, parsed into bytes and written as one insert-only
//! row. A port whose report is missing or unparseable is skipped for that
//! collection rather than stored as zero.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::ProxyPort;
use crate::client::ManagementApi;
use crate::config::{BandwidthConfig, ResolvedFleetConfig};
use crate::storage::{BandwidthSample, MetricsSink};
use crate::units::{UnitParseError, field_text, parse_bytes};

use super::messages::{BandwidthCommand, BandwidthSummary};

const DAY_IN_FIELD: &str = "bandwidth_bytes_day_in";
const DAY_OUT_FIELD: &str = "bandwidth_bytes_day_out";

fn parse_volume(report: &Value, field: &str) -> Result<u64, UnitParseError> {
    field_text(report.get(field))
        .ok_or(UnitParseError::Missing)
        .and_then(|text| parse_bytes(&text))
}

/// Collects the bandwidth of one fleet
pub struct BandwidthCollector {
    fleet_id: String,
    fleet_name: String,
    api: Arc<dyn ManagementApi>,
    sink: Arc<dyn MetricsSink>,
}

impl BandwidthCollector {
    pub fn new(fleet: &ResolvedFleetConfig, api: Arc<dyn ManagementApi>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            fleet_id: fleet.id.clone(),
            fleet_name: fleet.name.clone(),
            api,
            sink,
        }
    }

    /// One pass over every port. Fails only when the port listing or the
    /// final insert fails.
    #[instrument(skip(self), fields(fleet = %self.fleet_id))]
    pub async fn collect(&self) -> Result<BandwidthSummary> {
        let ports = self
            .api
            .list_ports()
            .await
            .context("failed to list proxy ports")?;

        let collected_at = Utc::now();
        let mut summary = BandwidthSummary {
            ports: ports.len(),
            ..Default::default()
        };
        let mut rows = Vec::with_capacity(ports.len());

        for port in ports {
            match self.sample_port(&port, collected_at).await {
                Some(row) => rows.push(row),
                None => summary.failed += 1,
            }
        }

        summary.stored = rows.len();
        self.sink
            .insert_bandwidth(rows)
            .await
            .context("failed to store bandwidth samples")?;

        info!(
            "bandwidth collected: ports={} stored={} failed={}",
            summary.ports, summary.stored, summary.failed
        );
        Ok(summary)
    }

    async fn sample_port(&self, port: &ProxyPort, collected_at: DateTime<Utc>) -> Option<BandwidthSample> {
        let report = match self.api.bandwidth(&port.port_id).await {
            Ok(report) => report,
            Err(e) => {
                warn!("imei={} port={}: {e}", port.device_id, port.port_id);
                return None;
            }
        };

        let volumes = parse_volume(&report, DAY_IN_FIELD)
            .and_then(|day_in| Ok((day_in, parse_volume(&report, DAY_OUT_FIELD)?)));
        let (day_in_bytes, day_out_bytes) = match volumes {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!("imei={} port={}: bad bandwidth report: {e}", port.device_id, port.port_id);
                return None;
            }
        };

        debug!(
            "imei={} port={} in={day_in_bytes} out={day_out_bytes}",
            port.device_id, port.port_id
        );
        Some(BandwidthSample {
            fleet_id: self.fleet_id.clone(),
            fleet_name: self.fleet_name.clone(),
            device_id: port.device_id.clone(),
            port_id: port.port_id.clone(),
            login: port.login.clone(),
            day_in_bytes,
            day_out_bytes,
            collected_at,
        })
    }
}

pub struct BandwidthActor {
    collector: BandwidthCollector,
    period: Duration,
    command_rx: mpsc::Receiver<BandwidthCommand>,
}

impl BandwidthActor {
    pub fn new(
        collector: BandwidthCollector,
        config: &BandwidthConfig,
        command_rx: mpsc::Receiver<BandwidthCommand>,
    ) -> Self {
        Self {
            collector,
            period: Duration::from_secs(config.interval_secs),
            command_rx,
        }
    }

    #[instrument(skip(self), fields(fleet = %self.collector.fleet_id))]
    pub async fn run(mut self) {
        debug!("starting bandwidth collector");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    if let Err(e) = self.collector.collect().await {
                        error!("bandwidth collection failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        BandwidthCommand::CollectNow { respond_to } => {
                            let result = self.collector.collect().await;
                            let _ = respond_to.send(result);
                        }

                        BandwidthCommand::Shutdown => {
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

        debug!("bandwidth collector stopped");
    }
}

/// Handle for controlling a BandwidthActor
#[derive(Clone)]
pub struct BandwidthHandle {
    sender: mpsc::Sender<BandwidthCommand>,
    pub fleet_id: String,
}

impl BandwidthHandle {
    pub fn spawn(collector: BandwidthCollector, config: &BandwidthConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let fleet_id = collector.fleet_id.clone();

        tokio::spawn(BandwidthActor::new(collector, config, cmd_rx).run());

        Self {
            sender: cmd_tx,
            fleet_id,
        }
    }

    pub async fn collect_now(&self) -> Result<BandwidthSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BandwidthCommand::CollectNow { respond_to: tx })
            .await
            .context("failed to send CollectNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(BandwidthCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
