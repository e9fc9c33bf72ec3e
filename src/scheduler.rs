//! Wiring of config, collaborators and actors
//!
//! [`Scheduler::new`] validates the config and builds everything a fleet needs
//! (HTTP client, alert sinks, shared state store and metrics storage) without
//! starting any task. [`Scheduler::spawn`] starts the actors for continuous
//! operation, [`Scheduler::run_once`] runs one cycle per fleet and returns.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::actors::bandwidth::{BandwidthCollector, BandwidthHandle};
use crate::actors::benchmark::{BenchmarkHandle, BenchmarkRunner};
use crate::actors::fleet::{FleetHandle, FleetMonitorActor};
use crate::actors::messages::CycleReport;
use crate::actors::recovery::SweepReport;
use crate::alerts::{AlertManager, Notifier};
use crate::client::{HttpManagementClient, ManagementApi};
use crate::config::{Config, ResolvedFleetConfig, StorageConfig};
use crate::storage::{FileStateStore, InMemoryBackend, MetricsSink, RunLockStore, StateStore};
use crate::util::get_hostname;

struct Fleet {
    config: ResolvedFleetConfig,
    api: Arc<dyn ManagementApi>,
    notifier: Arc<dyn Notifier>,
}

#[derive(Clone)]
struct MetricsStorage {
    lock: Arc<dyn RunLockStore>,
    sink: Arc<dyn MetricsSink>,
}

pub struct Scheduler {
    fleets: Vec<Fleet>,
    state_store: Arc<dyn StateStore>,
    /// Only opened when at least one fleet benchmarks or collects bandwidth
    storage: Option<MetricsStorage>,
}

/// Handles of running actors
pub struct Running {
    pub fleets: Vec<FleetHandle>,
    pub benchmarks: Vec<BenchmarkHandle>,
    pub bandwidth: Vec<BandwidthHandle>,
}

/// Result of one fleet in a single-shot run
#[derive(Debug)]
pub struct FleetRun {
    pub fleet_id: String,
    pub result: Result<(CycleReport, Option<SweepReport>)>,
}

impl Scheduler {
    pub async fn new(config: &Config) -> Result<Self> {
        let server_name = config.server_name.clone().unwrap_or_else(get_hostname);
        let resolved = config
            .resolve_fleets(&server_name)
            .context("invalid configuration")?;

        let mut fleets = Vec::with_capacity(resolved.len());
        for fleet in resolved {
            let client = HttpManagementClient::new(&fleet)
                .with_context(|| format!("failed to build HTTP client for fleet `{}`", fleet.id))?;
            let notifier = AlertManager::new(fleet.name.clone(), fleet.alerts.clone(), fleet.timeout)
                .with_context(|| format!("failed to build alert client for fleet `{}`", fleet.id))?;
            debug!(
                "fleet `{}` at {} every {}s",
                fleet.id,
                fleet.status_url,
                fleet.interval.as_secs()
            );
            fleets.push(Fleet {
                config: fleet,
                api: Arc::new(client),
                notifier: Arc::new(notifier),
            });
        }

        let storage = if fleets
            .iter()
            .any(|fleet| fleet.config.benchmark.is_some() || fleet.config.bandwidth.is_some())
        {
            Some(open_storage(&config.storage()).await?)
        } else {
            None
        };

        Ok(Self {
            fleets,
            state_store: Arc::new(FileStateStore::new(&config.state_dir)),
            storage,
        })
    }

    /// Start one monitor per fleet plus the benchmark and bandwidth actors of
    /// the fleets that enable them
    pub fn spawn(&self) -> Running {
        let mut running = Running {
            fleets: vec![],
            benchmarks: vec![],
            bandwidth: vec![],
        };

        for fleet in &self.fleets {
            running.fleets.push(FleetHandle::spawn(
                fleet.config.clone(),
                fleet.api.clone(),
                fleet.notifier.clone(),
                self.state_store.clone(),
            ));

            if let (Some(benchmark), Some(storage)) = (&fleet.config.benchmark, &self.storage) {
                let runner = BenchmarkRunner::new(
                    &fleet.config,
                    benchmark.clone(),
                    fleet.api.clone(),
                    storage.lock.clone(),
                    storage.sink.clone(),
                );
                running.benchmarks.push(BenchmarkHandle::spawn(runner));
            }

            if let (Some(bandwidth), Some(storage)) = (&fleet.config.bandwidth, &self.storage) {
                let collector = BandwidthCollector::new(&fleet.config, fleet.api.clone(), storage.sink.clone());
                running.bandwidth.push(BandwidthHandle::spawn(collector, bandwidth));
            }
        }

        info!(
            "started {} fleet monitor(s), {} benchmark scheduler(s) and {} bandwidth collector(s)",
            running.fleets.len(),
            running.benchmarks.len(),
            running.bandwidth.len()
        );
        running
    }

    /// One monitoring cycle for every fleet concurrently, including recovery
    pub async fn run_once(&self) -> Vec<FleetRun> {
        let runs = self.fleets.iter().map(|fleet| {
            // no commands in single-shot mode
            let (_tx, rx) = mpsc::channel(1);
            let actor = FleetMonitorActor::new(
                fleet.config.clone(),
                fleet.api.clone(),
                fleet.notifier.clone(),
                self.state_store.clone(),
                rx,
            );
            let fleet_id = fleet.config.id.clone();
            async move {
                FleetRun {
                    fleet_id,
                    result: actor.run_once().await,
                }
            }
        });

        join_all(runs).await
    }

    /// Build from `config` and run until Ctrl-C
    pub async fn run(config: &Config) -> Result<()> {
        Self::new(config).await?.run_until_ctrl_c().await
    }

    /// Run until Ctrl-C, then stop every actor
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        let running = self.spawn();

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        info!("received Ctrl-C, shutting down");

        running.shutdown().await;
        Ok(())
    }
}

impl Running {
    pub async fn shutdown(self) {
        let fleets = self.fleets.iter().map(|handle| async move {
            if let Err(e) = handle.shutdown().await {
                warn!("fleet `{}`: {e:#}", handle.fleet_id);
            }
        });
        let benchmarks = self.benchmarks.iter().map(|handle| async move {
            if let Err(e) = handle.shutdown().await {
                warn!("benchmark `{}`: {e:#}", handle.fleet_id);
            }
        });

        let bandwidth = self.bandwidth.iter().map(|handle| async move {
            if let Err(e) = handle.shutdown().await {
                warn!("bandwidth `{}`: {e:#}", handle.fleet_id);
            }
        });

        join_all(fleets).await;
        join_all(benchmarks).await;
        join_all(bandwidth).await;
    }
}

async fn open_storage(config: &StorageConfig) -> Result<MetricsStorage> {
    match config {
        StorageConfig::None => {
            warn!("metrics storage disabled, the run-lock only holds for this process");
            let backend = Arc::new(InMemoryBackend::new());
            Ok(MetricsStorage {
                lock: backend.clone(),
                sink: backend,
            })
        }

        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => {
            let backend = crate::storage::sqlite::SqliteBackend::new(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            info!("metrics storage at {}", path.display());
            let backend = Arc::new(backend);
            Ok(MetricsStorage {
                lock: backend.clone(),
                sink: backend,
            })
        }

        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { path } => {
            tracing::error!("sqlite storage requested at {} but not compiled in", path.display());
            anyhow::bail!("this build has no sqlite support, use `\"backend\": \"none\"`")
        }
    }
}
