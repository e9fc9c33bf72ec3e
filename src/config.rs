use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono_tz::Tz;
use reqwest::Url;
use tracing::trace;

use crate::monitors::drift::RestartPolicy;
use crate::monitors::health::HealthPolicy;

/// Storage backend configuration for benchmark runs and samples
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (run-lock only holds for this process)
    #[serde(rename = "none")]
    None,

    /// SQLite database
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./sentinel.db")
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub fleets: Vec<FleetConfig>,

    /// Storage configuration (defaults to SQLite)
    pub storage: Option<StorageConfig>,

    /// Directory holding one sub-directory of drift state per fleet
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Name of this host in notifications (defaults to the system host name)
    pub server_name: Option<String>,
}

/// Values every fleet inherits unless it overrides them
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Defaults {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_status_path")]
    pub path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub health_policy: HealthPolicy,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    #[serde(default = "default_double_check_secs")]
    pub double_check_secs: u64,
    #[serde(default = "default_drift_window_secs")]
    pub drift_window_secs: u64,
    #[serde(default)]
    pub drift_restart: RestartPolicy,
    /// `null` disables low battery alerts
    #[serde(default = "default_battery_threshold")]
    pub battery_threshold: Option<u8>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    pub benchmark: Option<BenchmarkConfig>,
    pub bandwidth: Option<BandwidthConfig>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            path: default_status_path(),
            timeout_secs: default_timeout_secs(),
            verify_ssl: true,
            interval_secs: default_interval_secs(),
            health_policy: HealthPolicy::default(),
            settle_secs: default_settle_secs(),
            double_check_secs: default_double_check_secs(),
            drift_window_secs: default_drift_window_secs(),
            drift_restart: RestartPolicy::default(),
            battery_threshold: default_battery_threshold(),
            timezone: default_timezone(),
            alerts: vec![],
            benchmark: None,
            bandwidth: None,
        }
    }
}

/// One management endpoint and the modems behind it
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FleetConfig {
    pub id: String,
    pub name: Option<String>,

    /// Either `host` (+ optional `port`) or a full `api_url` must be given
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_url: Option<String>,

    pub scheme: Option<String>,
    pub path: Option<String>,
    pub timeout_secs: Option<u64>,
    pub verify_ssl: Option<bool>,
    pub interval_secs: Option<u64>,
    pub health_policy: Option<HealthPolicy>,
    pub settle_secs: Option<u64>,
    pub double_check_secs: Option<u64>,
    pub drift_window_secs: Option<u64>,
    pub drift_restart: Option<RestartPolicy>,
    pub battery_threshold: Option<u8>,
    pub timezone: Option<String>,

    /// Replaces the default sinks when present
    pub alerts: Option<Vec<Alert>>,
    pub benchmark: Option<BenchmarkConfig>,
    pub bandwidth: Option<BandwidthConfig>,
}

/// Daily speedtest schedule of one fleet
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_run_hour")]
    pub run_hour: u32,
    #[serde(default)]
    pub run_minute: u32,
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
    /// Run any time after the start time if the window was missed
    #[serde(default)]
    pub allow_late: bool,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_attempt_delay_secs")]
    pub attempt_delay_secs: u64,
    /// Allow a `failed` run to be retried on the same day
    #[serde(default)]
    pub retry_failed: bool,
    #[serde(default = "default_benchmark_poll_secs")]
    pub poll_secs: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_hour: default_run_hour(),
            run_minute: 0,
            window_minutes: default_window_minutes(),
            allow_late: false,
            attempts: default_attempts(),
            attempt_delay_secs: default_attempt_delay_secs(),
            retry_failed: false,
            poll_secs: default_benchmark_poll_secs(),
        }
    }
}

/// Periodic collection of per-port traffic counters
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct BandwidthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bandwidth_interval_secs")]
    pub interval_secs: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_bandwidth_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    Telegram(Telegram),
    Discord(Discord),
    Webhook(Webhook),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Telegram {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Webhook {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Discord {
    pub url: String,
    pub user_id: Option<String>,
}

/// Fleet configuration with every default applied and validated
#[derive(Debug, Clone)]
pub struct ResolvedFleetConfig {
    pub id: String,
    pub name: String,
    /// `scheme://host[:port]`, action paths are appended to it
    pub base_url: String,
    pub status_url: String,
    pub timeout: Duration,
    pub verify_ssl: bool,
    pub interval: Duration,
    pub health_policy: HealthPolicy,
    pub settle: Duration,
    pub double_check: Duration,
    pub drift_window: Duration,
    pub drift_restart: RestartPolicy,
    pub battery_threshold: Option<u8>,
    pub timezone: Tz,
    pub alerts: Vec<Alert>,
    pub benchmark: Option<BenchmarkConfig>,
    pub bandwidth: Option<BandwidthConfig>,
    pub server_name: String,
}

impl ResolvedFleetConfig {
    /// Host part of the endpoint, used in notifications
    pub fn host(&self) -> &str {
        self.base_url
            .split_once("://")
            .map_or(self.base_url.as_str(), |(_, rest)| rest)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no fleets configured")]
    NoFleets,

    #[error("fleet id must not be empty")]
    EmptyId,

    #[error("fleet `{0}` is configured more than once")]
    DuplicateFleet(String),

    #[error("fleet `{0}` needs either `host` or `api_url`")]
    MissingEndpoint(String),

    #[error("fleet `{fleet}` has an invalid api_url `{url}`")]
    InvalidApiUrl { fleet: String, url: String },

    #[error("fleet `{fleet}` uses unsupported scheme `{scheme}`")]
    InvalidScheme { fleet: String, scheme: String },

    #[error("fleet `{fleet}` uses unknown time zone `{timezone}`")]
    UnknownTimezone { fleet: String, timezone: String },

    #[error("fleet `{fleet}`: `{field}` must be greater than zero")]
    ZeroValue { fleet: String, field: &'static str },

    #[error("fleet `{fleet}`: invalid benchmark schedule: {reason}")]
    InvalidBenchmark { fleet: String, reason: String },
}

impl Config {
    /// Resolve and validate every fleet against the defaults.
    pub fn resolve_fleets(&self, server_name: &str) -> Result<Vec<ResolvedFleetConfig>, ConfigError> {
        if self.fleets.is_empty() {
            return Err(ConfigError::NoFleets);
        }

        let mut seen = HashSet::new();
        self.fleets
            .iter()
            .map(|fleet| {
                if !seen.insert(fleet.id.as_str()) {
                    return Err(ConfigError::DuplicateFleet(fleet.id.clone()));
                }
                fleet.resolve(&self.defaults, server_name)
            })
            .collect()
    }

    pub fn storage(&self) -> StorageConfig {
        self.storage.clone().unwrap_or_default()
    }
}

impl FleetConfig {
    pub fn resolve(&self, defaults: &Defaults, server_name: &str) -> Result<ResolvedFleetConfig, ConfigError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ConfigError::EmptyId);
        }
        let zero = |field| ConfigError::ZeroValue {
            fleet: id.to_string(),
            field,
        };

        let scheme = self.scheme.as_deref().unwrap_or(&defaults.scheme);
        let path = self.path.as_deref().unwrap_or(&defaults.path);
        let (base_url, status_url) = self.endpoint(id, scheme, path)?;

        let timezone = self.timezone.as_deref().unwrap_or(&defaults.timezone);
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ConfigError::UnknownTimezone {
                fleet: id.to_string(),
                timezone: timezone.to_string(),
            })?;

        let timeout_secs = self.timeout_secs.unwrap_or(defaults.timeout_secs);
        let interval_secs = self.interval_secs.unwrap_or(defaults.interval_secs);
        let drift_window_secs = self.drift_window_secs.unwrap_or(defaults.drift_window_secs);
        if timeout_secs == 0 {
            return Err(zero("timeout_secs"));
        }
        if interval_secs == 0 {
            return Err(zero("interval_secs"));
        }
        if drift_window_secs == 0 {
            return Err(zero("drift_window_secs"));
        }

        let benchmark = self
            .benchmark
            .clone()
            .or_else(|| defaults.benchmark.clone())
            .filter(|benchmark| benchmark.enabled);
        if let Some(benchmark) = &benchmark {
            validate_benchmark(id, benchmark)?;
        }

        let bandwidth = self
            .bandwidth
            .clone()
            .or_else(|| defaults.bandwidth.clone())
            .filter(|bandwidth| bandwidth.enabled);
        if bandwidth.as_ref().is_some_and(|bandwidth| bandwidth.interval_secs == 0) {
            return Err(zero("bandwidth.interval_secs"));
        }

        Ok(ResolvedFleetConfig {
            id: id.to_string(),
            name: self.name.clone().unwrap_or_else(|| id.to_string()),
            base_url,
            status_url,
            timeout: Duration::from_secs(timeout_secs),
            verify_ssl: self.verify_ssl.unwrap_or(defaults.verify_ssl),
            interval: Duration::from_secs(interval_secs),
            health_policy: self.health_policy.unwrap_or(defaults.health_policy),
            settle: Duration::from_secs(self.settle_secs.unwrap_or(defaults.settle_secs)),
            double_check: Duration::from_secs(
                self.double_check_secs.unwrap_or(defaults.double_check_secs),
            ),
            drift_window: Duration::from_secs(drift_window_secs),
            drift_restart: self.drift_restart.unwrap_or(defaults.drift_restart),
            battery_threshold: self.battery_threshold.or(defaults.battery_threshold),
            timezone,
            alerts: self.alerts.clone().unwrap_or_else(|| defaults.alerts.clone()),
            benchmark,
            bandwidth,
            server_name: server_name.to_string(),
        })
    }

    /// `(base_url, status_url)`; an explicit `api_url` wins over host/port
    fn endpoint(&self, id: &str, scheme: &str, path: &str) -> Result<(String, String), ConfigError> {
        if let Some(api_url) = &self.api_url {
            let url = Url::parse(api_url).map_err(|_| ConfigError::InvalidApiUrl {
                fleet: id.to_string(),
                url: api_url.clone(),
            })?;
            if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                return Err(ConfigError::InvalidApiUrl {
                    fleet: id.to_string(),
                    url: api_url.clone(),
                });
            }
            let base = url.origin().ascii_serialization();
            let status_url = if url.path() == "/" && !api_url.ends_with('/') {
                format!("{base}{path}")
            } else {
                api_url.clone()
            };
            return Ok((base, status_url));
        }

        let host = self
            .host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::MissingEndpoint(id.to_string()))?;
        if !matches!(scheme, "http" | "https") {
            return Err(ConfigError::InvalidScheme {
                fleet: id.to_string(),
                scheme: scheme.to_string(),
            });
        }

        // bare IPv6 literals need brackets before a port can follow
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let default_port = if scheme == "https" { 443 } else { 80 };
        let base = match self.port {
            Some(port) if port != default_port => format!("{scheme}://{host}:{port}"),
            _ => format!("{scheme}://{host}"),
        };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let status_url = format!("{base}{path}");
        Ok((base, status_url))
    }
}

fn validate_benchmark(fleet: &str, benchmark: &BenchmarkConfig) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBenchmark {
        fleet: fleet.to_string(),
        reason: reason.to_string(),
    };

    if benchmark.run_hour > 23 {
        return Err(invalid("run_hour must be between 0 and 23"));
    }
    if benchmark.run_minute > 59 {
        return Err(invalid("run_minute must be between 0 and 59"));
    }
    if benchmark.attempts == 0 {
        return Err(invalid("attempts must be at least 1"));
    }
    if benchmark.window_minutes == 0 && !benchmark.allow_late {
        return Err(invalid("window_minutes must be greater than zero"));
    }
    if benchmark.poll_secs == 0 {
        return Err(invalid("poll_secs must be greater than zero"));
    }
    Ok(())
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_status_path() -> String {
    "/apix/show_status_json".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_settle_secs() -> u64 {
    180
}

fn default_double_check_secs() -> u64 {
    60
}

fn default_drift_window_secs() -> u64 {
    300
}

fn default_battery_threshold() -> Option<u8> {
    Some(40)
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_run_hour() -> u32 {
    12
}

fn default_window_minutes() -> u32 {
    15
}

fn default_attempts() -> u32 {
    3
}

fn default_attempt_delay_secs() -> u64 {
    5
}

fn default_benchmark_poll_secs() -> u64 {
    20
}

fn default_bandwidth_interval_secs() -> u64 {
    3600
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {path}"))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {path}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
