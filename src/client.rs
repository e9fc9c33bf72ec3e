//! Access to a fleet's management endpoint
//!
//! One [`HttpManagementClient`] per fleet, holding a single reused
//! `reqwest::Client` configured with the fleet's timeout. Requests are never
//! retried here; retry policy belongs to the callers.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, instrument, trace};

use crate::config::ResolvedFleetConfig;
use crate::device::{device_list, port_list};
use crate::{DeviceRecord, FleetSnapshot, ProxyPort};

const RESET_PATH: &str = "/apix/reset_modem_by_imei";
const REBOOT_PATH: &str = "/apix/reboot_modem_by_imei";
const USB_RESET_PATH: &str = "/apix/usb_reset_modem_json";
const SPEEDTEST_PATH: &str = "/apix/speedtest";
const LIST_PORTS_PATH: &str = "/apix/list_ports_json";
const BANDWIDTH_PATH: &str = "/apix/bandwidth_report_json";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("status request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("status endpoint answered with HTTP {0}")]
    Status(StatusCode),

    #[error("status body is not valid JSON: {0}")]
    Body(String),

    #[error("unexpected status response shape: {0}")]
    UnexpectedShape(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{action} request for {device} failed: {source}")]
    Request {
        action: &'static str,
        device: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{action} for {device} answered with HTTP {status}")]
    Status {
        action: &'static str,
        device: String,
        status: StatusCode,
    },

    #[error("{action} for {device} returned an unusable body: {reason}")]
    Body {
        action: &'static str,
        device: String,
        reason: String,
    },

    #[error("recheck failed: {0}")]
    Recheck(#[from] FetchError),
}

/// Poll / act / recheck contract of a management endpoint
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Fetch the current device list
    async fn fetch(&self) -> Result<FleetSnapshot, FetchError>;

    /// Soft reset of the modem with the given IMEI
    async fn reset(&self, id: &str) -> Result<(), ActionError>;

    async fn reboot(&self, id: &str) -> Result<(), ActionError>;

    /// Power-cycle of the modem's USB port
    async fn usb_reset(&self, id: &str) -> Result<(), ActionError>;

    /// Run a speedtest; the body is returned as-is for the caller to parse
    async fn speedtest(&self, id: &str) -> Result<Value, ActionError>;

    /// Every proxy port of the fleet, flattened over modems
    async fn list_ports(&self) -> Result<Vec<ProxyPort>, ActionError>;

    /// Traffic report of one port; the body is returned as-is
    async fn bandwidth(&self, port_id: &str) -> Result<Value, ActionError>;
}

#[derive(Debug, Clone)]
pub struct HttpManagementClient {
    client: reqwest::Client,
    fleet_id: String,
    base_url: String,
    status_url: String,
}

impl HttpManagementClient {
    pub fn new(fleet: &ResolvedFleetConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(fleet.timeout)
            .danger_accept_invalid_certs(!fleet.verify_ssl)
            .build()?;

        Ok(Self {
            client,
            fleet_id: fleet.id.clone(),
            base_url: fleet.base_url.clone(),
            status_url: fleet.status_url.clone(),
        })
    }

    async fn get(
        &self,
        action: &'static str,
        path: &str,
        query: &[(&str, &str)],
        subject: &str,
    ) -> Result<reqwest::Response, ActionError> {
        let url = format!("{}{path}", self.base_url);
        trace!("{action}: GET {url} {query:?}");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|source| ActionError::Request {
                action,
                device: subject.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ActionError::Status {
                action,
                device: subject.to_string(),
                status: response.status(),
            });
        }

        Ok(response)
    }

    async fn act(&self, action: &'static str, path: &str, param: &str, id: &str) -> Result<(), ActionError> {
        self.get(action, path, &[(param, id)], id).await?;
        debug!("{action} accepted for {id}");
        Ok(())
    }

    /// GET returning a JSON object
    async fn get_object(
        &self,
        action: &'static str,
        path: &str,
        query: &[(&str, &str)],
        subject: &str,
    ) -> Result<Value, ActionError> {
        let response = self.get(action, path, query, subject).await?;

        let body_error = |reason: String| ActionError::Body {
            action,
            device: subject.to_string(),
            reason,
        };
        let body = response
            .text()
            .await
            .map_err(|e| body_error(e.to_string()))?;
        let value: Value = serde_json::from_str(&body).map_err(|e| body_error(e.to_string()))?;
        if !value.is_object() {
            return Err(body_error(format!("expected an object, got {}", json_kind(&value))));
        }

        Ok(value)
    }
}

#[async_trait]
impl ManagementApi for HttpManagementClient {
    #[instrument(skip(self), fields(fleet = %self.fleet_id))]
    async fn fetch(&self) -> Result<FleetSnapshot, FetchError> {
        trace!("requesting status from {}", self.status_url);

        let response = self
            .client
            .get(&self.status_url)
            .send()
            .await
            .map_err(FetchError::Request)?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let body = response.text().await.map_err(FetchError::Request)?;
        let body: Value =
            serde_json::from_str(&body).map_err(|e| FetchError::Body(e.to_string()))?;

        let kind = json_kind(&body);
        let devices = device_list(body).ok_or_else(|| {
            FetchError::UnexpectedShape(format!("expected a device array, got {kind}"))
        })?;

        let devices: Vec<DeviceRecord> = devices.iter().map(DeviceRecord::from_value).collect();
        trace!("fetched {} devices", devices.len());

        Ok(FleetSnapshot::new(self.fleet_id.clone(), devices))
    }

    #[instrument(skip(self), fields(fleet = %self.fleet_id))]
    async fn reset(&self, id: &str) -> Result<(), ActionError> {
        self.act("reset", RESET_PATH, "IMEI", id).await
    }

    #[instrument(skip(self), fields(fleet = %self.fleet_id))]
    async fn reboot(&self, id: &str) -> Result<(), ActionError> {
        self.act("reboot", REBOOT_PATH, "IMEI", id).await
    }

    #[instrument(skip(self), fields(fleet = %self.fleet_id))]
    async fn usb_reset(&self, id: &str) -> Result<(), ActionError> {
        self.act("usb_reset", USB_RESET_PATH, "arg", id).await
    }

    #[instrument(skip(self), fields(fleet = %self.fleet_id))]
    async fn speedtest(&self, id: &str) -> Result<Value, ActionError> {
        self.get_object("speedtest", SPEEDTEST_PATH, &[("arg", id)], id)
            .await
    }

    #[instrument(skip(self), fields(fleet = %self.fleet_id))]
    async fn list_ports(&self) -> Result<Vec<ProxyPort>, ActionError> {
        let body = self
            .get_object("list_ports", LIST_PORTS_PATH, &[], &self.fleet_id)
            .await?;
        let ports = port_list(&body).unwrap_or_default();
        trace!("listed {} ports", ports.len());
        Ok(ports)
    }

    #[instrument(skip(self), fields(fleet = %self.fleet_id))]
    async fn bandwidth(&self, port_id: &str) -> Result<Value, ActionError> {
        self.get_object("bandwidth", BANDWIDTH_PATH, &[("arg", port_id)], port_id)
            .await
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
