pub mod actors;
pub mod alerts;
pub mod client;
pub mod config;
pub mod device;
pub mod monitors;
pub mod scheduler;
pub mod storage;
pub mod units;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One modem as reported by the management endpoint's status query.
///
/// Flag fields keep the raw vendor value; interpretation happens in
/// [`device::coerce_flag`] so every consumer agrees on what "true" means.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// IMEI, the key every action endpoint is addressed by
    pub id: Option<String>,
    /// Network interface name (e.g. `modem3`)
    pub dev: String,
    pub nick: Option<String>,
    pub online: Option<Value>,
    pub locked: Option<Value>,
    pub rebooting: Option<Value>,
    pub rotating: Option<Value>,
    /// Battery percent, only for Android-backed modems
    pub battery: Option<u8>,
    /// e.g. `"35ms, 0% loss"` or `"?ms, 100% loss"`
    pub ping_stats: Option<String>,
}

impl DeviceRecord {
    /// Human readable label used in logs and notifications
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => format!("{} (IMEI {id})", self.dev),
            None => format!("{} (no IMEI)", self.dev),
        }
    }
}

/// One proxy port served through a modem, as listed by the port endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyPort {
    /// IMEI of the modem the port is bound to
    pub device_id: String,
    pub port_id: String,
    pub login: Option<String>,
}

/// Ordered device list fetched from one fleet at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub fleet_id: String,
    pub devices: Vec<DeviceRecord>,
    pub taken_at: DateTime<Utc>,
}

impl FleetSnapshot {
    pub fn new(fleet_id: impl Into<String>, devices: Vec<DeviceRecord>) -> Self {
        Self {
            fleet_id: fleet_id.into(),
            devices,
            taken_at: Utc::now(),
        }
    }

    /// Fleet size as used by drift detection (records without an IMEI count too)
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices
            .iter()
            .find(|device| device.id.as_deref() == Some(id))
    }
}
