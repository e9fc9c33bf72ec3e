use std::sync::Arc;

use crate::DeviceRecord;
use crate::device::flag_set;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Alive,
    Offline,
}

/// Decides whether a single device needs recovery
pub trait HealthClassifier: Send + Sync {
    fn classify(&self, device: &DeviceRecord) -> Health;

    fn is_offline(&self, device: &DeviceRecord) -> bool {
        self.classify(device) == Health::Offline
    }
}

/// Which classifier a fleet uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthPolicy {
    /// Trust the vendor's online flag, exempting busy devices
    Flag,
    /// Trust the vendor's ping statistics
    #[default]
    Ping,
}

impl HealthPolicy {
    pub fn classifier(self) -> Arc<dyn HealthClassifier> {
        match self {
            HealthPolicy::Flag => Arc::new(FlagPolicy),
            HealthPolicy::Ping => Arc::new(PingPolicy),
        }
    }
}

/// Online iff the online flag is set. A device that is locked, rebooting or
/// rotating is never reported offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagPolicy;

impl HealthClassifier for FlagPolicy {
    fn classify(&self, device: &DeviceRecord) -> Health {
        if flag_set(device.online.as_ref()) || device.is_busy() {
            Health::Alive
        } else {
            Health::Offline
        }
    }
}

/// Offline iff the ping statistics are missing or report total loss
#[derive(Debug, Clone, Copy, Default)]
pub struct PingPolicy;

impl HealthClassifier for PingPolicy {
    fn classify(&self, device: &DeviceRecord) -> Health {
        if is_ping_dead(device.ping_stats.as_deref()) {
            Health::Offline
        } else {
            Health::Alive
        }
    }
}

pub fn is_ping_dead(stats: Option<&str>) -> bool {
    match stats.map(str::trim) {
        None | Some("") => true,
        Some(stats) => stats.contains("100% loss"),
    }
}
