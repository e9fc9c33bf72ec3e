use std::collections::HashSet;

use crate::{DeviceRecord, FleetSnapshot};

/// A device whose battery dropped to or below the threshold
#[derive(Debug, Clone, PartialEq)]
pub struct LowBattery {
    pub device: DeviceRecord,
    pub percent: u8,
    pub threshold: u8,
}

/// Low battery alerting with one notification per discharge.
///
/// A device is reported once when it reaches the threshold and becomes
/// eligible again only after a snapshot shows it above the threshold.
#[derive(Debug, Clone)]
pub struct BatteryWatch {
    threshold: u8,
    notified: HashSet<String>,
}

impl BatteryWatch {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            notified: HashSet::new(),
        }
    }

    /// Devices that newly crossed the threshold in this snapshot
    pub fn evaluate(&mut self, snapshot: &FleetSnapshot) -> Vec<LowBattery> {
        let mut low = vec![];

        for device in &snapshot.devices {
            let (Some(id), Some(percent)) = (&device.id, device.battery) else {
                continue;
            };

            if percent > self.threshold {
                self.notified.remove(id);
            } else if self.notified.insert(id.clone()) {
                low.push(LowBattery {
                    device: device.clone(),
                    percent,
                    threshold: self.threshold,
                });
            }
        }

        low
    }
}
