use std::time::Duration;

use tracing::{debug, info};

use crate::client::{FetchError, ManagementApi};
use crate::monitors::health::HealthClassifier;
use crate::{DeviceRecord, FleetSnapshot};

/// Two-poll debounce in front of recovery.
///
/// A device suspected offline in the first snapshot is only confirmed when a
/// second, delayed snapshot still shows it offline or no longer lists it.
#[derive(Debug, Clone, Copy)]
pub struct DoubleCheckGate {
    delay: Duration,
}

impl DoubleCheckGate {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Devices with an identifier that the classifier reports offline
    pub fn provisional(snapshot: &FleetSnapshot, classifier: &dyn HealthClassifier) -> Vec<DeviceRecord> {
        snapshot
            .devices
            .iter()
            .filter(|device| device.id.is_some() && classifier.is_offline(device))
            .cloned()
            .collect()
    }

    /// Members of `suspected` that are absent from or still offline in `second`
    pub fn confirm(
        suspected: Vec<DeviceRecord>,
        second: &FleetSnapshot,
        classifier: &dyn HealthClassifier,
    ) -> Vec<DeviceRecord> {
        suspected
            .into_iter()
            .filter(|device| {
                let Some(id) = device.id.as_deref() else {
                    return false;
                };
                match second.find(id) {
                    Some(current) if !classifier.is_offline(current) => {
                        debug!("{} recovered before double-check", device.label());
                        false
                    }
                    _ => true,
                }
            })
            .collect()
    }

    /// Wait, re-poll and confirm. A failed re-poll confirms nothing.
    pub async fn run(
        &self,
        api: &dyn ManagementApi,
        classifier: &dyn HealthClassifier,
        suspected: Vec<DeviceRecord>,
    ) -> Result<Vec<DeviceRecord>, FetchError> {
        if suspected.is_empty() {
            return Ok(suspected);
        }

        info!(
            "{} device(s) look offline, re-checking in {}s",
            suspected.len(),
            self.delay.as_secs()
        );
        tokio::time::sleep(self.delay).await;

        let second = api.fetch().await?;
        Ok(Self::confirm(suspected, &second, classifier))
    }
}
