//! In-process fakes shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use crate::alerts::Notifier;
use crate::client::{ActionError, FetchError, ManagementApi};
use crate::{DeviceRecord, FleetSnapshot, ProxyPort};

/// Device with ping statistics matching `alive`
pub fn device(id: &str, alive: bool) -> DeviceRecord {
    DeviceRecord {
        id: Some(id.to_string()),
        dev: format!("modem{id}"),
        ping_stats: Some(if alive { "30ms, 0% loss" } else { "?ms, 100% loss" }.to_string()),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}

/// Answers fetches from a queue of snapshots (503 once drained), accepts
/// every action and answers speedtests and bandwidth reports from scripts.
#[derive(Default)]
pub struct ScriptedApi {
    snapshots: Mutex<VecDeque<FleetSnapshot>>,
    speedtests: Mutex<HashMap<String, VecDeque<Option<Value>>>>,
    /// `None` answers the port listing with HTTP 502
    ports: Mutex<Option<Vec<ProxyPort>>>,
    bandwidth: Mutex<HashMap<String, Value>>,
    actions: Mutex<Vec<(String, String)>>,
    fetches: AtomicUsize,
}

impl ScriptedApi {
    pub fn new(snapshots: Vec<FleetSnapshot>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots.into()),
            ..Default::default()
        }
    }

    /// `None` entries answer with HTTP 500
    pub fn script_speedtest(&self, id: &str, responses: Vec<Option<Value>>) {
        self.speedtests
            .lock()
            .unwrap()
            .insert(id.to_string(), responses.into());
    }

    pub fn script_ports(&self, ports: Vec<ProxyPort>) {
        *self.ports.lock().unwrap() = Some(ports);
    }

    /// Ports without a report answer with HTTP 404
    pub fn script_bandwidth(&self, port_id: &str, report: Value) {
        self.bandwidth
            .lock()
            .unwrap()
            .insert(port_id.to_string(), report);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> Vec<(String, String)> {
        self.actions.lock().unwrap().clone()
    }

    fn record(&self, action: &str, id: &str) {
        self.actions
            .lock()
            .unwrap()
            .push((action.to_string(), id.to_string()));
    }
}

#[async_trait]
impl ManagementApi for ScriptedApi {
    async fn fetch(&self) -> Result<FleetSnapshot, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.snapshots
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE))
    }

    async fn reset(&self, id: &str) -> Result<(), ActionError> {
        self.record("reset", id);
        Ok(())
    }

    async fn reboot(&self, id: &str) -> Result<(), ActionError> {
        self.record("reboot", id);
        Ok(())
    }

    async fn usb_reset(&self, id: &str) -> Result<(), ActionError> {
        self.record("usb_reset", id);
        Ok(())
    }

    async fn speedtest(&self, id: &str) -> Result<Value, ActionError> {
        self.record("speedtest", id);
        let next = self
            .speedtests
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .flatten();
        next.ok_or_else(|| ActionError::Status {
            action: "speedtest",
            device: id.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    async fn list_ports(&self) -> Result<Vec<ProxyPort>, ActionError> {
        self.ports.lock().unwrap().clone().ok_or(ActionError::Status {
            action: "list_ports",
            device: "fleet".to_string(),
            status: StatusCode::BAD_GATEWAY,
        })
    }

    async fn bandwidth(&self, port_id: &str) -> Result<Value, ActionError> {
        self.record("bandwidth", port_id);
        let report = self.bandwidth.lock().unwrap().get(port_id).cloned();
        report.ok_or_else(|| ActionError::Status {
            action: "bandwidth",
            device: port_id.to_string(),
            status: StatusCode::NOT_FOUND,
        })
    }
}

/// Fleet whose devices come back alive after a specific recovery action.
///
/// Every fetch reflects the actions issued so far, so concurrent ladders
/// observe consistent state regardless of interleaving.
#[derive(Default)]
pub struct SimulatedFleet {
    /// id -> action that revives it (`None` = never revives)
    revives_after: Mutex<HashMap<String, Option<&'static str>>>,
    alive: Mutex<HashMap<String, bool>>,
    failing: Mutex<HashMap<String, &'static str>>,
    actions: Mutex<Vec<(String, String)>>,
    fail_fetch: Mutex<bool>,
}

impl SimulatedFleet {
    pub fn with_device(self, id: &str, revives_after: Option<&'static str>) -> Self {
        self.revives_after
            .lock()
            .unwrap()
            .insert(id.to_string(), revives_after);
        self.alive.lock().unwrap().insert(id.to_string(), false);
        self
    }

    /// Make `action` fail with HTTP 502 for `id`
    pub fn failing(self, id: &str, action: &'static str) -> Self {
        self.failing.lock().unwrap().insert(id.to_string(), action);
        self
    }

    pub fn fail_fetches(&self) {
        *self.fail_fetch.lock().unwrap() = true;
    }

    pub fn actions(&self) -> Vec<(String, String)> {
        self.actions.lock().unwrap().clone()
    }

    pub fn actions_for(&self, id: &str) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter(|(_, device)| device == id)
            .map(|(action, _)| action)
            .collect()
    }

    fn act(&self, action: &'static str, id: &str) -> Result<(), ActionError> {
        self.actions
            .lock()
            .unwrap()
            .push((action.to_string(), id.to_string()));

        if self.failing.lock().unwrap().get(id) == Some(&action) {
            return Err(ActionError::Status {
                action,
                device: id.to_string(),
                status: StatusCode::BAD_GATEWAY,
            });
        }

        if self.revives_after.lock().unwrap().get(id) == Some(&Some(action)) {
            self.alive.lock().unwrap().insert(id.to_string(), true);
        }
        Ok(())
    }
}

#[async_trait]
impl ManagementApi for SimulatedFleet {
    async fn fetch(&self) -> Result<FleetSnapshot, FetchError> {
        if *self.fail_fetch.lock().unwrap() {
            return Err(FetchError::Status(StatusCode::GATEWAY_TIMEOUT));
        }
        let mut devices: Vec<DeviceRecord> = self
            .alive
            .lock()
            .unwrap()
            .iter()
            .map(|(id, alive)| device(id, *alive))
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(FleetSnapshot::new("fleet", devices))
    }

    async fn reset(&self, id: &str) -> Result<(), ActionError> {
        self.act("reset", id)
    }

    async fn reboot(&self, id: &str) -> Result<(), ActionError> {
        self.act("reboot", id)
    }

    async fn usb_reset(&self, id: &str) -> Result<(), ActionError> {
        self.act("usb_reset", id)
    }

    async fn speedtest(&self, id: &str) -> Result<Value, ActionError> {
        Err(ActionError::Status {
            action: "speedtest",
            device: id.to_string(),
            status: StatusCode::NOT_IMPLEMENTED,
        })
    }

    async fn list_ports(&self) -> Result<Vec<ProxyPort>, ActionError> {
        Ok(vec![])
    }

    async fn bandwidth(&self, port_id: &str) -> Result<Value, ActionError> {
        Err(ActionError::Status {
            action: "bandwidth",
            device: port_id.to_string(),
            status: StatusCode::NOT_IMPLEMENTED,
        })
    }
}
