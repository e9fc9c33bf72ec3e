//! Helper functions for integration tests

use std::sync::Mutex;

use async_trait::async_trait;
use fleet_sentinel::alerts::Notifier;
use fleet_sentinel::config::{Defaults, FleetConfig, ResolvedFleetConfig};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const STATUS_PATH: &str = "/apix/show_status_json";

/// Fleet pointed at the mock server with zero settle and double-check delays
pub fn fleet_config(server: &MockServer) -> ResolvedFleetConfig {
    let fleet = FleetConfig {
        id: "test".into(),
        name: Some("Test Fleet".into()),
        api_url: Some(server.uri()),
        timeout_secs: Some(2),
        settle_secs: Some(0),
        double_check_secs: Some(0),
        ..Default::default()
    };
    fleet.resolve(&Defaults::default(), "sentinel-host").unwrap()
}

pub fn modem(imei: &str, alive: bool) -> Value {
    let ping = if alive { "25ms, 0% loss" } else { "?ms, 100% loss" };
    json!({
        "modem_details": { "IMEI": imei, "NICK": format!("nick{imei}") },
        "net_details": { "DEV": format!("modem{imei}"), "IS_ONLINE": if alive { "yes" } else { "no" }, "ping_stats": ping }
    })
}

/// Serve `body` from the status path for the next `times` requests
pub async fn mount_status(server: &MockServer, body: Value, times: u64) {
    Mock::given(method("GET"))
        .and(path(STATUS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .up_to_n_times(times)
        .mount(server)
        .await;
}

/// Serve `body` from the status path for every remaining request
pub async fn mount_status_forever(server: &MockServer, body: Value) {
    Mock::given(method("GET"))
        .and(path(STATUS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

pub async fn mount_action(server: &MockServer, action_path: &str, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path(action_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "ok"})))
        .expect(expected_calls)
        .mount(server)
        .await;
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
