//! Scheduler wiring from a config file on disk

use fleet_sentinel::config::read_config_file;
use fleet_sentinel::scheduler::Scheduler;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_run_once_from_config_file() {
    let fleet_a = MockServer::start().await;
    let fleet_b = MockServer::start().await;
    let hooks = MockServer::start().await;

    mount_status_forever(&fleet_a, json!([modem("1", true), modem("2", true)])).await;
    mount_status_forever(&fleet_b, json!({ "data": [modem("9", true)] })).await;

    // no outage, no drift: the webhook must stay silent
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&hooks)
        .await;

    // the second fleet is addressed by host and port instead of a URL
    let b_url = url::Url::parse(&fleet_b.uri()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let config = json!({
        "server_name": "ci",
        "state_dir": state_dir,
        "storage": { "backend": "none" },
        "defaults": {
            "double_check_secs": 0,
            "settle_secs": 0,
            "alerts": [ { "webhook": { "url": format!("{}/hook", hooks.uri()) } } ]
        },
        "fleets": [
            { "id": "a", "api_url": fleet_a.uri() },
            { "id": "b", "name": "Fleet B", "host": b_url.host_str().unwrap(), "port": b_url.port().unwrap() }
        ]
    });
    let config_path = dir.path().join("sentinel.json");
    std::fs::write(&config_path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

    let config = read_config_file(config_path.to_str().unwrap()).unwrap();
    let scheduler = Scheduler::new(&config).await.unwrap();
    let mut runs = scheduler.run_once().await;
    runs.sort_by(|a, b| a.fleet_id.cmp(&b.fleet_id));

    assert_eq!(runs.len(), 2);
    let (a, _) = runs[0].result.as_ref().unwrap();
    let (b, _) = runs[1].result.as_ref().unwrap();
    assert_eq!(a.device_count, 2);
    assert_eq!(b.device_count, 1);

    assert!(state_dir.join("a").join("drift_state.json").exists());
    assert!(state_dir.join("b").join("drift_state.json").exists());
}

#[tokio::test]
async fn test_confirmed_outage_reaches_webhook() {
    let fleet = MockServer::start().await;
    let hooks = MockServer::start().await;

    mount_status(&fleet, json!([modem("5", false)]), 2).await;
    mount_status_forever(&fleet, json!([modem("5", true)])).await;
    mount_action(&fleet, "/apix/reset_modem_by_imei", 1).await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({ "fleet": "edge" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&hooks)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = json!({
        "server_name": "ci",
        "state_dir": dir.path(),
        "storage": { "backend": "none" },
        "fleets": [{
            "id": "edge",
            "api_url": fleet.uri(),
            "double_check_secs": 0,
            "settle_secs": 0,
            "alerts": [ { "webhook": { "url": format!("{}/hook", hooks.uri()) } } ]
        }]
    });
    let config_path = dir.path().join("sentinel.json");
    std::fs::write(&config_path, config.to_string()).unwrap();

    let config = read_config_file(config_path.to_str().unwrap()).unwrap();
    let runs = Scheduler::new(&config).await.unwrap().run_once().await;

    let (cycle, sweep) = runs[0].result.as_ref().unwrap();
    assert_eq!(cycle.confirmed, vec!["5".to_string()]);
    assert_eq!(sweep.as_ref().unwrap().recovered_count(), 1);
}
