//! Full monitoring cycles against a mock management endpoint
//!
//! - Outage confirmed by the double-check and fixed by the first step
//! - Flapping device dropped by the double-check without any action
//! - Escalation through the whole ladder
//! - Drift state persisted to disk across actor restarts

use std::sync::Arc;

use fleet_sentinel::actors::fleet::FleetMonitorActor;
use fleet_sentinel::actors::recovery::{Outcome, RecoveryStep};
use fleet_sentinel::client::HttpManagementClient;
use fleet_sentinel::monitors::drift::{DriftOutcome, DriftState};
use fleet_sentinel::storage::{FileStateStore, MemoryStateStore, StateStore};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::MockServer;

use crate::helpers::*;

fn actor(
    server: &MockServer,
    notifier: Arc<RecordingNotifier>,
    store: Arc<dyn StateStore>,
) -> FleetMonitorActor {
    let config = fleet_config(server);
    let api = HttpManagementClient::new(&config).unwrap();
    let (_tx, rx) = mpsc::channel(1);
    FleetMonitorActor::new(config, Arc::new(api), notifier, store, rx)
}

#[tokio::test]
async fn test_outage_fixed_by_reset() {
    let server = MockServer::start().await;
    // initial poll and double-check see the modem down, the recheck sees it back
    mount_status(&server, json!([modem("1", true), modem("2", false)]), 2).await;
    mount_status_forever(&server, json!([modem("1", true), modem("2", true)])).await;
    mount_action(&server, "/apix/reset_modem_by_imei", 1).await;
    mount_action(&server, "/apix/reboot_modem_by_imei", 0).await;

    let notifier = Arc::new(RecordingNotifier::default());
    let (report, sweep) = actor(&server, notifier.clone(), Arc::new(MemoryStateStore::new()))
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.device_count, 2);
    assert_eq!(report.confirmed, vec!["2".to_string()]);

    let sweep = sweep.unwrap();
    assert_eq!(sweep.recovered.get(&RecoveryStep::Reset), Some(&1));
    assert_eq!(sweep.outcomes[0].outcome, Outcome::Recovered);

    let messages = notifier.messages();
    assert_eq!(
        messages,
        vec![
            "⚠️ [Test Fleet] 1 modem(s) offline after double-check, starting recovery:\n- modem2 (IMEI 2)"
                .to_string(),
            "🛠 [Test Fleet] modem2 (IMEI 2): starting reset".to_string(),
            "✅ [Test Fleet] modem2 (IMEI 2): recovered after reset".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_flap_dropped_by_double_check() {
    let server = MockServer::start().await;
    mount_status(&server, json!([modem("1", false)]), 1).await;
    mount_status_forever(&server, json!([modem("1", true)])).await;
    mount_action(&server, "/apix/reset_modem_by_imei", 0).await;

    let notifier = Arc::new(RecordingNotifier::default());
    let (report, sweep) = actor(&server, notifier.clone(), Arc::new(MemoryStateStore::new()))
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.suspected, 1);
    assert!(report.confirmed.is_empty());
    assert!(sweep.is_none());
    assert!(notifier.messages().is_empty());
}

#[tokio::test]
async fn test_dead_modem_walks_whole_ladder() {
    let server = MockServer::start().await;
    mount_status_forever(&server, json!([modem("7", false)])).await;
    mount_action(&server, "/apix/reset_modem_by_imei", 1).await;
    mount_action(&server, "/apix/reboot_modem_by_imei", 1).await;
    mount_action(&server, "/apix/usb_reset_modem_json", 1).await;

    let notifier = Arc::new(RecordingNotifier::default());
    let (_, sweep) = actor(&server, notifier.clone(), Arc::new(MemoryStateStore::new()))
        .run_once()
        .await
        .unwrap();

    assert_eq!(sweep.unwrap().exhausted, 1);
    let last = notifier.messages().pop().unwrap();
    assert_eq!(last, "❌ [Test Fleet] modem7 (IMEI 7): could not restore the modem");
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_cycle() {
    let server = MockServer::start().await;
    // nothing mounted: every request answers 404

    let store = Arc::new(MemoryStateStore::new());
    let result = actor(&server, Arc::new(RecordingNotifier::default()), store.clone())
        .run_once()
        .await;

    assert!(result.is_err());
    assert_eq!(store.load("test").await.unwrap(), DriftState::default());
}

#[tokio::test]
async fn test_drift_state_survives_restart() {
    let server = MockServer::start().await;
    mount_status(&server, json!([modem("1", true), modem("2", true)]), 1).await;
    mount_status_forever(&server, json!([modem("1", true)])).await;

    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
    let notifier = Arc::new(RecordingNotifier::default());

    let (first, _) = actor(&server, notifier.clone(), store.clone())
        .run_once()
        .await
        .unwrap();
    assert_eq!(first.drift, Some(DriftOutcome::Initialized(2)));

    // a fresh actor picks up the confirmed count from disk
    let (second, _) = actor(&server, notifier.clone(), Arc::new(FileStateStore::new(dir.path())))
        .run_once()
        .await
        .unwrap();
    assert_eq!(
        second.drift,
        Some(DriftOutcome::Detected {
            confirmed: 2,
            observed: 1
        })
    );

    let saved = std::fs::read_to_string(dir.path().join("test").join("drift_state.json")).unwrap();
    let saved: serde_json::Value = serde_json::from_str(&saved).unwrap();
    assert_eq!(saved["confirmedCount"], json!(2));
    assert_eq!(saved["pending"]["value"], json!(1));

    // not confirmed yet, so nobody was told
    assert!(notifier.messages().is_empty());
}
