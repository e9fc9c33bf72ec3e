//! Daily run-lock shared through one SQLite file
//!
//! Two backends opened on the same file stand in for two sentinel processes.
//! The metrics written by benchmarks and bandwidth collection land in the
//! same file.

use std::sync::Arc;

use chrono::NaiveDate;
use fleet_sentinel::actors::bandwidth::BandwidthCollector;
use fleet_sentinel::actors::benchmark::BenchmarkRunner;
use fleet_sentinel::actors::messages::{BandwidthSummary, BenchmarkSummary};
use fleet_sentinel::client::HttpManagementClient;
use fleet_sentinel::config::BenchmarkConfig;
use fleet_sentinel::storage::sqlite::SqliteBackend;
use fleet_sentinel::storage::{Acquire, MetricsSink, RunCounters, RunLockStore, RunStatus};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
}

#[tokio::test]
async fn test_two_processes_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sentinel.db");
    let first = Arc::new(SqliteBackend::new(&db).await.unwrap());
    let second = Arc::new(SqliteBackend::new(&db).await.unwrap());

    let mut tasks = vec![];
    for i in 0..8 {
        let backend = if i % 2 == 0 { first.clone() } else { second.clone() };
        tasks.push(tokio::spawn(async move {
            backend.try_acquire("srv", day(), "UTC", false).await.unwrap()
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() == Acquire::Acquired {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    first
        .finish("srv", day(), RunStatus::Failed, RunCounters::default(), Some("fetch failed"))
        .await
        .unwrap();

    // a failed run may be retried, but still only once
    let retries: Vec<_> = (0..4)
        .map(|i| {
            let backend = if i % 2 == 0 { first.clone() } else { second.clone() };
            tokio::spawn(async move { backend.try_acquire("srv", day(), "UTC", true).await.unwrap() })
        })
        .collect();
    let mut retried = 0;
    for task in retries {
        if task.await.unwrap() == Acquire::Acquired {
            retried += 1;
        }
    }
    assert_eq!(retried, 1);

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_benchmark_run_persists_samples() {
    let server = MockServer::start().await;
    mount_status_forever(&server, json!([modem("1", true), modem("2", true)])).await;
    Mock::given(method("GET"))
        .and(path("/apix/speedtest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "download": "94.2 Mbps",
            "upload": "850 kbps",
            "ping": "41 ms"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SqliteBackend::new(dir.path().join("sentinel.db")).await.unwrap());
    let fleet = fleet_config(&server);
    let api = Arc::new(HttpManagementClient::new(&fleet).unwrap());
    let runner = BenchmarkRunner::new(
        &fleet,
        BenchmarkConfig::default(),
        api,
        backend.clone(),
        backend.clone(),
    );

    let summary = runner.run_day(day()).await.unwrap();
    assert_eq!(
        summary,
        BenchmarkSummary::Completed {
            day: day(),
            status: RunStatus::Success,
            counters: RunCounters {
                total: 2,
                ok: 2,
                fail: 0
            },
        }
    );

    // same day again: the lock is held, no speedtest is issued
    assert_eq!(
        runner.run_day(day()).await.unwrap(),
        BenchmarkSummary::Skipped {
            day: day(),
            status: RunStatus::Success
        }
    );

    let samples = backend.query_samples("test", day()).await.unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].download_mbps, Some(94.2));
    assert_eq!(samples[0].upload_mbps, Some(0.85));
    assert_eq!(samples[0].ping_ms, Some(41.0));
    assert_eq!(samples[0].nick.as_deref(), Some("nick1"));
    assert_eq!(samples[0].online.as_deref(), Some("yes"));
}

#[tokio::test]
async fn test_bandwidth_collection_persists_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/apix/list_ports_json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "861234": [ { "portID": "p1", "LOGIN": "alice" }, { "portID": "p2" } ],
            "861235": [ { "portID": "p3", "LOGIN": "carol" } ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    for (port, day_in, day_out) in [("p1", "19.6 GB", "1.2 GB"), ("p2", "n/a", "3 MB")] {
        Mock::given(method("GET"))
            .and(path("/apix/bandwidth_report_json"))
            .and(query_param("arg", port))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "bandwidth_bytes_day_in": day_in,
                "bandwidth_bytes_day_out": day_out
            })))
            .expect(1)
            .mount(&server)
            .await;
    }
    // p3 has no report mounted and answers 404

    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(SqliteBackend::new(dir.path().join("sentinel.db")).await.unwrap());
    let fleet = fleet_config(&server);
    let api = Arc::new(HttpManagementClient::new(&fleet).unwrap());

    let summary = BandwidthCollector::new(&fleet, api, backend.clone())
        .collect()
        .await
        .unwrap();
    assert_eq!(
        summary,
        BandwidthSummary {
            ports: 3,
            stored: 1,
            failed: 2
        }
    );

    let rows = backend.query_bandwidth("test").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].device_id, "861234");
    assert_eq!(rows[0].port_id, "p1");
    assert_eq!(rows[0].login.as_deref(), Some("alice"));
    assert_eq!(rows[0].fleet_name, "Test Fleet");
    assert_eq!((rows[0].day_in_bytes, rows[0].day_out_bytes), (19_600_000_000, 1_200_000_000));
}
