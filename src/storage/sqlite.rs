//! SQLite storage backend
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers do not block the benchmark writers
//! - **Run-lock**: The unique key on `benchmark_runs (fleet_id, run_day)`
//!   decides races between processes sharing the database file
//! - **Migrations**: Automatic schema versioning with sqlx

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::backend::{Acquire, MetricsSink, RunLockStore};
use super::error::{StorageError, StorageResult};
use super::schema::{BandwidthSample, BenchmarkSample, RunCounters, RunRecord, RunStatus};

const DAY_FORMAT: &str = "%Y-%m-%d";

pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    /// Open (or create) the database and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path);

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        info!("database migrations complete");

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        info!("closing SQLite backend");
        self.pool.close().await;
    }

    fn day_key(day: NaiveDate) -> String {
        day.format(DAY_FORMAT).to_string()
    }

    fn parse_day(text: &str) -> StorageResult<NaiveDate> {
        NaiveDate::parse_from_str(text, DAY_FORMAT)
            .map_err(|e| StorageError::Corrupt(format!("bad run day `{text}`: {e}")))
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn run_from_row(row: &SqliteRow) -> StorageResult<RunRecord> {
        let status: String = row.try_get("status")?;
        let total: Option<i64> = row.try_get("total_devices")?;
        let ok: Option<i64> = row.try_get("ok_devices")?;
        let fail: Option<i64> = row.try_get("fail_devices")?;
        let counters = match (total, ok, fail) {
            (Some(total), Some(ok), Some(fail)) => Some(RunCounters {
                total: total as u32,
                ok: ok as u32,
                fail: fail as u32,
            }),
            _ => None,
        };

        Ok(RunRecord {
            fleet_id: row.try_get("fleet_id")?,
            day: Self::parse_day(&row.try_get::<String, _>("run_day")?)?,
            tz: row.try_get("tz")?,
            status: status.parse()?,
            started_at: Self::millis_to_timestamp(row.try_get("started_at")?),
            finished_at: row
                .try_get::<Option<i64>, _>("finished_at")?
                .map(Self::millis_to_timestamp),
            counters,
            note: row.try_get("note")?,
        })
    }

    fn sample_from_row(row: &SqliteRow) -> StorageResult<BenchmarkSample> {
        let raw: String = row.try_get("raw")?;

        Ok(BenchmarkSample {
            fleet_id: row.try_get("fleet_id")?,
            day: Self::parse_day(&row.try_get::<String, _>("run_day")?)?,
            tz: row.try_get("tz")?,
            device_id: row.try_get("device_id")?,
            nick: row.try_get("nick")?,
            online: row.try_get("online")?,
            attempt: row.try_get::<i64, _>("attempt")? as u32,
            success: row.try_get("success")?,
            download_mbps: row.try_get("download_mbps")?,
            upload_mbps: row.try_get("upload_mbps")?,
            ping_ms: row.try_get("ping_ms")?,
            raw: serde_json::from_str(&raw)?,
            error: row.try_get("error")?,
            recorded_at: Self::millis_to_timestamp(row.try_get("recorded_at")?),
        })
    }

    fn bandwidth_from_row(row: &SqliteRow) -> StorageResult<BandwidthSample> {
        let bytes = |column: &str| -> StorageResult<u64> {
            let value: i64 = row.try_get(column)?;
            u64::try_from(value).map_err(|_| StorageError::Corrupt(format!("negative {column} `{value}`")))
        };

        Ok(BandwidthSample {
            fleet_id: row.try_get("fleet_id")?,
            fleet_name: row.try_get("fleet_name")?,
            device_id: row.try_get("device_id")?,
            port_id: row.try_get("port_id")?,
            login: row.try_get("login")?,
            day_in_bytes: bytes("day_in_bytes")?,
            day_out_bytes: bytes("day_out_bytes")?,
            collected_at: Self::millis_to_timestamp(row.try_get("collected_at")?),
        })
    }
}

#[async_trait]
impl RunLockStore for SqliteBackend {
    #[instrument(skip(self))]
    async fn try_acquire(
        &self,
        fleet_id: &str,
        day: NaiveDate,
        tz: &str,
        retry_failed: bool,
    ) -> StorageResult<Acquire> {
        let day_key = Self::day_key(day);
        let now = Utc::now().timestamp_millis();

        let inserted = sqlx::query(
            r#"
            INSERT INTO benchmark_runs (fleet_id, run_day, tz, status, started_at)
            VALUES (?, ?, ?, 'running', ?)
            ON CONFLICT (fleet_id, run_day) DO NOTHING
            "#,
        )
        .bind(fleet_id)
        .bind(&day_key)
        .bind(tz)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            debug!("acquired run-lock");
            return Ok(Acquire::Acquired);
        }

        let status: String =
            sqlx::query_scalar("SELECT status FROM benchmark_runs WHERE fleet_id = ? AND run_day = ?")
                .bind(fleet_id)
                .bind(&day_key)
                .fetch_one(&self.pool)
                .await?;
        let status: RunStatus = status.parse()?;

        if status != RunStatus::Failed || !retry_failed {
            return Ok(Acquire::Held(status));
        }

        // only one of several racing retries flips the row back to running
        let retried = sqlx::query(
            r#"
            UPDATE benchmark_runs
            SET status = 'running', tz = ?, started_at = ?, finished_at = NULL,
                total_devices = NULL, ok_devices = NULL, fail_devices = NULL, note = NULL
            WHERE fleet_id = ? AND run_day = ? AND status = 'failed'
            "#,
        )
        .bind(tz)
        .bind(now)
        .bind(fleet_id)
        .bind(&day_key)
        .execute(&self.pool)
        .await?;

        if retried.rows_affected() == 1 {
            debug!("re-acquired failed run");
            Ok(Acquire::Acquired)
        } else {
            Ok(Acquire::Held(RunStatus::Running))
        }
    }

    #[instrument(skip(self))]
    async fn finish(
        &self,
        fleet_id: &str,
        day: NaiveDate,
        status: RunStatus,
        counters: RunCounters,
        note: Option<&str>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE benchmark_runs
            SET status = ?, finished_at = ?, total_devices = ?, ok_devices = ?, fail_devices = ?, note = ?
            WHERE fleet_id = ? AND run_day = ?
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(counters.total as i64)
        .bind(counters.ok as i64)
        .bind(counters.fail as i64)
        .bind(note)
        .bind(fleet_id)
        .bind(Self::day_key(day))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::QueryFailed(format!("no run of {fleet_id} for {day}")));
        }
        Ok(())
    }

    async fn get_run(&self, fleet_id: &str, day: NaiveDate) -> StorageResult<Option<RunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT fleet_id, run_day, tz, status, started_at, finished_at,
                   total_devices, ok_devices, fail_devices, note
            FROM benchmark_runs
            WHERE fleet_id = ? AND run_day = ?
            "#,
        )
        .bind(fleet_id)
        .bind(Self::day_key(day))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::run_from_row).transpose()
    }
}

#[async_trait]
impl MetricsSink for SqliteBackend {
    #[instrument(skip(self, samples), fields(count = samples.len()))]
    async fn insert_samples(&self, samples: Vec<BenchmarkSample>) -> StorageResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for sample in samples {
            let raw = serde_json::to_string(&sample.raw)?;

            sqlx::query(
                r#"
                INSERT INTO benchmark_samples (
                    fleet_id, run_day, tz, device_id, nick, online, attempt, success,
                    download_mbps, upload_mbps, ping_ms, raw, error, recorded_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&sample.fleet_id)
            .bind(Self::day_key(sample.day))
            .bind(&sample.tz)
            .bind(&sample.device_id)
            .bind(&sample.nick)
            .bind(&sample.online)
            .bind(sample.attempt as i64)
            .bind(sample.success)
            .bind(sample.download_mbps)
            .bind(sample.upload_mbps)
            .bind(sample.ping_ms)
            .bind(raw)
            .bind(&sample.error)
            .bind(sample.recorded_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query_samples(&self, fleet_id: &str, day: NaiveDate) -> StorageResult<Vec<BenchmarkSample>> {
        let rows = sqlx::query(
            r#"
            SELECT fleet_id, run_day, tz, device_id, nick, online, attempt, success,
                   download_mbps, upload_mbps, ping_ms, raw, error, recorded_at
            FROM benchmark_samples
            WHERE fleet_id = ? AND run_day = ?
            ORDER BY id ASC
            "#,
        )
        .bind(fleet_id)
        .bind(Self::day_key(day))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::sample_from_row).collect()
    }

    #[instrument(skip(self, samples), fields(count = samples.len()))]
    async fn insert_bandwidth(&self, samples: Vec<BandwidthSample>) -> StorageResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for sample in samples {
            let bytes = |value: u64| {
                i64::try_from(value).map_err(|_| StorageError::QueryFailed(format!("{value} bytes out of range")))
            };

            sqlx::query(
                r#"
                INSERT INTO bandwidth_samples (
                    fleet_id, fleet_name, device_id, port_id, login,
                    day_in_bytes, day_out_bytes, collected_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&sample.fleet_id)
            .bind(&sample.fleet_name)
            .bind(&sample.device_id)
            .bind(&sample.port_id)
            .bind(&sample.login)
            .bind(bytes(sample.day_in_bytes)?)
            .bind(bytes(sample.day_out_bytes)?)
            .bind(sample.collected_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query_bandwidth(&self, fleet_id: &str) -> StorageResult<Vec<BandwidthSample>> {
        let rows = sqlx::query(
            r#"
            SELECT fleet_id, fleet_name, device_id, port_id, login,
                   day_in_bytes, day_out_bytes, collected_at
            FROM bandwidth_samples
            WHERE fleet_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(fleet_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::bandwidth_from_row).collect()
    }
}
