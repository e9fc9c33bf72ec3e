//! Persistence for drift state and the daily benchmark
//!
//! ## Design
//!
//! - **Drift state**: [`StateStore`], one small JSON document per fleet,
//!   replaced atomically on every change
//! - **Run-lock**: [`RunLockStore`], a unique `(fleet_id, day)` row that decides
//!   which worker runs the daily benchmark
//! - **Samples**: [`MetricsSink`], insert-only rows per speedtest attempt and
//!   per proxy port bandwidth collection
//!
//! ## Backends
//!
//! - **SQLite** (default, feature `storage-sqlite`): run-lock holds across
//!   restarts and processes sharing the file
//! - **In-Memory**: no persistence, for `storage: none` and tests
//!
//! ## Usage
//!
//! ```no_run
//! use fleet_sentinel::storage::{RunLockStore, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./sentinel.db").await?;
//!     let day = chrono::NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
//!     backend.try_acquire("srv-1", day, "UTC", false).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;
pub mod state;

pub use backend::{Acquire, MetricsSink, RunLockStore};
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryBackend;
pub use schema::{BandwidthSample, BenchmarkSample, RunCounters, RunRecord, RunStatus};
pub use state::{FileStateStore, MemoryStateStore, StateStore};
