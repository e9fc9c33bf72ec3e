//! Actor-based supervision
//!
//! Each fleet gets its own actor running as an independent async task. Two
//! optional actors per fleet drive the daily benchmark and the periodic
//! bandwidth collection.
//!
//! ## Architecture Overview
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │    Scheduler     │
//!                 └────────┬─────────┘
//!                          │ spawns
//!           ┌──────────────┼───────────────┐
//!           │              │               │
//!   ┌───────▼───────┐      │       ┌───────▼────────┐
//!   │ FleetMonitor  │     ...      │ BenchmarkActor │
//!   │ (fleet A)     │              │ (fleet A)      │
//!   └───────┬───────┘              └───────┬────────┘
//!           │ confirmed offline            │ run-lock, samples
//!   ┌───────▼───────┐              ┌───────▼────────┐
//!   │ Recovery      │              │ RunLockStore / │
//!   │ sweep (1 task │              │ MetricsSink    │
//!   │ per device)   │              └────────────────┘
//!   └───────────────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: every actor owns an mpsc command channel
//! 2. **Request/Response**: oneshot channels carry replies (`PollNow`, `RunNow`,
//!    `CollectNow`)
//! 3. **Structured concurrency**: a sweep is a `JoinSet` owned by the fleet actor

pub mod bandwidth;
pub mod benchmark;
pub mod fleet;
pub mod messages;
pub mod recovery;
