//! Pure evaluation logic applied to fleet snapshots
//!
//! Nothing in here performs I/O apart from [`double_check::DoubleCheckGate::run`],
//! which sleeps and re-polls through the [`ManagementApi`](crate::client::ManagementApi).

pub mod battery;
pub mod double_check;
pub mod drift;
pub mod health;
