//! Runtime glue that wires configs, progress storage, telemetry, and runner
//! orchestration.

pub mod config;
pub mod progress;
pub mod protocol;
pub mod runner;
pub mod store;
pub mod telemetry;
