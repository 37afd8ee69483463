//! Runtime glue that wires configs, scheduler options, clocks, failure
//! handling, progress tracking, telemetry, and runner orchestration.

pub mod clock;
pub mod config;
pub mod fatal;
pub mod options;
pub mod progress;
pub mod runner;
pub mod telemetry;
pub mod unit;
