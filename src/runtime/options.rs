//! Operational knobs for the scheduler that do not change pipeline semantics:
//! escalation thresholds, scan timeouts, breaker tuning and metrics cadence.

use crate::runtime::telemetry::DEFAULT_METRICS_INTERVAL;
use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_STARVATION_THRESHOLD: u32 = 10;
const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SCAN_AMPLIFICATION_WARN: u64 = 10;
const DEFAULT_BREAKER_FAILURE_THRESHOLD: usize = 5;
const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Consecutive failures of the same bucket before an operator is alerted.
    pub starvation_threshold: u32,
    pub scan_timeout: Duration,
    pub metrics_interval: Duration,
    /// Rows examined per matched row above which the source layout is
    /// reported as misaligned with the bucket grid.
    pub scan_amplification_warn: u64,
    pub breaker_failure_threshold: usize,
    pub breaker_cooldown: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            starvation_threshold: DEFAULT_STARVATION_THRESHOLD,
            scan_timeout: Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECS),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            scan_amplification_warn: DEFAULT_SCAN_AMPLIFICATION_WARN,
            breaker_failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            breaker_cooldown: Duration::from_secs(DEFAULT_BREAKER_COOLDOWN_SECS),
        }
    }
}

impl SchedulerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.starvation_threshold == 0 {
            bail!("starvation_threshold must be greater than 0");
        }
        if self.scan_timeout.is_zero() {
            bail!("scan_timeout must be greater than 0");
        }
        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }
        if self.scan_amplification_warn == 0 {
            bail!("scan_amplification_warn must be greater than 0");
        }
        if self.breaker_failure_threshold == 0 {
            bail!("breaker_failure_threshold must be greater than 0");
        }
        if self.breaker_cooldown.is_zero() {
            bail!("breaker_cooldown must be greater than 0");
        }
        Ok(())
    }
}
