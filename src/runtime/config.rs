use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_GRANULARITY_SECS: u64 = 60 * 60;
const DEFAULT_PARTITION_COUNT: u32 = 100;
const DEFAULT_LOOKBACK_SECS: u64 = 5 * 60;
const DEFAULT_TICK_PERIOD_MS: u64 = 1_000;
const MAX_PARTITION_COUNT: u32 = 1 << 20;

/// Grid and cadence settings for one pipeline.
///
/// All instances must be constructed via [`PipelineConfig::builder`],
/// [`PipelineConfig::new`] or [`PipelineConfig::from_env`] so invariants are
/// validated before any scheduler observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    granularity: Duration,
    partition_count: u32,
    lookback: Duration,
    tick_period: Duration,
}

pub struct PipelineConfigParams {
    pub granularity: Duration,
    pub partition_count: u32,
    pub lookback: Duration,
    pub tick_period: Duration,
}

impl PipelineConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: PipelineConfigParams) -> Result<Self> {
        let PipelineConfigParams {
            granularity,
            partition_count,
            lookback,
            tick_period,
        } = params;

        let config = Self {
            granularity,
            partition_count,
            lookback,
            tick_period,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reads `<PREFIX>_GRANULARITY_SECS`, `<PREFIX>_PARTITION_COUNT`,
    /// `<PREFIX>_LOOKBACK_SECS` and `<PREFIX>_TICK_PERIOD_MS`, falling back to
    /// one hour, 100 partitions, five minutes and one second respectively.
    pub fn from_env(prefix: &str) -> Result<Self> {
        let granularity_secs = parse_env_with_default::<u64>(
            &format!("{prefix}_GRANULARITY_SECS"),
            DEFAULT_GRANULARITY_SECS,
        )?;
        let partition_count = parse_env_with_default::<u32>(
            &format!("{prefix}_PARTITION_COUNT"),
            DEFAULT_PARTITION_COUNT,
        )?;
        let lookback_secs = parse_env_with_default::<u64>(
            &format!("{prefix}_LOOKBACK_SECS"),
            DEFAULT_LOOKBACK_SECS,
        )?;
        let tick_period_ms = parse_env_with_default::<u64>(
            &format!("{prefix}_TICK_PERIOD_MS"),
            DEFAULT_TICK_PERIOD_MS,
        )?;

        Self::new(PipelineConfigParams {
            granularity: Duration::from_secs(granularity_secs),
            partition_count,
            lookback: Duration::from_secs(lookback_secs),
            tick_period: Duration::from_millis(tick_period_ms),
        })
        .with_context(|| format!("invalid pipeline configuration from {prefix}_* variables"))
    }

    /// Width of one time bucket.
    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    /// Number of hash partitions (`N`).
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Trailing duration a bucket is held back to tolerate late rows.
    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Scheduler cadence.
    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    pub fn granularity_delta(&self) -> TimeDelta {
        to_delta(self.granularity)
    }

    pub fn lookback_delta(&self) -> TimeDelta {
        to_delta(self.lookback)
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.granularity < Duration::from_millis(1) {
            bail!("granularity must be at least 1ms");
        }

        if self.granularity.subsec_nanos() % 1_000_000 != 0 {
            bail!("granularity must be a whole number of milliseconds");
        }

        TimeDelta::from_std(self.granularity).context("granularity is out of range")?;
        TimeDelta::from_std(self.lookback).context("lookback is out of range")?;

        if self.partition_count == 0 {
            bail!("partition_count must be greater than 0");
        }

        if self.partition_count > MAX_PARTITION_COUNT {
            bail!(
                "partition_count ({}) must not exceed {}",
                self.partition_count,
                MAX_PARTITION_COUNT
            );
        }

        if self.tick_period.is_zero() {
            bail!("tick_period must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct PipelineConfigBuilder {
    granularity: Option<Duration>,
    partition_count: Option<u32>,
    lookback: Option<Duration>,
    tick_period: Option<Duration>,
}

impl PipelineConfigBuilder {
    pub fn granularity(mut self, granularity: Duration) -> Self {
        self.granularity = Some(granularity);
        self
    }

    pub fn partition_count(mut self, count: u32) -> Self {
        self.partition_count = Some(count);
        self
    }

    pub fn lookback(mut self, lookback: Duration) -> Self {
        self.lookback = Some(lookback);
        self
    }

    pub fn tick_period(mut self, period: Duration) -> Self {
        self.tick_period = Some(period);
        self
    }

    pub fn build(self) -> Result<PipelineConfig> {
        let params = PipelineConfigParams {
            granularity: self.granularity.context("granularity is required")?,
            partition_count: self
                .partition_count
                .context("partition_count is required")?,
            lookback: self
                .lookback
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_LOOKBACK_SECS)),
            tick_period: self
                .tick_period
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_TICK_PERIOD_MS)),
        };

        PipelineConfig::new(params)
    }
}

// Both durations are range-checked by `validate`.
fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("failed to parse {key}={raw:?}: {err}")),
        Ok(_) | Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}
