//! Pure next-bucket computation.

use crate::grid::{self, Bucket};
use crate::runtime::config::PipelineConfig;
use chrono::{DateTime, TimeDelta, Utc};

/// Where a pipeline currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    /// Nothing processed yet; the first bucket is `(interval, 0)`.
    Before(DateTime<Utc>),
    /// `bucket` was the last one fully processed.
    At(Bucket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Bucket(Bucket),
    /// The candidate bucket is still inside the lookback window. Nothing
    /// advances; the same computation is retried on the next tick.
    CaughtUp {
        candidate: Option<Bucket>,
        horizon: DateTime<Utc>,
    },
}

/// Computes the bucket after `position`, or `CaughtUp` when that bucket's
/// interval is not yet older than `truncate(now - lookback)`.
pub fn next(
    position: CursorPosition,
    now: DateTime<Utc>,
    lookback: TimeDelta,
    granularity: TimeDelta,
    partition_count: u32,
) -> Next {
    let horizon = grid::truncate(
        now.checked_sub_signed(lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        granularity,
    );

    let candidate = match position {
        CursorPosition::Before(origin) => Some(Bucket::new(grid::truncate(origin, granularity), 0)),
        CursorPosition::At(current) if current.partition.saturating_add(1) >= partition_count => {
            current
                .interval
                .checked_add_signed(granularity)
                .map(|interval| Bucket::new(interval, 0))
        }
        CursorPosition::At(current) => Some(Bucket::new(current.interval, current.partition + 1)),
    };

    match candidate {
        Some(bucket) if bucket.interval < horizon => Next::Bucket(bucket),
        candidate => Next::CaughtUp { candidate, horizon },
    }
}

/// [`next`] bound to a pipeline's grid settings.
#[derive(Debug, Clone, Copy)]
pub struct Sequencer {
    granularity: TimeDelta,
    lookback: TimeDelta,
    partition_count: u32,
}

impl Sequencer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            granularity: config.granularity_delta(),
            lookback: config.lookback_delta(),
            partition_count: config.partition_count(),
        }
    }

    pub fn next(&self, position: CursorPosition, now: DateTime<Utc>) -> Next {
        next(
            position,
            now,
            self.lookback,
            self.granularity,
            self.partition_count,
        )
    }
}
