//! Bucket grid arithmetic: hash partition assignment and interval truncation.
//!
//! Every source row maps to exactly one bucket `(interval, partition)`. The
//! partition is `xxh3_64(partition_key) mod N`; the interval is the event
//! timestamp floored to a multiple of the granularity since the unix epoch.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One cell of the `(interval x partition)` grid.
///
/// Buckets order by `(interval, partition)`, which is the order pipelines
/// advance through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bucket {
    pub interval: DateTime<Utc>,
    pub partition: u32,
}

impl Bucket {
    pub fn new(interval: DateTime<Utc>, partition: u32) -> Self {
        Self {
            interval,
            partition,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.interval.to_rfc3339(), self.partition)
    }
}

/// Hash a partition key onto `[0, partition_count)`.
#[allow(clippy::cast_possible_truncation)]
pub fn partition_of(key: &str, partition_count: u32) -> u32 {
    let hash = xxhash_rust::xxh3::xxh3_64(key.as_bytes());
    (hash % u64::from(partition_count.max(1))) as u32
}

/// Floors `timestamp` to the start of its granularity-wide interval.
pub fn truncate(timestamp: DateTime<Utc>, granularity: TimeDelta) -> DateTime<Utc> {
    let width = granularity.num_milliseconds().max(1);
    let millis = timestamp.timestamp_millis();
    let floored = millis - millis.rem_euclid(width);
    DateTime::<Utc>::from_timestamp_millis(floored).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Computes the bucket a row with the given key and timestamp belongs to.
pub fn bucket_of(
    key: &str,
    timestamp: DateTime<Utc>,
    granularity: TimeDelta,
    partition_count: u32,
) -> Bucket {
    Bucket::new(
        truncate(timestamp, granularity),
        partition_of(key, partition_count),
    )
}
