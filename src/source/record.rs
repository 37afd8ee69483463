use crate::grid::{self, Bucket};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_STATUS: &str = "active";

/// One row of the upstream dataset. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub partition_key: String,
    pub event_timestamp: DateTime<Utc>,
    pub payload: Value,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_key: Option<String>,
}

impl SourceRecord {
    pub fn new(
        partition_key: impl Into<String>,
        event_timestamp: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            event_timestamp,
            payload,
            status: DEFAULT_STATUS.to_owned(),
            lookup_key: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_lookup_key(mut self, key: impl Into<String>) -> Self {
        self.lookup_key = Some(key.into());
        self
    }

    /// Key passed to the exclusion lookup; defaults to the partition key.
    pub fn lookup_key(&self) -> &str {
        self.lookup_key.as_deref().unwrap_or(&self.partition_key)
    }

    pub fn bucket(&self, granularity: TimeDelta, partition_count: u32) -> Bucket {
        grid::bucket_of(
            &self.partition_key,
            self.event_timestamp,
            granularity,
            partition_count,
        )
    }
}
