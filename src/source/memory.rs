use super::{BucketQuery, ScanBatch, ScanError, SourceReader, SourceRecord};
use crate::grid::Bucket;
use crate::runtime::clock::{Clock, SystemClock};
use crate::runtime::config::PipelineConfig;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Physical organisation of a [`MemorySource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLayout {
    /// Rows indexed by `(interval, partition)`; a scan touches one bucket.
    Clustered,
    /// No usable index; every scan touches every row and filters.
    Unclustered,
}

#[derive(Debug, Clone)]
struct StoredRow {
    record: SourceRecord,
    visible_from: Option<DateTime<Utc>>,
    seq: u64,
}

#[derive(Debug, Default)]
struct Rows {
    by_bucket: BTreeMap<Bucket, Vec<StoredRow>>,
    total: u64,
    next_seq: u64,
}

/// Append-only in-memory dataset implementing [`SourceReader`].
///
/// Rows can be given an arrival time to model late data: a row is invisible
/// to scans until the clock reaches its arrival time.
pub struct MemorySource {
    granularity: TimeDelta,
    partition_count: u32,
    layout: SourceLayout,
    clock: Arc<dyn Clock>,
    rows: RwLock<Rows>,
    pending_failures: AtomicU32,
    scans: AtomicU64,
}

impl MemorySource {
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            granularity: config.granularity_delta(),
            partition_count: config.partition_count(),
            layout: SourceLayout::Clustered,
            clock,
            rows: RwLock::new(Rows::default()),
            pending_failures: AtomicU32::new(0),
            scans: AtomicU64::new(0),
        }
    }

    pub fn with_layout(mut self, layout: SourceLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn layout(&self) -> SourceLayout {
        self.layout
    }

    /// Appends a row that is visible immediately.
    pub fn insert(&self, record: SourceRecord) {
        self.push(record, None);
    }

    /// Appends a row that only becomes visible once the clock reaches `arrival`.
    pub fn insert_arriving_at(&self, record: SourceRecord, arrival: DateTime<Utc>) {
        self.push(record, Some(arrival));
    }

    pub fn extend<I: IntoIterator<Item = SourceRecord>>(&self, records: I) {
        for record in records {
            self.insert(record);
        }
    }

    /// Makes the next `count` scans fail with [`ScanError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> u64 {
        self.rows.read().expect("memory source lock poisoned").total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of scans answered, including failed ones.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    fn push(&self, record: SourceRecord, visible_from: Option<DateTime<Utc>>) {
        let bucket = record.bucket(self.granularity, self.partition_count);
        let mut rows = self.rows.write().expect("memory source lock poisoned");
        let seq = rows.next_seq;
        rows.next_seq += 1;
        rows.total += 1;
        rows.by_bucket.entry(bucket).or_default().push(StoredRow {
            record,
            visible_from,
            seq,
        });
    }

    fn take_injected_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    fn collect(&self, query: &BucketQuery) -> ScanBatch {
        let now = self.clock.now();
        let rows = self.rows.read().expect("memory source lock poisoned");
        let visible = |row: &&StoredRow| row.visible_from.map_or(true, |at| at <= now);

        let same_grid =
            query.granularity == self.granularity && query.partition_count == self.partition_count;

        let (mut matched, rows_examined): (Vec<&StoredRow>, u64) =
            if self.layout == SourceLayout::Clustered && same_grid {
                let bucket_rows = rows.by_bucket.get(&query.bucket);
                let examined = bucket_rows.map_or(0, |rows| rows.len() as u64);
                let matched = bucket_rows
                    .map(|rows| rows.iter().filter(visible).collect())
                    .unwrap_or_default();
                (matched, examined)
            } else {
                let matched = rows
                    .by_bucket
                    .values()
                    .flatten()
                    .filter(|row| {
                        row.record.bucket(query.granularity, query.partition_count)
                            == query.bucket
                    })
                    .filter(visible)
                    .collect();
                (matched, rows.total)
            };

        matched.sort_by(|a, b| {
            a.record
                .event_timestamp
                .cmp(&b.record.event_timestamp)
                .then_with(|| a.record.partition_key.cmp(&b.record.partition_key))
                .then_with(|| a.seq.cmp(&b.seq))
        });

        ScanBatch {
            records: matched.into_iter().map(|row| row.record.clone()).collect(),
            rows_examined,
        }
    }
}

impl SourceReader for MemorySource {
    fn scan<'a>(&'a self, query: &'a BucketQuery) -> BoxFuture<'a, Result<ScanBatch, ScanError>> {
        Box::pin(async move {
            self.scans.fetch_add(1, Ordering::Relaxed);
            if self.take_injected_failure() {
                return Err(ScanError::Unavailable("injected source failure".into()));
            }
            Ok(self.collect(query))
        })
    }
}
