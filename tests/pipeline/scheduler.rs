use std::sync::Arc;

use crate::support::{
    fixtures::{hourly_config, Fixture},
    helpers::{assert_is_contiguous, at, init_tracing, FlakyCursor},
};
use anyhow::Result;
use bucketline::{
    Bucket, CursorStore, FileCursorStore, FnTransform, MemoryCursorStore, MemorySink,
    MemorySource, NoExclusions, PipelineScheduler, ScanStage, SchedulerOptions, SourceRecord,
    TickOutcome, TransformError, UnitStage,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{json, Value};

/// Ticks until the scheduler reports it is caught up, returning how many
/// units it committed on the way.
async fn drain(scheduler: &mut PipelineScheduler) -> Result<usize> {
    let mut committed = 0;
    loop {
        let report = scheduler.tick().await?;
        match report.outcome {
            TickOutcome::CaughtUp => return Ok(committed),
            TickOutcome::Committed => committed += 1,
            other => panic!("unexpected tick outcome {other:?}"),
        }
    }
}

fn spread(count: usize, start: DateTime<Utc>, step: TimeDelta) -> Vec<SourceRecord> {
    (0..count)
        .map(|i| {
            SourceRecord::new(
                format!("acct-{}", i % 700),
                start + step * i as i32,
                json!({ "seq": i, "amount": i % 17 }),
            )
        })
        .collect()
}

#[tokio::test]
async fn hundred_partition_hour_is_drained_once_lookback_passes() -> Result<()> {
    init_tracing();
    let fixture = Fixture::new(hourly_config(100), at(15, 6));
    fixture
        .cursor
        .append("orders", Bucket::new(at(14, 0), 99))
        .await?;

    for (i, record) in spread(5_000, at(15, 0), TimeDelta::milliseconds(700))
        .into_iter()
        .enumerate()
    {
        let record = if i % 100 == 0 {
            let key = format!("blocked-{i}");
            fixture.exclusions.insert(key.clone());
            record.with_lookup_key(key)
        } else {
            record
        };
        fixture.source.insert(record);
    }

    let mut scheduler = fixture.scheduler("orders", at(14, 0))?;

    // 15:00 is still inside truncate(now - lookback) at 15:06.
    let report = scheduler.tick().await?;
    assert_eq!(report.outcome, TickOutcome::CaughtUp);
    assert!(fixture.sink.batches().is_empty());

    fixture.clock.set(at(16, 6));
    assert_eq!(drain(&mut scheduler).await?, 100);

    assert_eq!(fixture.sink.row_count(), 4_950);
    let buckets = fixture.sink.distinct_buckets();
    assert_eq!(buckets.len(), 100);
    assert!(buckets.iter().all(|b| b.interval == at(15, 0)));

    let excluded: u64 = fixture
        .observer
        .reports()
        .iter()
        .map(|report| report.rows_excluded)
        .sum();
    assert_eq!(excluded, 50);

    let latest = fixture.cursor.get_latest("orders").await?.expect("checkpoint");
    assert_eq!(latest.bucket(), Bucket::new(at(15, 0), 99));

    let history = fixture.cursor.history("orders").await?;
    assert_eq!(history.len(), 101);
    for (idx, checkpoint) in history.iter().enumerate() {
        assert_eq!(checkpoint.sequence_no, idx as u64 + 1);
    }
    assert_is_contiguous(&fixture.observer.committed(), 100);
    Ok(())
}

#[tokio::test]
async fn empty_buckets_still_advance_with_heartbeats() -> Result<()> {
    init_tracing();
    let fixture = Fixture::new(hourly_config(4), at(12, 0));
    fixture
        .source
        .insert(SourceRecord::new("only-key", at(10, 20), json!({"v": 1})));

    let mut scheduler = fixture.scheduler("orders", at(10, 0))?;
    assert_eq!(drain(&mut scheduler).await?, 4);

    assert_eq!(fixture.sink.row_count(), 1);
    assert_eq!(fixture.sink.heartbeat_count(), 3);
    assert_eq!(fixture.sink.distinct_buckets().len(), 4);
    assert_eq!(
        fixture.cursor.get_latest("orders").await?.map(|cp| cp.bucket()),
        Some(Bucket::new(at(10, 0), 3))
    );
    Ok(())
}

#[tokio::test]
async fn rows_arriving_within_lookback_are_included() -> Result<()> {
    init_tracing();
    let fixture = Fixture::new(hourly_config(1), at(16, 4));
    let mut scheduler = fixture.scheduler("orders", at(15, 0))?;

    assert_eq!(scheduler.tick().await?.outcome, TickOutcome::CaughtUp);

    // Arrives before the bucket becomes eligible: included.
    fixture.source.insert_arriving_at(
        SourceRecord::new("acct", at(15, 50), json!({"late": false})),
        at(16, 3),
    );
    // Arrives after the bucket was processed: beyond the tolerance window.
    fixture.source.insert_arriving_at(
        SourceRecord::new("acct", at(15, 55), json!({"late": true})),
        at(16, 7),
    );

    fixture.clock.set(at(16, 5));
    let report = scheduler.tick().await?;
    assert_eq!(report.outcome, TickOutcome::Committed);
    assert_eq!(report.bucket, Some(Bucket::new(at(15, 0), 0)));
    assert_eq!(report.rows_written, 1);

    fixture.clock.set(at(16, 10));
    assert_eq!(scheduler.tick().await?.outcome, TickOutcome::CaughtUp);

    let rows: Vec<Value> = fixture
        .sink
        .batches()
        .iter()
        .flat_map(|batch| batch.rows().iter().map(|row| row.payload.clone()))
        .collect();
    assert_eq!(rows, vec![json!({"late": false})]);
    Ok(())
}

#[tokio::test]
async fn lookback_boundary_is_measured_from_the_interval_end() -> Result<()> {
    init_tracing();
    let fixture = Fixture::new(hourly_config(1), at(16, 0));
    let mut scheduler = fixture.scheduler("orders", at(15, 0))?;
    let lookback = TimeDelta::minutes(5);
    let epsilon = TimeDelta::milliseconds(1);
    let last_second = at(15, 59) + TimeDelta::seconds(59);
    let first_eligible = at(16, 0) + lookback;

    for (side, arrival) in [
        ("before", last_second + lookback - epsilon),
        ("after", last_second + lookback + epsilon),
        ("past_eligibility", first_eligible + epsilon),
    ] {
        fixture.source.insert_arriving_at(
            SourceRecord::new(format!("acct-{side}"), last_second, json!({ "side": side })),
            arrival,
        );
    }

    fixture.clock.set(first_eligible - epsilon);
    assert_eq!(scheduler.tick().await?.outcome, TickOutcome::CaughtUp);

    fixture.clock.set(first_eligible);
    let report = scheduler.tick().await?;
    assert_eq!(report.outcome, TickOutcome::Committed);
    assert_eq!(report.bucket, Some(Bucket::new(at(15, 0), 0)));

    // Both rows land before the bucket closes its lookback window, so the
    // `+epsilon` side is still delivered; only a row arriving after the first
    // eligible instant is missed.
    fixture.clock.set(at(17, 0));
    assert_eq!(scheduler.tick().await?.outcome, TickOutcome::CaughtUp);
    let rows: Vec<Value> = fixture
        .sink
        .batches()
        .iter()
        .flat_map(|batch| batch.rows().iter().map(|row| row.payload.clone()))
        .collect();
    assert_eq!(rows, vec![json!({"side": "after"}), json!({"side": "before"})]);
    Ok(())
}

#[tokio::test]
async fn replaying_a_bucket_produces_identical_batches() -> Result<()> {
    init_tracing();
    let first = Fixture::new(hourly_config(3), at(12, 0));
    first
        .source
        .extend(spread(300, at(10, 0), TimeDelta::seconds(11)));
    let mut scheduler = first.scheduler("orders", at(10, 0))?;
    drain(&mut scheduler).await?;

    // Same source, fresh cursor and sink: a full replay of the interval.
    let mut replay = Fixture::new(hourly_config(3), at(12, 0));
    replay.source = first.source.clone();
    let mut scheduler = replay.scheduler("orders", at(10, 0))?;
    drain(&mut scheduler).await?;

    let original = serde_json::to_string(&first.sink.batches())?;
    let replayed = serde_json::to_string(&replay.sink.batches())?;
    assert_eq!(original, replayed);
    assert_eq!(first.sink.row_count(), 300);
    Ok(())
}

#[tokio::test]
async fn restart_resumes_after_last_checkpoint() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("orders.cursor.jsonl");

    let mut fixture = Fixture::new(hourly_config(4), at(16, 6));
    fixture
        .source
        .extend(spread(400, at(14, 0), TimeDelta::seconds(17)));
    fixture.cursor = Arc::new(FileCursorStore::open(&path, fixture.clock()).await?);

    {
        let mut scheduler = fixture.scheduler("orders", at(14, 0))?;
        for _ in 0..3 {
            assert_eq!(scheduler.tick().await?.outcome, TickOutcome::Committed);
        }
    }

    fixture.cursor = Arc::new(FileCursorStore::open(&path, fixture.clock()).await?);
    let latest = fixture.cursor.get_latest("orders").await?.expect("checkpoint");
    assert_eq!(latest.bucket(), Bucket::new(at(14, 0), 2));

    let mut scheduler = fixture.scheduler("orders", at(14, 0))?;
    assert_eq!(drain(&mut scheduler).await?, 5);

    let committed = fixture.observer.committed();
    assert_eq!(committed.len(), 8);
    assert_is_contiguous(&committed, 4);
    assert_eq!(fixture.sink.batches().len(), 8, "no bucket written twice");
    assert_eq!(fixture.sink.row_count(), 400);
    Ok(())
}

#[tokio::test]
async fn lost_checkpoint_replays_bucket_after_restart() -> Result<()> {
    init_tracing();
    let mut fixture = Fixture::new(hourly_config(2), at(12, 0));
    fixture
        .source
        .extend(spread(40, at(10, 0), TimeDelta::seconds(60)));
    let flaky = Arc::new(FlakyCursor::new(fixture.cursor.clone()));
    fixture.cursor = flaky.clone();

    let mut scheduler = fixture.scheduler("orders", at(10, 0))?;
    assert_eq!(scheduler.tick().await?.outcome, TickOutcome::Committed);

    flaky.fail_next_appends(1);
    let err = scheduler.tick().await.expect_err("checkpoint failure");
    assert!(err.is_fatal());
    assert_eq!(err.stage(), UnitStage::CheckpointWrite);
    assert_eq!(fixture.sink.batches().len(), 2, "sink write landed");

    // The process "restarts": a new scheduler on the same store.
    let mut scheduler = fixture.scheduler("orders", at(10, 0))?;
    let report = scheduler.tick().await?;
    assert_eq!(report.bucket, Some(Bucket::new(at(10, 0), 1)));

    assert_eq!(fixture.sink.batches().len(), 3, "bucket replayed");
    assert_eq!(fixture.sink.distinct_buckets().len(), 2);
    let history = fixture.cursor.history("orders").await?;
    let buckets: Vec<Bucket> = history.iter().map(|cp| cp.bucket()).collect();
    assert_eq!(
        buckets,
        vec![Bucket::new(at(10, 0), 0), Bucket::new(at(10, 0), 1)]
    );
    Ok(())
}

#[tokio::test]
async fn failing_sink_blocks_checkpoint_until_it_recovers() -> Result<()> {
    init_tracing();
    let fixture = Fixture::new(hourly_config(2), at(12, 0));
    fixture
        .source
        .extend(spread(20, at(10, 0), TimeDelta::seconds(90)));
    let audit = MemorySink::new("audit");
    audit.fail_next(1);

    let mut scheduler = PipelineScheduler::builder("orders", fixture.config.clone())
        .origin(at(10, 0))
        .source(fixture.source.clone())
        .sink(Arc::new(fixture.sink.clone()))
        .sink(Arc::new(audit.clone()))
        .cursor(fixture.cursor.clone())
        .clock(fixture.clock())
        .build()?;

    let err = scheduler.tick().await.expect_err("audit sink rejects");
    assert_eq!(err.stage(), UnitStage::SinkWrite);
    assert!(fixture.cursor.get_latest("orders").await?.is_none());

    let report = scheduler.tick().await?;
    assert_eq!(report.bucket, Some(Bucket::new(at(10, 0), 0)));

    // The first sink saw the bucket twice; the duplicate is identical.
    let batches = fixture.sink.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0], batches[1]);
    assert_eq!(audit.batches().len(), 1);
    Ok(())
}

#[tokio::test]
async fn transform_errors_skip_records_not_units() -> Result<()> {
    init_tracing();
    let fixture = Fixture::new(hourly_config(1), at(12, 0)).with_transform(Arc::new(FnTransform(
        |record: &SourceRecord, _sink: &str| -> Result<Option<Value>, TransformError> {
            match record.payload.get("amount") {
                Some(amount) => Ok(Some(json!({ "amount": amount }))),
                None => Err(TransformError::MissingField("amount".into())),
            }
        },
    )));
    fixture.source.extend([
        SourceRecord::new("a", at(10, 1), json!({"amount": 5})),
        SourceRecord::new("b", at(10, 2), json!({"note": "no amount"})),
        SourceRecord::new("c", at(10, 3), json!({"amount": 7})),
    ]);

    let mut scheduler = fixture.scheduler("orders", at(10, 0))?;
    let report = scheduler.tick().await?;
    assert_eq!(report.outcome, TickOutcome::Committed);
    assert_eq!(report.rows_failed, 1);
    assert_eq!(report.rows_written, 2);
    assert_eq!(scheduler.telemetry().snapshot().rows_failed, 1);
    Ok(())
}

#[tokio::test]
async fn starving_bucket_escalates_but_is_never_skipped() -> Result<()> {
    init_tracing();
    let fixture = Fixture::new(hourly_config(2), at(12, 0)).with_options(SchedulerOptions {
        starvation_threshold: 2,
        ..SchedulerOptions::default()
    });
    fixture.sink.fail_next(5);

    let mut scheduler = fixture.scheduler("orders", at(10, 0))?;
    for _ in 0..5 {
        let err = scheduler.tick().await.expect_err("sink keeps failing");
        assert_eq!(err.stage(), UnitStage::SinkWrite);
    }

    let alerts = fixture.observer.alerts();
    assert_eq!(alerts.len(), 2);
    assert!(alerts
        .iter()
        .all(|alert| alert.bucket == Bucket::new(at(10, 0), 0)));
    assert_eq!(alerts[1].consecutive_failures, 4);
    assert_eq!(scheduler.telemetry().starvation_alerts(), 2);
    assert!(matches!(
        fixture.observer.reports().last().map(|r| r.outcome),
        Some(TickOutcome::Failed { starved: true, consecutive_failures: 5, .. })
    ));

    let report = scheduler.tick().await?;
    assert_eq!(report.bucket, Some(Bucket::new(at(10, 0), 0)));
    assert_eq!(scheduler.progress().consecutive_failures(), 0);
    Ok(())
}

#[tokio::test]
async fn clustered_source_scans_only_bucket_rows() -> Result<()> {
    init_tracing();
    let config = hourly_config(100);
    let source = Arc::new(MemorySource::new(&config));
    source.extend(spread(10_000, at(0, 0), TimeDelta::seconds(8)));

    let stage = ScanStage::new(
        &config,
        &SchedulerOptions::default(),
        source.clone(),
        Arc::new(NoExclusions),
    );

    let mut examined = 0;
    for partition in 0..100 {
        let outcome = stage.scan(Bucket::new(at(10, 0), partition)).await?;
        assert_eq!(
            outcome.rows_examined, outcome.rows_matched,
            "partition {partition} read rows outside its bucket"
        );
        examined += outcome.rows_examined;
    }
    // 3600s / 8s rows land in the 10:00 interval.
    assert_eq!(examined, 450);
    assert!(examined < source.len());
    Ok(())
}

#[tokio::test]
async fn independent_cursor_stores_do_not_share_progress() -> Result<()> {
    init_tracing();
    let fixture = Fixture::new(hourly_config(2), at(12, 0));
    let other_cursor: Arc<dyn CursorStore> = Arc::new(MemoryCursorStore::new(fixture.clock()));

    let mut orders = fixture.scheduler("orders", at(10, 0))?;
    orders.tick().await?;
    orders.tick().await?;

    let mut audit = PipelineScheduler::builder("audit", fixture.config.clone())
        .origin(at(10, 0))
        .source(fixture.source.clone())
        .sink(Arc::new(MemorySink::new("audit")))
        .cursor(other_cursor.clone())
        .clock(fixture.clock())
        .build()?;
    let report = audit.tick().await?;
    assert_eq!(report.bucket, Some(Bucket::new(at(10, 0), 0)));
    assert!(fixture.cursor.get_latest("audit").await?.is_none());
    assert!(other_cursor.get_latest("orders").await?.is_none());
    Ok(())
}
