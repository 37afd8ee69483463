use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    fixtures::{hourly_config, Fixture},
    helpers::{
        assert_is_contiguous, at, init_tracing, wait_for_caught_up, wait_for_committed,
        FlakyCursor,
    },
};
use anyhow::{Context, Result};
use bucketline::{Bucket, CursorStore, Runner, SourceRecord};
use chrono::TimeDelta;
use serde_json::json;
use tokio::time::{sleep, timeout};

fn seeded(partition_count: u32) -> Fixture {
    let fixture = Fixture::new(hourly_config(partition_count), at(12, 0));
    fixture.source.extend((0..60).map(|i| {
        SourceRecord::new(
            format!("key-{i}"),
            at(10, 0) + TimeDelta::minutes(i),
            json!({ "i": i }),
        )
    }));
    fixture
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipelines_run_independently_until_stopped() -> Result<()> {
    init_tracing();
    let orders = seeded(4);
    let audit = seeded(2);

    let mut runner = Runner::new();
    runner.add_pipeline(orders.scheduler("orders", at(10, 0))?)?;
    runner.add_pipeline(audit.scheduler("audit", at(10, 0))?)?;
    assert_eq!(runner.pipeline_ids(), vec!["orders", "audit"]);

    runner.start().await?;
    let orders_telemetry = runner.telemetry("orders").context("orders telemetry")?;
    let audit_telemetry = runner.telemetry("audit").context("audit telemetry")?;
    wait_for_caught_up(&orders_telemetry, Duration::from_secs(5)).await?;
    wait_for_caught_up(&audit_telemetry, Duration::from_secs(5)).await?;
    assert_eq!(runner.running_pipelines(), 2);

    runner.stop().await?;
    assert_eq!(runner.running_pipelines(), 0);

    assert_eq!(orders.sink.distinct_buckets().len(), 4);
    assert_eq!(audit.sink.distinct_buckets().len(), 2);
    assert_eq!(orders.sink.row_count(), 60);
    assert_eq!(audit.sink.row_count(), 60);
    assert_eq!(
        runner.progress("orders").and_then(|p| p.last_bucket()),
        Some(Bucket::new(at(10, 0), 3))
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_pipeline_ids_are_rejected() -> Result<()> {
    init_tracing();
    let fixture = seeded(2);
    let mut runner = Runner::new();
    runner.add_pipeline(fixture.scheduler("orders", at(10, 0))?)?;

    let err = runner
        .add_pipeline(fixture.scheduler("orders", at(10, 0))?)
        .expect_err("second scheduler on the same id");
    assert!(format!("{err}").contains("already registered"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fatal_error_stops_only_the_failing_pipeline() -> Result<()> {
    init_tracing();
    let healthy = seeded(2);
    let mut broken = seeded(2);
    let flaky = Arc::new(FlakyCursor::new(broken.cursor.clone()));
    flaky.fail_next_appends(1);
    broken.cursor = flaky.clone();

    let mut runner = Runner::new();
    runner.add_pipeline(healthy.scheduler("healthy", at(10, 0))?)?;
    runner.add_pipeline(broken.scheduler("broken", at(10, 0))?)?;
    runner.start().await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !runner.is_stopped("broken") {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("broken pipeline did not stop");
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(broken.cursor.get_latest("broken").await?.is_none());
    assert_eq!(runner.running_pipelines(), 1);

    // The healthy pipeline keeps going after its sibling died.
    healthy.clock.set(at(13, 0));
    let healthy_telemetry = runner.telemetry("healthy").context("healthy telemetry")?;
    wait_for_committed(&healthy_telemetry, 4, Duration::from_secs(5)).await?;

    let err = runner.stop().await.expect_err("fatal error surfaces from stop");
    let message = format!("{err:#}");
    assert!(
        message.contains("pipeline broken aborted"),
        "expected broken pipeline failure, got {message}"
    );
    assert!(message.contains("checkpoint"), "got {message}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_exits_when_every_pipeline_aborts() -> Result<()> {
    init_tracing();
    let mut broken = seeded(2);
    let flaky = Arc::new(FlakyCursor::new(broken.cursor.clone()));
    flaky.fail_next_appends(1);
    broken.cursor = flaky;

    let mut runner = Runner::new();
    runner.add_pipeline(broken.scheduler("broken", at(10, 0))?)?;

    let outcome = timeout(Duration::from_secs(5), runner.run_until_ctrl_c())
        .await
        .context("runner should stop once its only pipeline aborted")?;
    let err = outcome.expect_err("fatal error should abort runner");
    assert!(format!("{err:#}").contains("pipeline broken aborted"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_the_token_ends_run_until_ctrl_c() -> Result<()> {
    init_tracing();
    let fixture = seeded(2);
    let mut runner = Runner::new();
    runner.add_pipeline(fixture.scheduler("orders", at(10, 0))?)?;

    let token = runner.cancellation_token();
    let canceller = tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    timeout(Duration::from_secs(5), runner.run_until_ctrl_c())
        .await
        .context("runner should observe external cancellation")??;
    canceller.await?;
    assert_eq!(fixture.sink.distinct_buckets().len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_can_restart_after_stop() -> Result<()> {
    init_tracing();
    let fixture = seeded(2);
    let mut runner = Runner::new();
    runner.add_pipeline(fixture.scheduler("orders", at(10, 0))?)?;

    runner.start().await?;
    let telemetry = runner.telemetry("orders").context("telemetry")?;
    wait_for_committed(&telemetry, 2, Duration::from_secs(5)).await?;
    runner.stop().await?;

    // Two more hours become eligible while the runner is down.
    fixture.clock.set(at(14, 0));
    runner.start().await?;
    wait_for_committed(&telemetry, 6, Duration::from_secs(5)).await?;
    runner.stop().await?;

    let history = fixture.cursor.history("orders").await?;
    let buckets: Vec<Bucket> = history.iter().map(|cp| cp.bucket()).collect();
    assert_eq!(buckets.len(), 6);
    assert_is_contiguous(&buckets, 2);
    assert_eq!(fixture.sink.batches().len(), 6, "restart must not replay buckets");
    Ok(())
}
