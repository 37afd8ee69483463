//! Run-scoped wiring for one pipeline: its cancellation token, fatal error
//! capture, metrics reporter and the scheduler task itself.

use super::scheduler::PipelineScheduler;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry;
use anyhow::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// What a pipeline task hands back when it finishes: the scheduler, so the
/// runner can start it again, and how the run ended.
pub(crate) type PipelineExit = (PipelineScheduler, Result<()>);

pub(crate) struct PipelineHandle {
    pipeline_id: String,
    run_token: CancellationToken,
    fatal_handler: FatalErrorHandler,
    metrics_handle: Option<JoinHandle<()>>,
    task: JoinHandle<PipelineExit>,
}

impl PipelineHandle {
    /// Spawns `scheduler` under a child of `shutdown_root`. `running` counts
    /// live run loops.
    pub(crate) fn spawn(
        mut scheduler: PipelineScheduler,
        shutdown_root: &CancellationToken,
        running: Arc<watch::Sender<usize>>,
    ) -> Self {
        let pipeline_id = scheduler.pipeline_id().to_owned();
        let run_token = shutdown_root.child_token();
        let fatal_handler = FatalErrorHandler::new(pipeline_id.clone(), run_token.clone());

        let metrics_handle = telemetry::spawn_metrics_reporter(
            pipeline_id.clone(),
            scheduler.telemetry(),
            scheduler.progress(),
            run_token.clone(),
            scheduler.options().metrics_interval,
        );

        running.send_modify(|count| *count += 1);
        let task = {
            let run_token = run_token.clone();
            let fatal_handler = fatal_handler.clone();
            tokio::spawn(async move {
                let result = scheduler.run(run_token.clone(), fatal_handler).await;
                // Stops the metrics reporter when the loop ends on its own.
                run_token.cancel();
                running.send_modify(|count| *count = count.saturating_sub(1));
                (scheduler, result)
            })
        };

        Self {
            pipeline_id,
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
            task,
        }
    }

    pub(crate) fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.fatal_handler.error()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the pipeline (the current tick still completes) and waits for
    /// its tasks.
    pub(crate) async fn shutdown(mut self) -> Result<PipelineExit, JoinError> {
        self.run_token.cancel();
        let exit = self.task.await;

        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(pipeline = %self.pipeline_id, error = %err, "metrics reporter task panicked");
            }
        }

        exit
    }
}
