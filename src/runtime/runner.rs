use crate::processor::lifecycle::PipelineHandle;
use crate::processor::scheduler::{PipelineScheduler, SchedulerState, StateProbe};
use crate::runtime::progress::ProgressTracker;
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Read-only handles on a pipeline that outlive its task.
#[derive(Clone)]
struct PipelineMonitor {
    pipeline_id: String,
    telemetry: Arc<Telemetry>,
    progress: Arc<ProgressTracker>,
    state: StateProbe,
}

/// Hosts independent pipelines and handles OS signals for graceful shutdowns.
///
/// Each pipeline runs on its own task under a child of the runner's root
/// [`CancellationToken`]. A fatal error stops only the pipeline that raised
/// it; the others keep ticking.
pub struct Runner {
    idle: Vec<PipelineScheduler>,
    handles: Vec<PipelineHandle>,
    monitors: Vec<PipelineMonitor>,
    shutdown: CancellationToken,
    running: Arc<watch::Sender<usize>>,
    started: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        let (running, _) = watch::channel(0usize);
        Self {
            idle: Vec::new(),
            handles: Vec::new(),
            monitors: Vec::new(),
            shutdown: CancellationToken::new(),
            running: Arc::new(running),
            started: false,
        }
    }

    /// Registers a pipeline. Ids must be unique within the runner, since two
    /// schedulers on one id would race on the same cursor.
    pub fn add_pipeline(&mut self, scheduler: PipelineScheduler) -> Result<()> {
        let pipeline_id = scheduler.pipeline_id().to_owned();
        if self.monitors.iter().any(|m| m.pipeline_id == pipeline_id) {
            bail!("pipeline {pipeline_id} is already registered");
        }

        self.monitors.push(PipelineMonitor {
            pipeline_id,
            telemetry: scheduler.telemetry(),
            progress: scheduler.progress(),
            state: scheduler.state_probe(),
        });

        if self.started {
            self.handles.push(PipelineHandle::spawn(
                scheduler,
                &self.shutdown,
                self.running.clone(),
            ));
        } else {
            self.idle.push(scheduler);
        }
        Ok(())
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pipeline_ids(&self) -> Vec<&str> {
        self.monitors.iter().map(|m| m.pipeline_id.as_str()).collect()
    }

    pub fn telemetry(&self, pipeline_id: &str) -> Option<Arc<Telemetry>> {
        self.monitor(pipeline_id).map(|m| m.telemetry.clone())
    }

    pub fn progress(&self, pipeline_id: &str) -> Option<Arc<ProgressTracker>> {
        self.monitor(pipeline_id).map(|m| m.progress.clone())
    }

    pub fn state(&self, pipeline_id: &str) -> Option<SchedulerState> {
        self.monitor(pipeline_id).map(|m| m.state.get())
    }

    /// Number of pipelines whose tick loop is still running.
    pub fn running_pipelines(&self) -> usize {
        *self.running.borrow()
    }

    /// `true` once `pipeline_id` was started and its loop has ended, e.g.
    /// after a fatal error.
    pub fn is_stopped(&self, pipeline_id: &str) -> bool {
        self.handles
            .iter()
            .find(|h| h.pipeline_id() == pipeline_id)
            .is_some_and(|h| h.is_finished())
    }

    /// Spawns every registered pipeline.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if self.idle.is_empty() {
            bail!("runner has no pipelines to start");
        }

        tracing::info!(pipelines = self.idle.len(), "starting runner");
        for scheduler in self.idle.drain(..) {
            self.handles.push(PipelineHandle::spawn(
                scheduler,
                &self.shutdown,
                self.running.clone(),
            ));
        }
        self.started = true;
        Ok(())
    }

    /// Stops every pipeline gracefully and returns the first fatal error, if
    /// any pipeline aborted. In-flight ticks complete before their pipeline
    /// exits. The runner can be started again afterwards.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        tracing::info!(pipelines = self.handles.len(), "stopping runner");
        self.shutdown.cancel();

        let mut first_error: Option<anyhow::Error> = None;
        for handle in std::mem::take(&mut self.handles) {
            let pipeline_id = handle.pipeline_id().to_owned();
            let captured = handle.error();

            let outcome = match handle.shutdown().await {
                Ok((scheduler, result)) => {
                    self.idle.push(scheduler);
                    result.err().or(captured)
                }
                Err(err) => {
                    tracing::error!(pipeline = %pipeline_id, error = %err, "pipeline task panicked");
                    // The scheduler went down with the task; it cannot be restarted.
                    self.monitors.retain(|m| m.pipeline_id != pipeline_id);
                    Some(anyhow!(err))
                }
            };

            if let Some(err) = outcome {
                let err = err.context(format!("pipeline {pipeline_id} aborted"));
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    tracing::error!(error = %format!("{err:#}"), "additional pipeline failure");
                }
            }
        }

        self.started = false;
        self.shutdown = CancellationToken::new();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs until a Ctrl-C (SIGINT) is received, the shutdown token is
    /// cancelled elsewhere, or every pipeline has stopped on its own.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        let mut running = self.running.subscribe();
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
            _ = running.wait_for(|count| *count == 0) => {
                tracing::warn!("every pipeline stopped; shutting down runner");
            }
        }

        self.stop().await
    }

    fn monitor(&self, pipeline_id: &str) -> Option<&PipelineMonitor> {
        self.monitors.iter().find(|m| m.pipeline_id == pipeline_id)
    }
}
