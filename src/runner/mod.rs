//! Stage runner: drives a single stage definition to a terminal status.
//!
//! The runner validates, launches the worker (subprocess or in-process),
//! funnels its update stream into the stage state and the push hub,
//! enforces the stage timeout, and applies the retry policy. Stage outcome
//! derives from the worker result alone; stdout traffic is advisory.

pub mod parser;
pub mod subprocess;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Paths;
use crate::errors::StageError;
use crate::hub::events::EventKind;
use crate::hub::PushHub;
use crate::pipeline::state::{PipelineRequest, PipelineState, StageStatus};
use crate::progress::{MetricsStore, ProgressCalculator};
use crate::registry::{StageDefinition, ValidationOutcome};
use crate::runner::worker::{
    SharedContext, ValidationContext, WorkerContext, WorkerFailure, WorkerSink, WorkerUpdate,
};

/// Depth of the worker→runner update queue.
const UPDATE_QUEUE_CAPACITY: usize = 64;

/// Drives one stage of one pipeline.
pub struct StageRunner {
    definition: Arc<StageDefinition>,
    request: Arc<PipelineRequest>,
    paths: Arc<Paths>,
    metrics: Arc<MetricsStore>,
    hub: Arc<PushHub>,
    state: Arc<Mutex<PipelineState>>,
}

impl StageRunner {
    pub fn new(
        definition: Arc<StageDefinition>,
        request: Arc<PipelineRequest>,
        paths: Arc<Paths>,
        metrics: Arc<MetricsStore>,
        hub: Arc<PushHub>,
        state: Arc<Mutex<PipelineState>>,
    ) -> Self {
        Self {
            definition,
            request,
            paths,
            metrics,
            hub,
            state,
        }
    }

    /// Run the stage to a terminal status.
    pub async fn run(&self, cancel: CancellationToken) -> StageStatus {
        let stage_id = self.definition.id.clone();

        match self.validate() {
            ValidationOutcome::Ok => {}
            ValidationOutcome::Skip(reason) => {
                info!(stage = %stage_id, %reason, "stage skipped");
                self.finish_stage(StageStatus::Skipped, None, Some(reason))
                    .await;
                return StageStatus::Skipped;
            }
            ValidationOutcome::Fail(reason) => {
                warn!(stage = %stage_id, %reason, "stage validation failed");
                self.publish_error(&StageError::Validation(reason.clone()), false);
                self.finish_stage(StageStatus::Failed, Some(reason), None)
                    .await;
                return StageStatus::Failed;
            }
        }

        let max_attempts = self
            .request
            .max_attempts_override()
            .unwrap_or(self.definition.retry.max_attempts)
            .max(1);

        let mut attempt = 1;
        loop {
            self.begin_attempt(attempt, max_attempts).await;

            match self.run_attempt(&cancel).await {
                Ok(()) => {
                    self.finish_stage(StageStatus::Completed, None, None).await;
                    return StageStatus::Completed;
                }
                Err(err) => {
                    let will_retry =
                        err.is_retryable() && attempt < max_attempts && !cancel.is_cancelled();
                    self.publish_error(&err, will_retry);

                    if will_retry {
                        let backoff = self.definition.retry.backoff_for(attempt);
                        debug!(
                            stage = %stage_id,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            "stage attempt failed, backing off"
                        );
                        // Observers see the failed attempt even though the
                        // stage state itself stays non-terminal.
                        self.hub.publish_kind(EventKind::StageStatus {
                            pipeline_id: self.request.pipeline_id.clone(),
                            stage: stage_id.clone(),
                            status: StageStatus::Failed,
                            message: Some(format!(
                                "attempt {attempt} failed, retrying"
                            )),
                        });
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => {
                                self.finish_stage(
                                    StageStatus::Cancelled,
                                    Some("cancelled during retry backoff".into()),
                                    None,
                                )
                                .await;
                                return StageStatus::Cancelled;
                            }
                        }
                        attempt += 1;
                        continue;
                    }

                    let status = match &err {
                        StageError::Cancelled | StageError::Timeout(_) => StageStatus::Cancelled,
                        _ => StageStatus::Failed,
                    };
                    self.finish_stage(status, Some(err.to_string()), None).await;
                    return status;
                }
            }
        }
    }

    fn validate(&self) -> ValidationOutcome {
        match &self.definition.validator {
            Some(validator) => {
                let ctx = ValidationContext {
                    request: &self.request,
                    paths: &self.paths,
                };
                validator.validate(&ctx)
            }
            None => ValidationOutcome::Ok,
        }
    }

    /// One worker invocation under the stage timeout.
    async fn run_attempt(&self, cancel: &CancellationToken) -> Result<(), StageError> {
        let stage_cancel = cancel.child_token();
        let (sink, mut updates) = WorkerSink::channel(UPDATE_QUEUE_CAPACITY);

        let ctx = Arc::new(WorkerContext {
            pipeline_id: self.request.pipeline_id.clone(),
            stage_id: self.definition.id.clone(),
            paths: self.paths.clone(),
            request: self.request.clone(),
            shared: SharedContext::new(self.state.clone()),
            cancel: stage_cancel.clone(),
            sink,
        });

        let worker = self.definition.worker.clone();
        let worker_task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { worker.run(&ctx).await })
        };
        drop(ctx);

        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let flag = timed_out.clone();
            let token = stage_cancel.clone();
            let timeout = self.definition.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        };

        let mut calculator = ProgressCalculator::new(
            &self.request.pipeline_id,
            &self.definition.id,
            self.request.estimated_items(),
            self.metrics.clone(),
        )
        .with_metadata(json!({
            "mode": self.request.mode.to_string(),
            "from": self.request.from_date,
            "to": self.request.to_date,
        }));

        // Initial snapshot so observers get an ETA (historical, if any)
        // before the first item completes.
        self.hub
            .publish_kind(calculator.snapshot("starting", None));

        let mut last_failure: Option<WorkerFailure> = None;
        while let Some(update) = updates.recv().await {
            self.handle_update(update, &mut calculator, &mut last_failure)
                .await;
        }

        let result = worker_task
            .await
            .map_err(|e| StageError::Io(std::io::Error::other(e)))?;
        watchdog.abort();

        match result {
            Ok(()) => {
                if let Err(e) = calculator.complete() {
                    // Metrics are advisory; never fail a finished stage on them.
                    error!(stage = %self.definition.id, error = %e, "failed to persist stage timings");
                }
                Ok(())
            }
            Err(StageError::Cancelled) if timed_out.load(Ordering::SeqCst) => {
                Err(StageError::Timeout(self.definition.timeout))
            }
            Err(StageError::NonZeroExit { code }) => {
                // A structured non-recoverable error from the worker refines
                // the plain exit code and vetoes retry.
                match last_failure {
                    Some(f) if !f.recoverable => Err(StageError::Worker {
                        code: f.code,
                        message: f.message,
                        recoverable: false,
                        hint: f.hint,
                    }),
                    _ => Err(StageError::NonZeroExit { code }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_update(
        &self,
        update: WorkerUpdate,
        calculator: &mut ProgressCalculator,
        last_failure: &mut Option<WorkerFailure>,
    ) {
        match update {
            WorkerUpdate::Progress {
                current,
                total,
                message,
                details,
            } => {
                if let Some(total) = total {
                    if total != calculator.total() {
                        calculator.adjust_total(total);
                    }
                }
                calculator.update(current);
                let pct = calculator.percentage();
                {
                    let mut state = self.state.lock().await;
                    if let Some(stage) = state.stage_mut(&self.definition.id) {
                        stage.raise_progress(pct);
                        if !message.is_empty() {
                            stage.message = message.clone();
                        }
                    }
                }
                self.hub
                    .publish_kind(calculator.snapshot(&message, details));
            }
            WorkerUpdate::Status { status, message } => {
                let text = if message.is_empty() { status } else { message };
                {
                    let mut state = self.state.lock().await;
                    if let Some(stage) = state.stage_mut(&self.definition.id) {
                        stage.message = text.clone();
                    }
                }
                self.hub.publish_kind(EventKind::StageStatus {
                    pipeline_id: self.request.pipeline_id.clone(),
                    stage: self.definition.id.clone(),
                    status: StageStatus::Running,
                    message: Some(text),
                });
            }
            WorkerUpdate::Output { level, message } => {
                self.hub.publish_kind(EventKind::Output {
                    pipeline_id: self.request.pipeline_id.clone(),
                    stage: Some(self.definition.id.clone()),
                    level,
                    message,
                });
            }
            WorkerUpdate::Error(failure) => {
                self.hub.publish_kind(EventKind::Error {
                    pipeline_id: Some(self.request.pipeline_id.clone()),
                    stage: Some(self.definition.id.clone()),
                    code: failure.code.clone(),
                    message: failure.message.clone(),
                    details: None,
                    recoverable: failure.recoverable,
                    hint: failure.hint.clone(),
                });
                *last_failure = Some(failure);
            }
            WorkerUpdate::Data {
                subtype,
                action,
                file,
            } => {
                self.hub.publish_kind(EventKind::DataUpdate {
                    subtype,
                    action,
                    data: file,
                });
            }
        }
    }

    async fn begin_attempt(&self, attempt: u32, max_attempts: u32) {
        {
            let mut state = self.state.lock().await;
            if let Some(stage) = state.stage_mut(&self.definition.id) {
                stage.begin_attempt(attempt);
                stage.status = StageStatus::Running;
                if stage.started_at.is_none() {
                    stage.started_at = Some(Utc::now());
                }
            }
        }
        let message = (attempt > 1).then(|| format!("attempt {attempt} of {max_attempts}"));
        self.hub.publish_kind(EventKind::StageStatus {
            pipeline_id: self.request.pipeline_id.clone(),
            stage: self.definition.id.clone(),
            status: StageStatus::Running,
            message,
        });
    }

    async fn finish_stage(
        &self,
        status: StageStatus,
        error: Option<String>,
        message: Option<String>,
    ) {
        {
            let mut state = self.state.lock().await;
            if let Some(stage) = state.stage_mut(&self.definition.id) {
                if let Some(message) = &message {
                    stage.message = message.clone();
                }
                stage.finish(status, error.clone());
            }
        }
        self.hub.publish_kind(EventKind::StageStatus {
            pipeline_id: self.request.pipeline_id.clone(),
            stage: self.definition.id.clone(),
            status,
            message: message.or(error),
        });
    }

    fn publish_error(&self, err: &StageError, recoverable: bool) {
        let hint = match err {
            StageError::Worker { hint, .. } => hint.clone(),
            StageError::Timeout(_) => Some("raise the stage timeout or shrink the date range".into()),
            StageError::Spawn { .. } => Some("check the worker command is installed and on PATH".into()),
            _ => None,
        };
        self.hub.publish_kind(EventKind::Error {
            pipeline_id: Some(self.request.pipeline_id.clone()),
            stage: Some(self.definition.id.clone()),
            code: err.code().to_string(),
            message: err.to_string(),
            details: None,
            recoverable,
            hint,
        });
    }
}
