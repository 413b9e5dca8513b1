//! Pipeline manager: accepts requests, drives stages through the state
//! machine in dependency order, and publishes every transition.
//!
//! Each accepted request becomes one supervised task. Stages whose
//! dependencies are all satisfied run concurrently up to the configured
//! bound; a critical failure cancels everything in flight and marks
//! downstream stages cancelled without execution.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Paths, Settings};
use crate::errors::PipelineError;
use crate::hub::PushHub;
use crate::hub::events::{EventKind, OutputLevel};
use crate::pipeline::state::{
    Mode, PipelineBrief, PipelineRequest, PipelineState, PipelineStatus, StageState, StageStatus,
};
use crate::progress::MetricsStore;
use crate::registry::{StageDefinition, StageRegistry};
use crate::runner::StageRunner;

/// How often the retention sweeper looks for expired pipelines.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

struct PipelineEntry {
    state: Arc<Mutex<PipelineState>>,
    cancel: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

/// Process-wide pipeline driver and registry of live/recent executions.
pub struct PipelineManager {
    registry: Arc<StageRegistry>,
    hub: Arc<PushHub>,
    metrics: Arc<MetricsStore>,
    paths: Arc<Paths>,
    settings: Arc<Settings>,
    pipelines: StdRwLock<HashMap<String, PipelineEntry>>,
    idempotency: StdMutex<HashMap<String, String>>,
}

impl PipelineManager {
    pub fn new(
        registry: Arc<StageRegistry>,
        hub: Arc<PushHub>,
        metrics: Arc<MetricsStore>,
        paths: Arc<Paths>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            registry,
            hub,
            metrics,
            paths,
            settings,
            pipelines: StdRwLock::new(HashMap::new()),
            idempotency: StdMutex::new(HashMap::new()),
        }
    }

    /// Accept a request and launch its supervised execution task.
    ///
    /// A replayed idempotency key returns the already-running (or retained)
    /// pipeline id instead of launching a duplicate.
    pub fn start(self: &Arc<Self>, request: PipelineRequest) -> Result<String, PipelineError> {
        if let (Some(from), Some(to)) = (request.from_date, request.to_date) {
            if from > to {
                return Err(PipelineError::BadRequest(format!(
                    "from date {from} is after to date {to}"
                )));
            }
        }

        if let Some(key) = &request.idempotency_key {
            let keys = self.idempotency.lock().expect("idempotency map poisoned");
            if let Some(existing) = keys.get(key) {
                if self
                    .pipelines
                    .read()
                    .expect("pipeline map poisoned")
                    .contains_key(existing)
                {
                    return Ok(existing.clone());
                }
            }
        }

        let plan = self.registry.resolve()?;
        let stages: Vec<StageState> = plan
            .iter()
            .map(|def| StageState::new(def.id.clone(), def.name.clone()))
            .collect();

        let pipeline_id = request.pipeline_id.clone();
        let state = Arc::new(Mutex::new(PipelineState::new(&request, stages)));
        let cancel = CancellationToken::new();
        let cancel_requested = Arc::new(AtomicBool::new(false));

        self.pipelines
            .write()
            .expect("pipeline map poisoned")
            .insert(
                pipeline_id.clone(),
                PipelineEntry {
                    state: state.clone(),
                    cancel: cancel.clone(),
                    cancel_requested: cancel_requested.clone(),
                },
            );
        if let Some(key) = &request.idempotency_key {
            self.idempotency
                .lock()
                .expect("idempotency map poisoned")
                .insert(key.clone(), pipeline_id.clone());
        }

        info!(pipeline = %pipeline_id, mode = %request.mode, "pipeline accepted");

        let manager = self.clone();
        let request = Arc::new(request);
        tokio::spawn(async move {
            manager
                .execute(request, plan, state, cancel, cancel_requested)
                .await;
        });

        Ok(pipeline_id)
    }

    /// Request cancellation of a running pipeline.
    pub async fn cancel(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let (state, cancel, cancel_requested) = {
            let pipelines = self.pipelines.read().expect("pipeline map poisoned");
            let entry = pipelines
                .get(pipeline_id)
                .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?;
            (
                entry.state.clone(),
                entry.cancel.clone(),
                entry.cancel_requested.clone(),
            )
        };

        if state.lock().await.status.is_terminal() {
            return Err(PipelineError::NotRunning(pipeline_id.to_string()));
        }
        cancel_requested.store(true, Ordering::SeqCst);
        cancel.cancel();
        Ok(())
    }

    /// Snapshot of one pipeline's full state.
    pub async fn status(&self, pipeline_id: &str) -> Result<PipelineState, PipelineError> {
        let state = {
            let pipelines = self.pipelines.read().expect("pipeline map poisoned");
            pipelines
                .get(pipeline_id)
                .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?
                .state
                .clone()
        };
        let snapshot = state.lock().await.clone();
        Ok(snapshot)
    }

    /// Recent pipelines, newest first.
    pub async fn list(&self) -> Vec<PipelineBrief> {
        let states: Vec<Arc<Mutex<PipelineState>>> = {
            let pipelines = self.pipelines.read().expect("pipeline map poisoned");
            pipelines.values().map(|e| e.state.clone()).collect()
        };
        let mut briefs = Vec::with_capacity(states.len());
        for state in states {
            briefs.push(state.lock().await.brief());
        }
        briefs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        briefs
    }

    /// Periodically drop pipelines that have been terminal longer than the
    /// configured retention.
    pub fn spawn_retention_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.sweep_expired().await;
            }
        })
    }

    async fn sweep_expired(&self) {
        let retention =
            chrono::Duration::from_std(self.settings.pipeline_retention()).unwrap_or_else(|_| {
                chrono::Duration::hours(24)
            });
        let cutoff = Utc::now() - retention;

        let candidates: Vec<(String, Arc<Mutex<PipelineState>>)> = {
            let pipelines = self.pipelines.read().expect("pipeline map poisoned");
            pipelines
                .iter()
                .map(|(id, e)| (id.clone(), e.state.clone()))
                .collect()
        };

        let mut expired = Vec::new();
        for (id, state) in candidates {
            let state = state.lock().await;
            if state.status.is_terminal() && state.end_time.is_some_and(|t| t < cutoff) {
                expired.push(id);
            }
        }
        if expired.is_empty() {
            return;
        }

        let mut pipelines = self.pipelines.write().expect("pipeline map poisoned");
        let mut keys = self.idempotency.lock().expect("idempotency map poisoned");
        for id in &expired {
            pipelines.remove(id);
            keys.retain(|_, v| v != id);
            info!(pipeline = %id, "expired pipeline dropped from registry");
        }
    }

    async fn execute(
        self: Arc<Self>,
        request: Arc<PipelineRequest>,
        plan: Vec<Arc<StageDefinition>>,
        state: Arc<Mutex<PipelineState>>,
        cancel: CancellationToken,
        cancel_requested: Arc<AtomicBool>,
    ) {
        let pipeline_id = request.pipeline_id.clone();

        // A full re-derivation invalidates everything the dashboard shows.
        if request.mode == Mode::Full {
            self.hub.publish_kind(EventKind::PipelineReset {});
        }

        state.lock().await.advance(PipelineStatus::Running);
        self.hub.publish_kind(EventKind::PipelineStatus {
            pipeline_id: pipeline_id.clone(),
            status: PipelineStatus::Running,
        });

        let defs: HashMap<String, Arc<StageDefinition>> = plan
            .iter()
            .map(|d| (d.id.clone(), d.clone()))
            .collect();
        let mut statuses: HashMap<String, StageStatus> = plan
            .iter()
            .map(|d| (d.id.clone(), StageStatus::Pending))
            .collect();
        // Failed-but-forgivable stages (non-critical) and the stages
        // cancelled purely in their shadow.
        let mut excused: HashSet<String> = HashSet::new();

        let (done_tx, mut done_rx) = mpsc::channel::<(String, StageStatus)>(plan.len().max(1));
        let mut running = 0usize;

        loop {
            self.cascade_doomed(&plan, &mut statuses, &mut excused, &state, &pipeline_id)
                .await;

            if cancel.is_cancelled() {
                self.cancel_pending(&plan, &mut statuses, &state, &pipeline_id)
                    .await;
            } else {
                for def in &plan {
                    if running >= self.settings.max_parallel_stages.max(1) {
                        break;
                    }
                    if statuses[&def.id] != StageStatus::Pending {
                        continue;
                    }
                    let ready = def
                        .dependencies
                        .iter()
                        .all(|dep| statuses[dep].satisfies_dependency());
                    if !ready {
                        continue;
                    }

                    statuses.insert(def.id.clone(), StageStatus::Running);
                    running += 1;

                    let runner = StageRunner::new(
                        def.clone(),
                        request.clone(),
                        self.paths.clone(),
                        self.metrics.clone(),
                        self.hub.clone(),
                        state.clone(),
                    );
                    let token = cancel.child_token();
                    let tx = done_tx.clone();
                    let stage_id = def.id.clone();
                    tokio::spawn(async move {
                        let status = runner.run(token).await;
                        let _ = tx.send((stage_id, status)).await;
                    });
                }
            }

            if running == 0 {
                let any_pending = statuses.values().any(|s| *s == StageStatus::Pending);
                if !any_pending {
                    break;
                }
                // Pending stages with nothing running means every remaining
                // dependency is doomed; the cascade above resolves them on
                // the next pass.
                continue;
            }

            let Some((stage_id, status)) = done_rx.recv().await else {
                break;
            };
            running -= 1;
            statuses.insert(stage_id.clone(), status);

            let stage_failed = matches!(status, StageStatus::Failed)
                || (status == StageStatus::Cancelled && !cancel.is_cancelled());
            if stage_failed {
                let def = &defs[&stage_id];
                if def.non_critical {
                    excused.insert(stage_id.clone());
                    self.hub.publish_kind(EventKind::Output {
                        pipeline_id: pipeline_id.clone(),
                        stage: Some(stage_id.clone()),
                        level: OutputLevel::Warning,
                        message: format!("non-critical stage {stage_id} failed, continuing"),
                    });
                } else {
                    warn!(pipeline = %pipeline_id, stage = %stage_id, "critical stage failed, stopping pipeline");
                    cancel.cancel();
                }
            }
        }

        let final_status = if cancel_requested.load(Ordering::SeqCst) {
            PipelineStatus::Cancelled
        } else {
            let all_good = plan
                .iter()
                .all(|d| statuses[&d.id].satisfies_dependency() || excused.contains(&d.id));
            if all_good {
                PipelineStatus::Completed
            } else {
                PipelineStatus::Failed
            }
        };

        let summary = {
            let mut st = state.lock().await;
            if final_status == PipelineStatus::Failed {
                st.error = st
                    .stages
                    .iter()
                    .find_map(|s| s.error.clone())
                    .or_else(|| Some("pipeline failed".into()));
            }
            st.advance(final_status);
            st.summary()
        };

        info!(pipeline = %pipeline_id, status = ?final_status, "pipeline finished");
        self.hub.publish_kind(EventKind::PipelineStatus {
            pipeline_id: pipeline_id.clone(),
            status: final_status,
        });
        self.hub.publish_kind(EventKind::PipelineComplete {
            pipeline_id,
            summary,
        });
    }

    /// Cancel pending stages whose dependencies can no longer be satisfied,
    /// cascading until a fixed point. Stages doomed only by excused
    /// (non-critical) failures become excused themselves.
    async fn cascade_doomed(
        &self,
        plan: &[Arc<StageDefinition>],
        statuses: &mut HashMap<String, StageStatus>,
        excused: &mut HashSet<String>,
        state: &Arc<Mutex<PipelineState>>,
        pipeline_id: &str,
    ) {
        loop {
            let mut changed = false;
            for def in plan {
                if statuses[&def.id] != StageStatus::Pending {
                    continue;
                }
                let doomed: Vec<&String> = def
                    .dependencies
                    .iter()
                    .filter(|dep| {
                        statuses[*dep].is_terminal() && !statuses[*dep].satisfies_dependency()
                    })
                    .collect();
                if doomed.is_empty() {
                    continue;
                }
                if doomed.iter().all(|dep| excused.contains(*dep)) {
                    excused.insert(def.id.clone());
                }
                statuses.insert(def.id.clone(), StageStatus::Cancelled);
                self.mark_stage_cancelled(state, pipeline_id, &def.id, "dependency did not complete")
                    .await;
                changed = true;
            }
            if !changed {
                break;
            }
        }
    }

    async fn cancel_pending(
        &self,
        plan: &[Arc<StageDefinition>],
        statuses: &mut HashMap<String, StageStatus>,
        state: &Arc<Mutex<PipelineState>>,
        pipeline_id: &str,
    ) {
        for def in plan {
            if statuses[&def.id] == StageStatus::Pending {
                statuses.insert(def.id.clone(), StageStatus::Cancelled);
                self.mark_stage_cancelled(state, pipeline_id, &def.id, "pipeline cancelled")
                    .await;
            }
        }
    }

    async fn mark_stage_cancelled(
        &self,
        state: &Arc<Mutex<PipelineState>>,
        pipeline_id: &str,
        stage_id: &str,
        reason: &str,
    ) {
        {
            let mut st = state.lock().await;
            if let Some(stage) = st.stage_mut(stage_id) {
                stage.finish(StageStatus::Cancelled, Some(reason.to_string()));
            }
        }
        self.hub.publish_kind(EventKind::StageStatus {
            pipeline_id: pipeline_id.to_string(),
            stage: stage_id.to_string(),
            status: StageStatus::Cancelled,
            message: Some(reason.to_string()),
        });
    }
}
