//! Pipeline and stage state records.
//!
//! `PipelineState` is owned by the manager; runners mutate it only through
//! the manager-held handle, and every external reader gets a clone.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pipeline scope selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Work the explicit `from..=to` date range.
    Initial,
    /// Extend from the newest local artifact to today.
    Accumulative,
    /// Re-derive everything from what is already on disk.
    Full,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Mode::Initial),
            "accumulative" => Ok(Mode::Accumulative),
            "full" => Ok(Mode::Full),
            other => Err(format!(
                "unknown mode `{other}` (expected initial, accumulative, or full)"
            )),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Initial => "initial",
            Mode::Accumulative => "accumulative",
            Mode::Full => "full",
        };
        f.write_str(s)
    }
}

/// The immutable input that launches one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub pipeline_id: String,
    pub mode: Mode,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    /// Recognized keys: `headless`, `retry.max_attempts`,
    /// `stage.<id>.skip_if_fresh`.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl PipelineRequest {
    pub fn headless(&self) -> bool {
        self.config
            .get("headless")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn max_attempts_override(&self) -> Option<u32> {
        self.config
            .get("retry.max_attempts")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
    }

    pub fn skip_if_fresh(&self, stage_id: &str) -> bool {
        self.config
            .get(&format!("stage.{stage_id}.skip_if_fresh"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Best-effort initial work estimate: one item per calendar day in the
    /// requested range. Workers refine this with their own totals.
    pub fn estimated_items(&self) -> u64 {
        match (self.from_date, self.to_date) {
            (Some(from), Some(to)) if to >= from => (to - from).num_days() as u64 + 1,
            _ => 1,
        }
    }
}

/// Status of a whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

/// Status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }

    /// Whether a dependent stage may start after this one.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

/// Mutable record of one stage within one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub id: String,
    pub name: String,
    pub status: StageStatus,
    /// 0..=100. Never decreases within a single attempt.
    pub progress: u8,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub attempt: u32,
}

impl StageState {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: StageStatus::Pending,
            progress: 0,
            message: String::new(),
            started_at: None,
            ended_at: None,
            error: None,
            metadata: serde_json::Map::new(),
            attempt: 1,
        }
    }

    /// Raise progress, ignoring regressions. Attempt boundaries call
    /// [`StageState::begin_attempt`] instead, which is the one place
    /// progress may drop back to zero.
    pub fn raise_progress(&mut self, pct: u8) {
        self.progress = self.progress.max(pct.min(100));
    }

    pub fn begin_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        self.progress = 0;
        self.error = None;
    }

    /// Assign a terminal status exactly once; later assignments are ignored.
    pub fn finish(&mut self, status: StageStatus, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
        if status == StageStatus::Completed {
            self.progress = 100;
        }
    }
}

/// Mutable record of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub id: String,
    pub status: PipelineStatus,
    /// Topological order of the resolved plan.
    pub stages: Vec<StageState>,
    /// Values stages share downstream; writes are serialized by the manager.
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Frozen copy of the request configuration.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    pub mode: Mode,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl PipelineState {
    pub fn new(request: &PipelineRequest, stages: Vec<StageState>) -> Self {
        Self {
            id: request.pipeline_id.clone(),
            status: PipelineStatus::Pending,
            stages,
            context: HashMap::new(),
            config: request.config.clone(),
            mode: request.mode,
            start_time: None,
            end_time: None,
            error: None,
        }
    }

    pub fn stage(&self, id: &str) -> Option<&StageState> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_mut(&mut self, id: &str) -> Option<&mut StageState> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    /// Advance pipeline status; terminal states stick and `end_time` is set
    /// exactly when a terminal state is entered.
    pub fn advance(&mut self, status: PipelineStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        match status {
            PipelineStatus::Running if self.start_time.is_none() => {
                self.start_time = Some(Utc::now());
            }
            s if s.is_terminal() => self.end_time = Some(Utc::now()),
            _ => {}
        }
    }

    pub fn all_stages_terminal(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_terminal())
    }

    pub fn summary(&self) -> PipelineSummary {
        let duration_ms = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        PipelineSummary {
            pipeline_id: self.id.clone(),
            status: self.status,
            duration_ms,
            stages: self
                .stages
                .iter()
                .map(|s| StageSummary {
                    id: s.id.clone(),
                    status: s.status,
                    attempts: s.attempt,
                    progress: s.progress,
                    error: s.error.clone(),
                })
                .collect(),
        }
    }

    pub fn brief(&self) -> PipelineBrief {
        PipelineBrief {
            pipeline_id: self.id.clone(),
            status: self.status,
            mode: self.mode,
            start_time: self.start_time,
            end_time: self.end_time,
            error: self.error.clone(),
        }
    }
}

/// Terminal report attached to `pipeline_complete` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    pub duration_ms: u64,
    pub stages: Vec<StageSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub id: String,
    pub status: StageStatus,
    pub attempts: u32,
    pub progress: u8,
    #[serde(default)]
    pub error: Option<String>,
}

/// Row in the `pipeline/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineBrief {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    pub mode: Mode,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}
