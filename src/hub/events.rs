//! Structured events on the push channel.
//!
//! Every event serializes as `{"type": ..., "data": {...}, "timestamp": ...}`
//! and is sent to observers as exactly one message per frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::state::{PipelineStatus, PipelineSummary, StageStatus};

/// Severity of a raw worker output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// How trustworthy the ETA figure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EtaKind {
    /// No history and nothing processed yet.
    Calculating,
    /// Derived purely from historical timings.
    Estimated,
    /// Blended with enough realized pace to trust.
    Learned,
}

/// What happened to a data artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataAction {
    Created,
    Updated,
    Deleted,
}

/// Artifact reference carried by `data_update` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileRef {
    pub filename: String,
    pub path: String,
}

/// License liveness snippet included in `connection` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseLiveness {
    pub valid: bool,
    pub days_remaining: Option<i64>,
}

/// The event payload, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    Connection {
        status: String,
        license: LicenseLiveness,
    },
    PipelineStatus {
        pipeline_id: String,
        status: PipelineStatus,
    },
    StageStatus {
        pipeline_id: String,
        stage: String,
        status: StageStatus,
        message: Option<String>,
    },
    Progress {
        pipeline_id: String,
        stage: String,
        current: u64,
        total: u64,
        percentage: u8,
        message: String,
        eta_seconds: Option<u64>,
        eta_kind: EtaKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Output {
        pipeline_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        level: OutputLevel,
        message: String,
    },
    DataUpdate {
        subtype: String,
        action: DataAction,
        data: DataFileRef,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pipeline_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    PipelineComplete {
        pipeline_id: String,
        summary: PipelineSummary,
    },
    PipelineReset {},
    Disconnect {
        reason: String,
    },
}

/// A timestamped event as delivered to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    /// The wire discriminant, useful for logging and tests.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            EventKind::Connection { .. } => "connection",
            EventKind::PipelineStatus { .. } => "pipeline_status",
            EventKind::StageStatus { .. } => "stage_status",
            EventKind::Progress { .. } => "progress",
            EventKind::Output { .. } => "output",
            EventKind::DataUpdate { .. } => "data_update",
            EventKind::Error { .. } => "error",
            EventKind::PipelineComplete { .. } => "pipeline_complete",
            EventKind::PipelineReset {} => "pipeline_reset",
            EventKind::Disconnect { .. } => "disconnect",
        }
    }
}
