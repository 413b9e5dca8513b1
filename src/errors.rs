//! Typed error hierarchy for the pipeline engine.
//!
//! Four top-level enums cover the four subsystems:
//! - `RegistryError` — stage registration and dependency resolution
//! - `StageError` — a single stage invocation (validation, worker, timeout)
//! - `PipelineError` — whole-pipeline failures surfaced to the control surface
//! - `LicenseError` — activation and validation failures

use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;

/// Errors from the stage registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("stage `{0}` is already registered")]
    DuplicateStage(String),

    #[error("registering `{stage}` would close a dependency cycle ({chain})")]
    CycleDetected { stage: String, chain: String },

    #[error("stage `{0}` is not registered")]
    NotFound(String),

    #[error("stage `{stage}` depends on unknown stage `{dependency}`")]
    UnknownDependency { stage: String, dependency: String },
}

/// Errors from a single stage invocation.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("failed to spawn worker `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited with code {code}")]
    NonZeroExit { code: i32 },

    /// Structured error reported by the worker on its error channel.
    #[error("worker error [{code}]: {message}")]
    Worker {
        code: String,
        message: String,
        recoverable: bool,
        hint: Option<String>,
    },

    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("stage was cancelled")]
    Cancelled,

    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Whether the retry policy may re-run the stage after this error.
    ///
    /// Validation failures, cancellation (including timeout, which is
    /// cancellation with an annotation), and worker errors tagged
    /// non-recoverable are terminal for the stage.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Validation(_) => false,
            StageError::Cancelled | StageError::Timeout(_) => false,
            StageError::Worker { recoverable, .. } => *recoverable,
            StageError::NonZeroExit { .. } => true,
            StageError::Spawn { .. } => false,
            StageError::Io(_) => true,
        }
    }

    /// Stable code for problem documents and `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Validation(_) => "validation_failed",
            StageError::Spawn { .. } => "worker_spawn_failed",
            StageError::NonZeroExit { .. } => "worker_failed",
            StageError::Worker { .. } => "worker_error",
            StageError::Timeout(_) => "timeout",
            StageError::Cancelled => "cancelled",
            StageError::Io(_) => "worker_io",
        }
    }
}

/// Errors surfaced to the control surface for a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline `{0}` not found")]
    NotFound(String),

    #[error("pipeline `{0}` is not running")]
    NotRunning(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("stage `{stage}` failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error(transparent)]
    License(#[from] LicenseError),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::NotFound(_) => "pipeline_not_found",
            PipelineError::NotRunning(_) => "pipeline_not_running",
            PipelineError::BadRequest(_) => "bad_request",
            PipelineError::Registry(_) => "registry_error",
            PipelineError::StageFailed { .. } => "stage_failed",
            PipelineError::License(e) => e.code(),
        }
    }

    /// HTTP status the problem document should carry.
    pub fn http_status(&self) -> u16 {
        match self {
            PipelineError::NotFound(_) => 404,
            PipelineError::NotRunning(_) => 409,
            PipelineError::BadRequest(_) => 400,
            PipelineError::Registry(_) => 500,
            PipelineError::StageFailed { .. } => 500,
            PipelineError::License(e) => e.http_status(),
        }
    }
}

/// Errors from license activation and validation.
#[derive(Debug, Clone, Error)]
pub enum LicenseError {
    #[error("license key not recognized")]
    InvalidKey,

    #[error("license expired on {0}")]
    Expired(NaiveDate),

    #[error("license is bound to a different machine")]
    MachineMismatch,

    #[error("no license is activated on this machine")]
    NotActivated,

    #[error("license has been revoked")]
    Revoked,

    #[error("too many activation attempts, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("license registry unreachable: {0}")]
    Network(String),

    #[error("license storage error: {0}")]
    Storage(String),
}

impl LicenseError {
    /// Stable error code for tooling.
    pub fn code(&self) -> &'static str {
        match self {
            LicenseError::InvalidKey => "invalid_key",
            LicenseError::Expired(_) => "expired",
            LicenseError::MachineMismatch => "machine_mismatch",
            LicenseError::NotActivated => "not_activated",
            LicenseError::Revoked => "revoked",
            LicenseError::RateLimited { .. } => "rate_limited",
            LicenseError::Network(_) => "network",
            LicenseError::Storage(_) => "storage",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LicenseError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            LicenseError::InvalidKey => 404,
            LicenseError::Expired(_)
            | LicenseError::MachineMismatch
            | LicenseError::NotActivated
            | LicenseError::Revoked => 403,
            LicenseError::RateLimited { .. } => 429,
            LicenseError::Network(_) => 502,
            LicenseError::Storage(_) => 500,
        }
    }

    /// Terminal until the operator re-activates; retrying the same call
    /// cannot succeed.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            LicenseError::Expired(_) | LicenseError::MachineMismatch | LicenseError::Revoked
        )
    }
}
