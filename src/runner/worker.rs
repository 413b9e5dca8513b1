//! The worker interface shared by subprocess-backed and in-process stages.
//!
//! The runner drives a `StageWorker` without knowing which kind it is:
//! both report through the same [`WorkerSink`] and honour the same
//! cancellation token.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Paths;
use crate::errors::StageError;
use crate::hub::events::{DataAction, DataFileRef, OutputLevel};
use crate::pipeline::state::{PipelineRequest, PipelineState};

/// Structured error a worker reports on its error channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub code: String,
    pub message: String,
    /// Workers tag hopeless conditions `recoverable: false` to veto retry.
    #[serde(default = "default_recoverable")]
    pub recoverable: bool,
    #[serde(default)]
    pub hint: Option<String>,
}

fn default_recoverable() -> bool {
    true
}

/// One update flowing from a worker to its runner.
#[derive(Debug, Clone)]
pub enum WorkerUpdate {
    Progress {
        current: u64,
        /// Workers that discover their real workload send it here.
        total: Option<u64>,
        message: String,
        details: Option<Value>,
    },
    Status {
        status: String,
        message: String,
    },
    Output {
        level: OutputLevel,
        message: String,
    },
    Error(WorkerFailure),
    Data {
        subtype: String,
        action: DataAction,
        file: DataFileRef,
    },
}

/// Sending half of the worker→runner update channel.
#[derive(Clone)]
pub struct WorkerSink {
    tx: mpsc::Sender<WorkerUpdate>,
}

impl WorkerSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WorkerUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, update: WorkerUpdate) {
        // The runner dropping its receiver mid-flight (cancellation) is
        // expected; the worker keeps going until its token fires.
        let _ = self.tx.send(update).await;
    }

    pub async fn progress(&self, current: u64, total: Option<u64>, message: impl Into<String>) {
        self.send(WorkerUpdate::Progress {
            current,
            total,
            message: message.into(),
            details: None,
        })
        .await;
    }

    pub async fn output(&self, level: OutputLevel, message: impl Into<String>) {
        self.send(WorkerUpdate::Output {
            level,
            message: message.into(),
        })
        .await;
    }

    pub async fn data(&self, subtype: impl Into<String>, action: DataAction, file: DataFileRef) {
        self.send(WorkerUpdate::Data {
            subtype: subtype.into(),
            action,
            file,
        })
        .await;
    }
}

/// Handle to the pipeline's shared `context` map. Writes serialize through
/// the pipeline state lock; overwriting another stage's key is permitted
/// but discouraged.
#[derive(Clone)]
pub struct SharedContext {
    state: Arc<tokio::sync::Mutex<PipelineState>>,
}

impl SharedContext {
    pub fn new(state: Arc<tokio::sync::Mutex<PipelineState>>) -> Self {
        Self { state }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().await.context.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.state.lock().await.context.insert(key.into(), value);
    }
}

/// Everything a worker may touch while running one stage.
pub struct WorkerContext {
    pub pipeline_id: String,
    pub stage_id: String,
    pub paths: Arc<Paths>,
    pub request: Arc<PipelineRequest>,
    /// Values shared with downstream stages.
    pub shared: SharedContext,
    pub cancel: CancellationToken,
    pub sink: WorkerSink,
}

/// Inputs available to a stage's pre-execution validator.
pub struct ValidationContext<'a> {
    pub request: &'a PipelineRequest,
    pub paths: &'a Paths,
}

/// A stage implementation. Subprocess-backed and in-process stages are
/// indistinguishable to the runner.
#[async_trait]
pub trait StageWorker: Send + Sync {
    async fn run(&self, ctx: &WorkerContext) -> Result<(), StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_failure_defaults_to_recoverable() {
        let failure: WorkerFailure =
            serde_json::from_str(r#"{"code": "http_500", "message": "server error"}"#).unwrap();
        assert!(failure.recoverable);
        assert!(failure.hint.is_none());
    }

    #[test]
    fn worker_failure_honours_explicit_flag() {
        let failure: WorkerFailure = serde_json::from_str(
            r#"{"code": "bad_layout", "message": "unknown sheet", "recoverable": false, "hint": "update converter"}"#,
        )
        .unwrap();
        assert!(!failure.recoverable);
        assert_eq!(failure.hint.as_deref(), Some("update converter"));
    }

    #[tokio::test]
    async fn sink_delivers_updates_in_order() {
        let (sink, mut rx) = WorkerSink::channel(8);
        sink.progress(1, Some(10), "one").await;
        sink.output(OutputLevel::Info, "hello").await;

        match rx.recv().await.unwrap() {
            WorkerUpdate::Progress { current, total, .. } => {
                assert_eq!(current, 1);
                assert_eq!(total, Some(10));
            }
            _ => panic!("expected progress first"),
        }
        match rx.recv().await.unwrap() {
            WorkerUpdate::Output { message, .. } => assert_eq!(message, "hello"),
            _ => panic!("expected output second"),
        }
    }

    #[tokio::test]
    async fn sink_survives_dropped_receiver() {
        let (sink, rx) = WorkerSink::channel(1);
        drop(rx);
        // Must not hang or panic.
        sink.progress(1, None, "ignored").await;
    }

    #[tokio::test]
    async fn shared_context_round_trips_between_stages() {
        use crate::pipeline::state::{Mode, PipelineRequest};

        let request = PipelineRequest {
            pipeline_id: "p-1".into(),
            mode: Mode::Full,
            from_date: None,
            to_date: None,
            config: serde_json::Map::new(),
            idempotency_key: None,
        };
        let state = Arc::new(tokio::sync::Mutex::new(PipelineState::new(&request, vec![])));
        let shared = SharedContext::new(state.clone());

        assert_eq!(shared.get("harvest.count").await, None);
        shared.set("harvest.count", serde_json::json!(12)).await;
        assert_eq!(
            shared.get("harvest.count").await,
            Some(serde_json::json!(12))
        );
        // The value is visible on the pipeline state itself (and thus in
        // status snapshots).
        assert_eq!(
            state.lock().await.context.get("harvest.count"),
            Some(&serde_json::json!(12))
        );
    }
}
