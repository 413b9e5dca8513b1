//! Subprocess-backed stage worker.
//!
//! Spawns the configured command with piped stdio, streams tagged stdout
//! lines into the worker sink, and maps termination to the stage outcome.
//! Cancellation signals the child politely, waits out a grace period, then
//! force-terminates.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::StageError;
use crate::hub::events::OutputLevel;
use crate::runner::parser;
use crate::runner::worker::{StageWorker, WorkerContext, WorkerSink, WorkerUpdate};

/// How long a signalled child gets to exit before being killed.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(10);

/// A command template with `{placeholder}` substitution.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Build from a template (`program arg...`) and substitution values.
    /// Unknown placeholders are left untouched so problems show up in logs
    /// rather than vanish.
    pub fn from_template(template: &[String], subs: &HashMap<&str, String>) -> Option<Self> {
        let mut parts = template.iter().map(|part| {
            let mut rendered = part.clone();
            for (key, value) in subs {
                rendered = rendered.replace(&format!("{{{key}}}"), value);
            }
            rendered
        });
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Stage worker that drives an external process.
pub struct SubprocessWorker {
    spec: CommandSpec,
}

impl SubprocessWorker {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl StageWorker for SubprocessWorker {
    async fn run(&self, ctx: &WorkerContext) -> Result<(), StageError> {
        debug!(
            stage = %ctx.stage_id,
            command = %self.spec.display(),
            "spawning stage worker"
        );

        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StageError::Spawn {
                command: self.spec.display(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            StageError::Io(std::io::Error::other("child stdout not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            StageError::Io(std::io::Error::other("child stderr not captured"))
        })?;

        let stdout_task = spawn_stdout_reader(stdout, ctx.sink.clone());
        let stderr_task = spawn_stderr_reader(stderr, ctx.sink.clone());

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = ctx.cancel.cancelled() => {
                terminate(&mut child, TERMINATION_GRACE).await;
                stdout_task.await.ok();
                stderr_task.await.ok();
                return Err(StageError::Cancelled);
            }
        };

        // The pipes close at process exit; drain the readers so every line
        // reaches the sink before the outcome is reported.
        stdout_task.await.ok();
        stderr_task.await.ok();

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(StageError::NonZeroExit { code }),
            None => Err(StageError::Cancelled),
        }
    }
}

fn spawn_stdout_reader(
    stdout: impl AsyncRead + Unpin + Send + 'static,
    sink: WorkerSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(update) = parser::parse_line(&line) {
                sink.send(update).await;
            }
        }
    })
}

fn spawn_stderr_reader(
    stderr: impl AsyncRead + Unpin + Send + 'static,
    sink: WorkerSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            let level = match parser::classify_severity(trimmed) {
                OutputLevel::Info => OutputLevel::Warning,
                other => other,
            };
            sink.send(WorkerUpdate::Output {
                level,
                message: trimmed.to_string(),
            })
            .await;
        }
    })
}

/// Polite termination: signal, grace period, then kill.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SIGTERM first so the worker can flush and unwind.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "worker ignored SIGTERM, killing");
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill stage worker");
    }
}
