//! Control-surface HTTP handlers.
//!
//! Thin layer: validate and normalize inputs, call into the manager or
//! license subsystem, map failures to problem documents. No business logic
//! lives here.

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::state::{Mode, PipelineBrief, PipelineRequest, PipelineState};
use crate::server::problem::Problem;
use crate::server::SharedState;

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/license/status", get(license_status))
        .route("/api/license/activate", post(license_activate))
        .route("/api/pipeline/start", post(pipeline_start))
        .route("/api/pipeline/status/{id}", get(pipeline_status))
        .route("/api/pipeline/stop/{id}", post(pipeline_stop))
        .route("/api/pipeline/list", get(pipeline_list))
        .route("/api/data/files", get(data_files))
        .route("/api/data/download/{kind}/{name}", get(data_download))
}

fn trace_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ── Health ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ── License ──────────────────────────────────────────────────────────

async fn license_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.license.status().await)
}

#[derive(Debug, Deserialize)]
struct ActivateRequest {
    key: String,
}

async fn license_activate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<ActivateRequest>,
) -> Response {
    match state.license.activate(&body.key).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => Problem::from_license_error(&e, trace_id(&headers)).into_response(),
    }
}

// ── Pipelines ────────────────────────────────────────────────────────

/// Wire shape of a start request before normalization.
#[derive(Debug, Default, Deserialize)]
pub struct StartPipelineRequest {
    pub mode: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub headless: Option<bool>,
    #[serde(default)]
    pub retry: Option<RetryOverride>,
    #[serde(default)]
    pub stages: Option<HashMap<String, StageOptions>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetryOverride {
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize)]
pub struct StageOptions {
    #[serde(default)]
    pub skip_if_fresh: bool,
}

impl StartPipelineRequest {
    /// Normalize into the immutable pipeline request, flattening the
    /// nested options into the recognized config keys.
    pub fn into_request(self) -> Result<PipelineRequest, String> {
        let mode: Mode = self.mode.parse()?;

        let from_date = self.from.as_deref().map(parse_date).transpose()?;
        let to_date = self.to.as_deref().map(parse_date).transpose()?;
        if mode == Mode::Initial && (from_date.is_none() || to_date.is_none()) {
            return Err("initial mode requires both `from` and `to` dates".into());
        }
        if let (Some(from), Some(to)) = (from_date, to_date) {
            if from > to {
                return Err(format!("from date {from} is after to date {to}"));
            }
        }

        let mut config = serde_json::Map::new();
        if let Some(headless) = self.headless {
            config.insert("headless".into(), Value::Bool(headless));
        }
        if let Some(retry) = self.retry {
            config.insert("retry.max_attempts".into(), Value::from(retry.max_attempts));
        }
        if let Some(stages) = self.stages {
            for (stage_id, options) in stages {
                config.insert(
                    format!("stage.{stage_id}.skip_if_fresh"),
                    Value::Bool(options.skip_if_fresh),
                );
            }
        }

        Ok(PipelineRequest {
            pipeline_id: Uuid::new_v4().to_string(),
            mode,
            from_date,
            to_date,
            config,
            idempotency_key: self.idempotency_key,
        })
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("invalid date `{raw}` (expected YYYY-MM-DD)"))
}

#[derive(Serialize)]
struct StartResponse {
    pipeline_id: String,
}

async fn pipeline_start(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<StartPipelineRequest>,
) -> Result<Json<StartResponse>, Problem> {
    let trace = trace_id(&headers);

    // Authorization short-circuits before any work is accepted.
    state
        .license
        .validate()
        .await
        .map_err(|e| Problem::from_license_error(&e, trace.clone()))?;

    let request = body
        .into_request()
        .map_err(|msg| Problem::bad_request(msg).with_trace_id(trace.clone()))?;
    let pipeline_id = state
        .manager
        .start(request)
        .map_err(|e| Problem::from_pipeline_error(&e, trace))?;
    Ok(Json(StartResponse { pipeline_id }))
}

async fn pipeline_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<PipelineState>, Problem> {
    state
        .manager
        .status(&id)
        .await
        .map(Json)
        .map_err(|e| Problem::from_pipeline_error(&e, trace_id(&headers)))
}

#[derive(Serialize)]
struct StopResponse {
    pipeline_id: String,
    stopping: bool,
}

async fn pipeline_stop(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, Problem> {
    state
        .manager
        .cancel(&id)
        .await
        .map_err(|e| Problem::from_pipeline_error(&e, trace_id(&headers)))?;
    Ok(Json(StopResponse {
        pipeline_id: id,
        stopping: true,
    }))
}

async fn pipeline_list(State(state): State<SharedState>) -> Json<Vec<PipelineBrief>> {
    Json(state.manager.list().await)
}

// ── Data artifacts ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct DataFile {
    pub name: String,
    pub kind: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

async fn data_files(State(state): State<SharedState>) -> Json<Vec<DataFile>> {
    let mut files = Vec::new();
    for (kind, dir) in artifact_dirs(&state.paths) {
        files.extend(list_dir(kind, &dir));
    }
    files.sort_by(|a, b| (&a.kind, &a.name).cmp(&(&b.kind, &b.name)));
    Json(files)
}

fn artifact_dirs(paths: &crate::config::Paths) -> [(&'static str, PathBuf); 3] {
    [
        ("downloads", paths.downloads.clone()),
        ("reports", paths.reports.clone()),
        ("indices", paths.indices.clone()),
    ]
}

fn list_dir(kind: &'static str, dir: &FsPath) -> Vec<DataFile> {
    let pattern = dir.join("*").to_string_lossy().into_owned();
    let Ok(entries) = glob::glob(&pattern) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            let meta = path.metadata().ok()?;
            Some(DataFile {
                name,
                kind: kind.to_string(),
                size_bytes: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            })
        })
        .collect()
}

async fn data_download(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Response, Problem> {
    let trace = trace_id(&headers);

    // Artifact names are plain file names; anything path-like is refused.
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(Problem::bad_request("artifact names cannot contain path separators")
            .with_trace_id(trace));
    }

    let dir = artifact_dirs(&state.paths)
        .into_iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, dir)| dir)
        .ok_or_else(|| {
            Problem::new(
                StatusCode::NOT_FOUND,
                "Unknown artifact type",
                format!("`{kind}` is not a known artifact type"),
            )
            .with_code("artifact_type_unknown")
            .with_trace_id(trace.clone())
        })?;

    let path = dir.join(&name);
    let bytes = tokio::fs::read(&path).await.map_err(|_| {
        Problem::new(
            StatusCode::NOT_FOUND,
            "Artifact not found",
            format!("no `{name}` under {kind}"),
        )
        .with_code("artifact_not_found")
        .with_trace_id(trace)
    })?;

    let mime = mime_guess::from_path(&name).first_or_octet_stream();
    let mut response = bytes.into_response();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_normalizes_config_keys() {
        let body = StartPipelineRequest {
            mode: "initial".into(),
            from: Some("2025-06-01".into()),
            to: Some("2025-06-10".into()),
            headless: Some(false),
            retry: Some(RetryOverride { max_attempts: 5 }),
            stages: Some(HashMap::from([(
                "harvest".to_string(),
                StageOptions { skip_if_fresh: true },
            )])),
            idempotency_key: Some("idem-1".into()),
        };
        let request = body.into_request().unwrap();
        assert_eq!(request.mode, Mode::Initial);
        assert_eq!(request.from_date, NaiveDate::from_ymd_opt(2025, 6, 1));
        assert!(!request.headless());
        assert_eq!(request.max_attempts_override(), Some(5));
        assert!(request.skip_if_fresh("harvest"));
        assert_eq!(request.idempotency_key.as_deref(), Some("idem-1"));
        // Pipeline ids are generated server-side.
        assert!(!request.pipeline_id.is_empty());
    }

    #[test]
    fn initial_mode_requires_a_range() {
        let body = StartPipelineRequest {
            mode: "initial".into(),
            ..StartPipelineRequest::default()
        };
        assert!(body.into_request().unwrap_err().contains("initial"));
    }

    #[test]
    fn accumulative_mode_needs_no_range() {
        let body = StartPipelineRequest {
            mode: "accumulative".into(),
            ..StartPipelineRequest::default()
        };
        assert_eq!(body.into_request().unwrap().mode, Mode::Accumulative);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let body = StartPipelineRequest {
            mode: "hourly".into(),
            ..StartPipelineRequest::default()
        };
        assert!(body.into_request().is_err());
    }

    #[test]
    fn malformed_date_is_rejected() {
        let body = StartPipelineRequest {
            mode: "initial".into(),
            from: Some("06/01/2025".into()),
            to: Some("2025-06-10".into()),
            ..StartPipelineRequest::default()
        };
        assert!(body.into_request().unwrap_err().contains("invalid date"));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let body = StartPipelineRequest {
            mode: "initial".into(),
            from: Some("2025-06-10".into()),
            to: Some("2025-06-01".into()),
            ..StartPipelineRequest::default()
        };
        assert!(body.into_request().is_err());
    }
}
