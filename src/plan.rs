//! The built-in stage plan: harvest → convert → forward-fill → indices.
//!
//! Harvest, convert, and indices drive external workers from configurable
//! command templates; forward-fill runs in-process. All four are declared
//! once at startup and resolved into the execution plan per pipeline.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use tracing::debug;

use crate::config::Settings;
use crate::errors::{RegistryError, StageError};
use crate::hub::events::{DataAction, DataFileRef};
use crate::pipeline::state::{Mode, PipelineRequest};
use crate::registry::{
    RetryPolicy, StageDefinition, StageRegistry, ValidationOutcome,
};
use crate::runner::subprocess::{CommandSpec, SubprocessWorker};
use crate::runner::worker::{StageWorker, ValidationContext, WorkerContext};

/// Register the production stages against the given settings.
pub fn build_registry(settings: &Settings) -> Result<Arc<StageRegistry>, RegistryError> {
    let registry = StageRegistry::new();
    let retry = RetryPolicy::from_settings(&settings.retry);
    let timeout = settings.stage_timeout();

    registry.register(
        StageDefinition::new(
            "harvest",
            "Harvest daily reports",
            Arc::new(TemplateWorker::new(settings.workers.harvest.clone())),
        )
        .with_validator(Arc::new(harvest_validator))
        .with_retry(retry.clone())
        .with_timeout(timeout),
    )?;

    registry.register(
        StageDefinition::new(
            "convert",
            "Convert spreadsheets to CSV",
            Arc::new(TemplateWorker::new(settings.workers.convert.clone())),
        )
        .depends_on(&["harvest"])
        .with_validator(Arc::new(convert_validator))
        .with_retry(retry.clone())
        .with_timeout(timeout),
    )?;

    registry.register(
        StageDefinition::new(
            "forward-fill",
            "Fill non-trading days",
            Arc::new(ForwardFillWorker),
        )
        .depends_on(&["convert"])
        .with_validator(Arc::new(reports_exist_validator))
        .with_retry(retry.clone())
        .with_timeout(timeout),
    )?;

    registry.register(
        StageDefinition::new(
            "indices",
            "Derive indices and ticker summaries",
            Arc::new(TemplateWorker::new(settings.workers.indices.clone())),
        )
        .depends_on(&["forward-fill"])
        .with_validator(Arc::new(reports_exist_validator))
        .with_retry(retry)
        .with_timeout(timeout),
    )?;

    Ok(Arc::new(registry))
}

// ── Date-range resolution ────────────────────────────────────────────

/// The date window a pipeline works, resolved per mode.
pub fn resolve_range(request: &PipelineRequest, reports_dir: &Path) -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    match request.mode {
        Mode::Initial => (
            request.from_date.unwrap_or(today),
            request.to_date.unwrap_or(today),
        ),
        Mode::Accumulative => {
            let from = newest_report_date(reports_dir)
                .and_then(|d| d.checked_add_days(Days::new(1)))
                .unwrap_or_else(|| today - chrono::Duration::days(30));
            (from, today)
        }
        Mode::Full => {
            let from = oldest_report_date(reports_dir)
                .unwrap_or_else(|| today - chrono::Duration::days(365));
            (from, today)
        }
    }
}

fn newest_report_date(dir: &Path) -> Option<NaiveDate> {
    dated_files(dir).last().map(|(date, _)| *date)
}

fn oldest_report_date(dir: &Path) -> Option<NaiveDate> {
    dated_files(dir).first().map(|(date, _)| *date)
}

/// Files named `YYYY-MM-DD*.csv`, sorted by date.
fn dated_files(dir: &Path) -> Vec<(NaiveDate, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dated: Vec<(NaiveDate, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "csv"))
        .filter_map(|p| {
            let stem = p.file_stem()?.to_str()?;
            let date = NaiveDate::parse_from_str(stem.get(..10)?, "%Y-%m-%d").ok()?;
            Some((date, p))
        })
        .collect();
    dated.sort_by_key(|(date, _)| *date);
    dated
}

// ── Validators ───────────────────────────────────────────────────────

fn harvest_validator(ctx: &ValidationContext<'_>) -> ValidationOutcome {
    if ctx.request.mode == Mode::Initial
        && (ctx.request.from_date.is_none() || ctx.request.to_date.is_none())
    {
        return ValidationOutcome::Fail(
            "initial mode requires an explicit date range".to_string(),
        );
    }

    let (from, to) = resolve_range(ctx.request, &ctx.paths.reports);
    if from > to {
        return ValidationOutcome::Skip("already up to date".to_string());
    }
    if ctx.request.skip_if_fresh("harvest") {
        if let Some(newest) = newest_download_date(&ctx.paths.downloads) {
            if newest >= to {
                return ValidationOutcome::Skip(format!(
                    "downloads already cover {to}"
                ));
            }
        }
    }
    ValidationOutcome::Ok
}

fn newest_download_date(dir: &Path) -> Option<NaiveDate> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return None;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            let stem = name.to_str()?;
            NaiveDate::parse_from_str(stem.get(..10)?, "%Y-%m-%d").ok()
        })
        .max()
}

fn convert_validator(ctx: &ValidationContext<'_>) -> ValidationOutcome {
    match std::fs::read_dir(&ctx.paths.downloads) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                ValidationOutcome::Skip("no downloads to convert".to_string())
            } else {
                ValidationOutcome::Ok
            }
        }
        Err(e) => ValidationOutcome::Fail(format!("downloads directory unreadable: {e}")),
    }
}

fn reports_exist_validator(ctx: &ValidationContext<'_>) -> ValidationOutcome {
    if dated_files(&ctx.paths.reports).is_empty() {
        ValidationOutcome::Skip("no daily reports present".to_string())
    } else {
        ValidationOutcome::Ok
    }
}

// ── Subprocess template worker ───────────────────────────────────────

/// Renders a configured command template with per-pipeline values, then
/// drives it as a subprocess.
pub struct TemplateWorker {
    template: Vec<String>,
}

impl TemplateWorker {
    pub fn new(template: Vec<String>) -> Self {
        Self { template }
    }
}

#[async_trait]
impl StageWorker for TemplateWorker {
    async fn run(&self, ctx: &WorkerContext) -> Result<(), StageError> {
        let subs = substitutions(ctx);
        let spec = CommandSpec::from_template(&self.template, &subs).ok_or_else(|| {
            StageError::Validation(format!("no worker command configured for {}", ctx.stage_id))
        })?;
        SubprocessWorker::new(spec).run(ctx).await
    }
}

fn substitutions(ctx: &WorkerContext) -> HashMap<&'static str, String> {
    let (from, to) = resolve_range(&ctx.request, &ctx.paths.reports);
    HashMap::from([
        ("downloads", ctx.paths.downloads.display().to_string()),
        ("reports", ctx.paths.reports.display().to_string()),
        ("indices", ctx.paths.indices.display().to_string()),
        ("from", from.to_string()),
        ("to", to.to_string()),
        ("mode", ctx.request.mode.to_string()),
        ("headless", ctx.request.headless().to_string()),
    ])
}

// ── Forward-fill worker (in-process) ─────────────────────────────────

/// Fills non-trading days by carrying the most recent daily report
/// forward, so downstream consumers see a dense date series.
pub struct ForwardFillWorker;

#[async_trait]
impl StageWorker for ForwardFillWorker {
    async fn run(&self, ctx: &WorkerContext) -> Result<(), StageError> {
        let reports_dir = ctx.paths.reports.clone();
        let files = dated_files(&reports_dir);
        let Some((first_date, _)) = files.first() else {
            ctx.sink.progress(0, Some(1), "nothing to fill").await;
            return Ok(());
        };
        let last_date = files.last().map(|(d, _)| *d).expect("non-empty");

        let have: HashSet<NaiveDate> = files.iter().map(|(d, _)| *d).collect();
        let span_days = (last_date - *first_date).num_days().max(0) as u64 + 1;
        ctx.sink
            .progress(0, Some(span_days), "scanning for gaps")
            .await;

        let missing: Vec<NaiveDate> = first_date
            .iter_days()
            .take(span_days as usize)
            .filter(|day| !have.contains(day))
            .collect();

        // The span estimate shrinks to the real amount of work.
        ctx.sink
            .progress(
                0,
                Some(missing.len().max(1) as u64),
                format!("{} non-trading days to fill", missing.len()),
            )
            .await;

        let mut by_date = files;
        let mut filled = 0u64;
        for day in missing {
            if ctx.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }

            // Last report strictly before the gap day; earlier fills count,
            // so a long gap repeats the same carried content.
            let source = by_date
                .iter()
                .rev()
                .find(|(date, _)| *date < day)
                .map(|(_, path)| path.clone());
            let Some(source) = source else { continue };

            let dest = reports_dir.join(format!("{day}.csv"));
            tokio::fs::copy(&source, &dest).await?;
            debug!(day = %day, source = %source.display(), "forward-filled non-trading day");
            by_date.push((day, dest.clone()));
            by_date.sort_by_key(|(date, _)| *date);

            filled += 1;
            ctx.sink
                .data(
                    "reports",
                    DataAction::Created,
                    DataFileRef {
                        filename: format!("{day}.csv"),
                        path: dest.display().to_string(),
                    },
                )
                .await;
            ctx.sink
                .progress(filled, None, format!("filled {day}"))
                .await;
        }

        // Downstream stages (and status snapshots) can see how much was
        // synthesized versus harvested.
        ctx.shared
            .set("forward_fill.filled", serde_json::json!(filled))
            .await;
        Ok(())
    }
}
