//! Persisted per-stage timing history.
//!
//! One JSON file per stage under `data/metrics/`, shaped
//! `{stage, history, averages}`. Appends trim to the newest 100 records,
//! writes go through a temp file + rename, and an exclusive `fs2` lock on
//! the target file keeps concurrent pipelines (and processes) safe.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Records kept per stage.
const DEFAULT_RETENTION: usize = 100;

/// One completed stage invocation's timing profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub total_items: u64,
    pub total_duration_ms: u64,
    pub avg_per_item_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TimingRecord {
    pub fn new(stage: impl Into<String>, total_items: u64, total_duration: Duration) -> Self {
        let total_duration_ms = total_duration.as_millis() as u64;
        let avg_per_item_ms = if total_items > 0 {
            total_duration_ms as f64 / total_items as f64
        } else {
            0.0
        };
        Self {
            stage: stage.into(),
            timestamp: Utc::now(),
            total_items,
            total_duration_ms,
            avg_per_item_ms,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Aggregates recomputed on every append.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageAverages {
    pub runs: u32,
    pub avg_per_item_ms: f64,
    pub avg_total_ms: f64,
}

impl StageAverages {
    fn from_history(history: &[TimingRecord]) -> Self {
        if history.is_empty() {
            return Self::default();
        }
        let runs = history.len() as u32;
        let avg_per_item_ms =
            history.iter().map(|r| r.avg_per_item_ms).sum::<f64>() / runs as f64;
        let avg_total_ms =
            history.iter().map(|r| r.total_duration_ms as f64).sum::<f64>() / runs as f64;
        Self {
            runs,
            avg_per_item_ms,
            avg_total_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StageMetricsFile {
    stage: String,
    history: Vec<TimingRecord>,
    averages: StageAverages,
}

impl StageMetricsFile {
    fn empty(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            history: Vec::new(),
            averages: StageAverages::default(),
        }
    }
}

/// Process-wide store of historical stage timings.
pub struct MetricsStore {
    dir: PathBuf,
    retention: usize,
    cache: Mutex<HashMap<String, StageMetricsFile>>,
}

impl MetricsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retention: DEFAULT_RETENTION,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    fn path_for(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("{stage}.json"))
    }

    /// Historical mean per-item duration, the ETA seed.
    pub fn seed_per_item(&self, stage: &str) -> Option<Duration> {
        let file = self.load_cached(stage);
        if file.averages.runs == 0 || file.averages.avg_per_item_ms <= 0.0 {
            return None;
        }
        Some(Duration::from_millis(file.averages.avg_per_item_ms as u64))
    }

    pub fn history(&self, stage: &str) -> Vec<TimingRecord> {
        self.load_cached(stage).history
    }

    pub fn averages(&self, stage: &str) -> StageAverages {
        self.load_cached(stage).averages
    }

    /// Append a record, trim to retention, recompute averages, persist.
    pub fn record(&self, record: TimingRecord) -> Result<()> {
        let stage = record.stage.clone();
        let path = self.path_for(&stage);

        let mut cache = self.cache.lock().expect("metrics cache poisoned");
        // Re-read under the lock so concurrent writers in other processes
        // are not clobbered.
        let mut file = read_stage_file(&path, &stage)?.unwrap_or_else(|| StageMetricsFile::empty(&stage));

        file.history.push(record);
        if file.history.len() > self.retention {
            let excess = file.history.len() - self.retention;
            file.history.drain(..excess);
        }
        file.averages = StageAverages::from_history(&file.history);

        write_stage_file(&path, &file)?;
        cache.insert(stage, file);
        Ok(())
    }

    fn load_cached(&self, stage: &str) -> StageMetricsFile {
        let mut cache = self.cache.lock().expect("metrics cache poisoned");
        if let Some(file) = cache.get(stage) {
            return file.clone();
        }
        let loaded = match read_stage_file(&self.path_for(stage), stage) {
            Ok(Some(file)) => file,
            Ok(None) => StageMetricsFile::empty(stage),
            Err(err) => {
                warn!(stage, error = %err, "unreadable metrics file, starting fresh");
                StageMetricsFile::empty(stage)
            }
        };
        cache.insert(stage.to_string(), loaded.clone());
        loaded
    }
}

fn read_stage_file(path: &Path, stage: &str) -> Result<Option<StageMetricsFile>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open metrics file {}", path.display()));
        }
    };
    // Fully qualified: std::fs::File grew its own locking API, so plain
    // method syntax on the fs2 trait is ambiguous.
    fs2::FileExt::lock_shared(&file)
        .with_context(|| format!("failed to lock metrics file {}", path.display()))?;
    let result = serde_json::from_reader::<_, StageMetricsFile>(&file)
        .with_context(|| format!("corrupt metrics file for stage {stage}"));
    let _ = fs2::FileExt::unlock(&file);
    result.map(Some)
}

fn write_stage_file(path: &Path, contents: &StageMetricsFile) -> Result<()> {
    let parent = path.parent().context("metrics path has no parent")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create metrics directory {}", parent.display()))?;

    // Hold an exclusive lock on the destination for the whole
    // write-temp-then-rename so concurrent writers serialize.
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open metrics file {}", path.display()))?;
    fs2::FileExt::lock_exclusive(&lock)
        .with_context(|| format!("failed to lock metrics file {}", path.display()))?;

    let tmp = path.with_extension("json.tmp");
    let mut out = File::create(&tmp)
        .with_context(|| format!("failed to create temp metrics file {}", tmp.display()))?;
    serde_json::to_writer_pretty(&mut out, contents).context("failed to encode metrics")?;
    out.flush().context("failed to flush metrics")?;
    out.sync_all().ok();
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace metrics file {}", path.display()))?;

    let _ = fs2::FileExt::unlock(&lock);
    Ok(())
}
