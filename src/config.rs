//! Runtime configuration and path resolution.
//!
//! Settings load once at startup from `marketpipe.toml` (next to the
//! executable or passed via `--config`) with environment overrides, then
//! freeze. All relative paths resolve against the executable's directory so
//! the deployment can be moved as one folder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default HTTP port for the control surface.
const DEFAULT_PORT: u16 = 8090;

/// How long terminal pipelines stay queryable before the sweeper drops them.
const DEFAULT_RETENTION_HOURS: u64 = 24;

/// Top-level settings, deserialized from `marketpipe.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Port the control surface binds on localhost.
    pub port: u16,
    /// Base data directory. Relative values resolve against the executable.
    pub base_dir: Option<PathBuf>,
    /// License registry base URL.
    pub registry_url: String,
    /// Upper bound on concurrently running stages per pipeline.
    pub max_parallel_stages: usize,
    /// Per-stage execution timeout in seconds.
    pub stage_timeout_secs: u64,
    /// Hours a terminal pipeline stays in the in-memory registry.
    pub pipeline_retention_hours: u64,
    /// Default retry behavior, overridable per pipeline request.
    pub retry: RetrySettings,
    /// Worker command lines for the subprocess-backed stages.
    pub workers: WorkerCommands,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            base_dir: None,
            registry_url: "https://licenses.marketpipe.dev/api/v1".to_string(),
            max_parallel_stages: 2,
            stage_timeout_secs: 30 * 60,
            pipeline_retention_hours: DEFAULT_RETENTION_HOURS,
            retry: RetrySettings::default(),
            workers: WorkerCommands::default(),
        }
    }
}

/// Retry policy defaults, expressed in config-friendly units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
        }
    }
}

/// Command templates for the subprocess workers.
///
/// Templates may reference `{downloads}`, `{reports}`, `{indices}`,
/// `{from}`, `{to}`, `{mode}`, and `{headless}`; the runner substitutes
/// per-pipeline values before spawning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommands {
    pub harvest: Vec<String>,
    pub convert: Vec<String>,
    pub indices: Vec<String>,
}

impl Default for WorkerCommands {
    fn default() -> Self {
        Self {
            harvest: vec![
                "mp-harvest".into(),
                "--out".into(),
                "{downloads}".into(),
                "--from".into(),
                "{from}".into(),
                "--to".into(),
                "{to}".into(),
                "--mode".into(),
                "{mode}".into(),
                "--headless".into(),
                "{headless}".into(),
            ],
            convert: vec![
                "mp-convert".into(),
                "--in".into(),
                "{downloads}".into(),
                "--out".into(),
                "{reports}".into(),
            ],
            indices: vec![
                "mp-indices".into(),
                "--in".into(),
                "{reports}".into(),
                "--out".into(),
                "{indices}".into(),
            ],
        }
    }
}

impl Settings {
    /// Load settings from an explicit file, or from `marketpipe.toml` beside
    /// the executable, falling back to defaults when neither exists.
    /// Environment overrides (`MARKETPIPE_PORT`, `MARKETPIPE_REGISTRY_URL`,
    /// `MARKETPIPE_BASE_DIR`) apply last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut settings = match Self::config_file(explicit) {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };

        if let Ok(port) = std::env::var("MARKETPIPE_PORT") {
            settings.port = port
                .parse()
                .context("MARKETPIPE_PORT is not a valid port number")?;
        }
        if let Ok(url) = std::env::var("MARKETPIPE_REGISTRY_URL") {
            settings.registry_url = url;
        }
        if let Ok(dir) = std::env::var("MARKETPIPE_BASE_DIR") {
            settings.base_dir = Some(PathBuf::from(dir));
        }

        Ok(settings)
    }

    fn config_file(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let beside_exe = exe_dir().ok()?.join("marketpipe.toml");
        beside_exe.exists().then_some(beside_exe)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn pipeline_retention(&self) -> Duration {
        Duration::from_secs(self.pipeline_retention_hours * 3600)
    }
}

/// Frozen absolute paths for everything the engine touches on disk.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
    pub downloads: PathBuf,
    pub reports: PathBuf,
    pub indices: PathBuf,
    pub metrics: PathBuf,
    pub logs: PathBuf,
    pub license_file: PathBuf,
}

impl Paths {
    /// Resolve the directory layout under `base_dir` (or the executable's
    /// directory when unset), creating missing directories.
    pub fn resolve(base_dir: Option<&Path>) -> Result<Self> {
        let base = match base_dir {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => exe_dir()?.join(p),
            None => exe_dir()?,
        };

        let data = base.join("data");
        let paths = Self {
            downloads: data.join("downloads"),
            reports: data.join("reports"),
            indices: data.join("indices"),
            metrics: data.join("metrics"),
            logs: base.join("logs"),
            license_file: base.join("license.json"),
            base,
        };
        paths.ensure_directories()?;
        Ok(paths)
    }

    fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.downloads,
            &self.reports,
            &self.indices,
            &self.metrics,
            &self.logs,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

fn exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate the running executable")?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}
