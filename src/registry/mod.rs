//! Stage registry: declarations, dependency resolution, cycle detection.
//!
//! Stages are registered once at startup and immutable afterwards. The
//! registry is a pure data structure; the only concurrency control is a
//! read-write lock around the stage set, never held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::RetrySettings;
use crate::errors::RegistryError;
use crate::runner::worker::{StageWorker, ValidationContext};

/// Outcome of a stage's pre-execution validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Preconditions hold, run the stage.
    Ok,
    /// No work to do (e.g., outputs already fresh); mark the stage skipped.
    Skip(String),
    /// Preconditions unmet; the stage fails without retry.
    Fail(String),
}

/// Pre-execution predicate declared with a stage.
pub trait StageValidator: Send + Sync {
    fn validate(&self, ctx: &ValidationContext<'_>) -> ValidationOutcome;
}

/// Blanket impl so plain closures can be used as validators.
impl<F> StageValidator for F
where
    F: Fn(&ValidationContext<'_>) -> ValidationOutcome + Send + Sync,
{
    fn validate(&self, ctx: &ValidationContext<'_>) -> ValidationOutcome {
        self(ctx)
    }
}

/// Retry behavior for one stage.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier,
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Backoff before re-running after `attempt` (1-based) failed.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// One unit of pipeline work, declared at startup.
pub struct StageDefinition {
    /// Stable kebab-case identifier.
    pub id: String,
    pub name: String,
    pub dependencies: Vec<String>,
    pub worker: Arc<dyn StageWorker>,
    pub validator: Option<Arc<dyn StageValidator>>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    /// A failure here does not fail the pipeline.
    pub non_critical: bool,
}

impl StageDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        worker: Arc<dyn StageWorker>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dependencies: Vec::new(),
            worker,
            validator: None,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30 * 60),
            non_critical: false,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn StageValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.non_critical = true;
        self
    }
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("non_critical", &self.non_critical)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    stages: HashMap<String, Arc<StageDefinition>>,
    /// Registration order, the tie-breaker for resolution.
    order: Vec<String>,
}

/// The process-wide stage set.
#[derive(Default)]
pub struct StageRegistry {
    inner: RwLock<RegistryInner>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage. Fails on duplicate ids and on dependency edges
    /// that would close a cycle among already-known stages. Dependencies on
    /// stages registered later are permitted and checked at resolution.
    pub fn register(&self, definition: StageDefinition) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("stage registry poisoned");
        let id = definition.id.clone();

        if inner.stages.contains_key(&id) {
            return Err(RegistryError::DuplicateStage(id));
        }
        if definition.dependencies.iter().any(|d| *d == id) {
            return Err(RegistryError::CycleDetected {
                chain: format!("{id} -> {id}"),
                stage: id,
            });
        }
        if let Some(chain) = closes_cycle(&inner.stages, &id, &definition.dependencies) {
            return Err(RegistryError::CycleDetected { stage: id, chain });
        }

        inner.order.push(id.clone());
        inner.stages.insert(id, Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<StageDefinition>, RegistryError> {
        self.inner
            .read()
            .expect("stage registry poisoned")
            .stages
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("stage registry poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the full stage set into a deterministic topological order.
    ///
    /// Kahn's algorithm; when several stages are ready at once the earliest
    /// registered wins, so resolution is stable for a given registration
    /// sequence.
    pub fn resolve(&self) -> Result<Vec<Arc<StageDefinition>>, RegistryError> {
        let inner = self.inner.read().expect("stage registry poisoned");

        let position: HashMap<&str, usize> = inner
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut in_degree: HashMap<&str, usize> =
            inner.order.iter().map(|id| (id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (id, def) in &inner.stages {
            for dep in &def.dependencies {
                if !inner.stages.contains_key(dep) {
                    return Err(RegistryError::UnknownDependency {
                        stage: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                *in_degree.get_mut(id.as_str()).expect("known stage") += 1;
                dependents.entry(dep.as_str()).or_default().push(id);
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort_by_key(|id| position[id]);

        let mut resolved = Vec::with_capacity(inner.order.len());
        while let Some(&next) = ready.first() {
            ready.remove(0);
            resolved.push(inner.stages[next].clone());
            if let Some(children) = dependents.get(next) {
                for child in children {
                    let deg = in_degree.get_mut(child).expect("known stage");
                    *deg -= 1;
                    if *deg == 0 {
                        let pos = position[child];
                        let insert_at = ready
                            .iter()
                            .position(|r| position[r] > pos)
                            .unwrap_or(ready.len());
                        ready.insert(insert_at, child);
                    }
                }
            }
        }

        if resolved.len() != inner.order.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(RegistryError::CycleDetected {
                stage: stuck.first().unwrap_or(&"?").to_string(),
                chain: stuck.join(" -> "),
            });
        }
        Ok(resolved)
    }
}

/// Would adding `stage` with `dependencies` close a cycle through the
/// already-registered edges? Returns the offending chain if so.
fn closes_cycle(
    stages: &HashMap<String, Arc<StageDefinition>>,
    stage: &str,
    dependencies: &[String],
) -> Option<String> {
    // Forward-declared dependencies mean existing edges may already point
    // at `stage`; a cycle closes iff some declared dependency reaches it.
    for dep in dependencies {
        let mut seen = HashSet::new();
        let mut path = vec![stage.to_string(), dep.clone()];
        if walks_back_to(stages, dep, stage, &mut seen, &mut path) {
            return Some(path.join(" -> "));
        }
    }
    None
}

fn walks_back_to(
    stages: &HashMap<String, Arc<StageDefinition>>,
    from: &str,
    target: &str,
    seen: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if from == target {
        return true;
    }
    if !seen.insert(from.to_string()) {
        return false;
    }
    let Some(def) = stages.get(from) else {
        return false;
    };
    for dep in &def.dependencies {
        path.push(dep.clone());
        if walks_back_to(stages, dep, target, seen, path) {
            return true;
        }
        path.pop();
    }
    false
}
