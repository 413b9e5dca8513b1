//! License manager: machine-bound activation, cached validation, and
//! graceful offline operation.
//!
//! The remote registry owns the authoritative record; a local copy persists
//! with 0600 permissions beside the data directory. Validation answers come
//! from a time-limited cache so hot paths (every pipeline start, every
//! observer connect) do not pound the registry.

pub mod client;
pub mod fingerprint;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::Paths;
use crate::errors::LicenseError;
use crate::hub::events::LicenseLiveness;

pub use client::{HttpRegistry, LicenseRegistry, RemoteLicense, RemoteStatus};
pub use fingerprint::machine_fingerprint;

/// Activation failures tolerated per key before rate limiting kicks in.
const RATE_LIMIT_MAX_FAILURES: usize = 5;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Negative-result cache windows.
const MISMATCH_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
const EXPIRED_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Positive results are cheap to recompute locally; keep the window short.
const POSITIVE_CACHE_TTL: Duration = Duration::from_secs(60);

/// How often a locally-valid license is re-checked against the registry.
const REMOTE_REVALIDATE_EVERY: chrono::Duration = chrono::Duration::hours(6);

/// How long registry unreachability is tolerated before the license is
/// treated as invalid.
const NETWORK_GRACE: chrono::Duration = chrono::Duration::hours(48);

/// Fallback validity when the registry supplies no expiry or duration.
const DEFAULT_DURATION_DAYS: u64 = 365;

/// Locally persisted license state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalLicenseStatus {
    Activated,
    Expired,
    Revoked,
}

/// The local copy of the activated license.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub key: String,
    /// First day the license is no longer valid (00:00 local cutoff).
    pub expiry: NaiveDate,
    pub machine_id: String,
    pub status: LocalLicenseStatus,
    pub issued_at: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
}

impl LicenseRecord {
    pub fn days_remaining(&self, today: NaiveDate) -> i64 {
        (self.expiry - today).num_days()
    }
}

/// Operator-facing license summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseStatusReport {
    pub activated: bool,
    pub valid: bool,
    pub status: String,
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

struct CachedValidation {
    result: Result<i64, LicenseError>,
    at: Instant,
    ttl: Duration,
}

enum Decision {
    Done(Result<i64, LicenseError>),
    Remote { key: String, days: i64 },
}

#[derive(Default)]
struct Inner {
    record: Option<LicenseRecord>,
    cached: Option<CachedValidation>,
    /// Activation failure timestamps per key fingerprint.
    failures: HashMap<String, Vec<Instant>>,
}

/// Process-wide license authority.
pub struct LicenseManager {
    paths: Arc<Paths>,
    registry: Arc<dyn LicenseRegistry>,
    fingerprint: String,
    inner: StdMutex<Inner>,
}

impl LicenseManager {
    pub fn new(paths: Arc<Paths>, registry: Arc<dyn LicenseRegistry>) -> Self {
        let record = match load_record(&paths.license_file) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "unreadable local license record, ignoring");
                None
            }
        };
        Self {
            paths,
            registry,
            fingerprint: machine_fingerprint(),
            inner: StdMutex::new(Inner {
                record,
                ..Inner::default()
            }),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Activate a key on this machine.
    pub async fn activate(&self, key: &str) -> Result<LicenseStatusReport, LicenseError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(LicenseError::InvalidKey);
        }
        self.check_rate_limit(key)?;

        let result = self.activate_inner(key).await;
        if let Err(e) = &result {
            // Only deliberate failures count toward the limit; a flaky
            // network must not lock the operator out.
            if !matches!(e, LicenseError::Network(_) | LicenseError::Storage(_)) {
                self.note_failure(key);
            }
        }
        result
    }

    async fn activate_inner(&self, key: &str) -> Result<LicenseStatusReport, LicenseError> {
        let today = Utc::now().date_naive();
        let mut remote = self.registry.fetch(key).await?;

        match remote.status {
            RemoteStatus::Revoked => return Err(LicenseError::Revoked),
            RemoteStatus::Expired => {
                return Err(LicenseError::Expired(remote.expires_on.unwrap_or(today)));
            }
            RemoteStatus::Activated
                if remote.machine_id.as_deref() != Some(self.fingerprint.as_str()) =>
            {
                return Err(LicenseError::MachineMismatch);
            }
            RemoteStatus::Activated => {
                // Already bound to this machine; just refresh locally.
            }
            RemoteStatus::Available => {
                remote = self.registry.bind(key, &self.fingerprint).await?;
                if remote.status != RemoteStatus::Activated {
                    return Err(LicenseError::Network(format!(
                        "registry did not confirm activation (status {:?})",
                        remote.status
                    )));
                }
            }
        }

        let expiry = compute_expiry(&remote, today);
        if today >= expiry {
            return Err(LicenseError::Expired(expiry));
        }

        let now = Utc::now();
        let record = LicenseRecord {
            key: key.to_string(),
            expiry,
            machine_id: self.fingerprint.clone(),
            status: LocalLicenseStatus::Activated,
            issued_at: remote.issued_at.unwrap_or(now),
            last_checked: now,
        };
        persist_record(&self.paths.license_file, &record)
            .map_err(|e| LicenseError::Storage(e.to_string()))?;

        let days = record.days_remaining(today);
        {
            let mut inner = self.inner.lock().expect("license state poisoned");
            inner.record = Some(record.clone());
            inner.cached = Some(CachedValidation {
                result: Ok(days),
                at: Instant::now(),
                ttl: POSITIVE_CACHE_TTL,
            });
            inner.failures.remove(&key_fingerprint(key));
        }
        info!(expiry = %record.expiry, "license activated on this machine");
        Ok(self.report_for(&record, Ok(days)))
    }

    /// Validate the local license, honoring the cache windows.
    ///
    /// The state lock is never held across the registry call: the lock
    /// scope computes a decision, the await happens outside it.
    pub async fn validate(&self) -> Result<LicenseLiveness, LicenseError> {
        let today = Utc::now().date_naive();

        let decision = {
            let mut inner = self.inner.lock().expect("license state poisoned");
            let fresh = inner
                .cached
                .as_ref()
                .filter(|c| c.at.elapsed() < c.ttl)
                .map(|c| c.result.clone());
            match fresh {
                Some(result) => Decision::Done(result),
                None => {
                    inner.cached = None;
                    self.local_decision(&mut inner, today)
                }
            }
        };

        let result = match decision {
            Decision::Done(result) => result,
            Decision::Remote { key, days } => self.revalidate_remote(&key, days, today).await,
        };
        result.map(|days| LicenseLiveness {
            valid: true,
            days_remaining: Some(days),
        })
    }

    /// Local-only checks; never touches the registry. Returns `Remote` when
    /// the periodic registry revalidation is due.
    fn local_decision(&self, inner: &mut Inner, today: NaiveDate) -> Decision {
        let Some(record) = inner.record.clone() else {
            return Decision::Done(Err(LicenseError::NotActivated));
        };

        if record.machine_id != self.fingerprint {
            let err = LicenseError::MachineMismatch;
            cache(inner, Err(err.clone()), MISMATCH_CACHE_TTL);
            return Decision::Done(Err(err));
        }
        if record.status == LocalLicenseStatus::Revoked {
            let err = LicenseError::Revoked;
            cache(inner, Err(err.clone()), EXPIRED_CACHE_TTL);
            return Decision::Done(Err(err));
        }
        if today >= record.expiry {
            let err = LicenseError::Expired(record.expiry);
            cache(inner, Err(err.clone()), EXPIRED_CACHE_TTL);
            return Decision::Done(Err(err));
        }

        let days = record.days_remaining(today);
        if Utc::now() - record.last_checked > REMOTE_REVALIDATE_EVERY {
            Decision::Remote {
                key: record.key,
                days,
            }
        } else {
            cache(inner, Ok(days), POSITIVE_CACHE_TTL);
            Decision::Done(Ok(days))
        }
    }

    /// Current license + validity summary for the status endpoint and CLI.
    pub async fn status(&self) -> LicenseStatusReport {
        let record = {
            let inner = self.inner.lock().expect("license state poisoned");
            inner.record.clone()
        };
        match record {
            None => LicenseStatusReport {
                activated: false,
                valid: false,
                status: "not_activated".into(),
                machine_id: self.fingerprint.clone(),
                expires_on: None,
                days_remaining: None,
                error_code: Some("not_activated".into()),
            },
            Some(record) => {
                let validation = self.validate().await;
                let today = Utc::now().date_naive();
                self.report_for(
                    &record,
                    validation.map(|l| l.days_remaining.unwrap_or(record.days_remaining(today))),
                )
            }
        }
    }

    /// License liveness for `connection` events; never errors.
    pub async fn liveness(&self) -> LicenseLiveness {
        match self.validate().await {
            Ok(liveness) => liveness,
            Err(_) => LicenseLiveness {
                valid: false,
                days_remaining: None,
            },
        }
    }

    fn report_for(
        &self,
        record: &LicenseRecord,
        validation: Result<i64, LicenseError>,
    ) -> LicenseStatusReport {
        match validation {
            Ok(days) => LicenseStatusReport {
                activated: true,
                valid: true,
                status: "activated".into(),
                machine_id: record.machine_id.clone(),
                expires_on: Some(record.expiry),
                days_remaining: Some(days),
                error_code: None,
            },
            Err(e) => LicenseStatusReport {
                activated: true,
                valid: false,
                status: e.code().into(),
                machine_id: record.machine_id.clone(),
                expires_on: Some(record.expiry),
                days_remaining: None,
                error_code: Some(e.code().into()),
            },
        }
    }

    fn check_rate_limit(&self, key: &str) -> Result<(), LicenseError> {
        let mut inner = self.inner.lock().expect("license state poisoned");
        let failures = inner.failures.entry(key_fingerprint(key)).or_default();
        failures.retain(|t| t.elapsed() < RATE_LIMIT_WINDOW);
        if failures.len() >= RATE_LIMIT_MAX_FAILURES {
            let oldest = failures.first().copied().unwrap_or_else(Instant::now);
            let retry_after = RATE_LIMIT_WINDOW.saturating_sub(oldest.elapsed());
            return Err(LicenseError::RateLimited { retry_after });
        }
        Ok(())
    }

    fn note_failure(&self, key: &str) {
        let mut inner = self.inner.lock().expect("license state poisoned");
        inner
            .failures
            .entry(key_fingerprint(key))
            .or_default()
            .push(Instant::now());
    }

    async fn revalidate_remote(
        &self,
        key: &str,
        local_days: i64,
        today: NaiveDate,
    ) -> Result<i64, LicenseError> {
        let outcome = self.registry.fetch(key).await;
        let mut inner = self.inner.lock().expect("license state poisoned");

        match outcome {
            Ok(remote) => match remote.status {
                RemoteStatus::Activated
                    if remote.machine_id.as_deref() == Some(self.fingerprint.as_str()) =>
                {
                    let expiry = compute_expiry(&remote, today);
                    if let Some(record) = inner.record.as_mut() {
                        record.expiry = expiry;
                        record.last_checked = Utc::now();
                        if let Err(e) = persist_record(&self.paths.license_file, record) {
                            warn!(error = %e, "failed to persist refreshed license record");
                        }
                    }
                    let days = (expiry - today).num_days();
                    if days <= 0 {
                        let err = LicenseError::Expired(expiry);
                        cache(&mut inner, Err(err.clone()), EXPIRED_CACHE_TTL);
                        return Err(err);
                    }
                    cache(&mut inner, Ok(days), POSITIVE_CACHE_TTL);
                    Ok(days)
                }
                RemoteStatus::Activated => {
                    let err = LicenseError::MachineMismatch;
                    if let Some(record) = inner.record.as_mut() {
                        record.last_checked = Utc::now();
                    }
                    cache(&mut inner, Err(err.clone()), MISMATCH_CACHE_TTL);
                    Err(err)
                }
                RemoteStatus::Available => {
                    // The registry lost our binding; force re-activation.
                    let err = LicenseError::NotActivated;
                    cache(&mut inner, Err(err.clone()), MISMATCH_CACHE_TTL);
                    Err(err)
                }
                RemoteStatus::Revoked => {
                    if let Some(record) = inner.record.as_mut() {
                        record.status = LocalLicenseStatus::Revoked;
                        record.last_checked = Utc::now();
                        if let Err(e) = persist_record(&self.paths.license_file, record) {
                            warn!(error = %e, "failed to persist revoked license record");
                        }
                    }
                    let err = LicenseError::Revoked;
                    cache(&mut inner, Err(err.clone()), EXPIRED_CACHE_TTL);
                    Err(err)
                }
                RemoteStatus::Expired => {
                    let expiry = remote.expires_on.unwrap_or(today);
                    let err = LicenseError::Expired(expiry);
                    cache(&mut inner, Err(err.clone()), EXPIRED_CACHE_TTL);
                    Err(err)
                }
            },
            Err(LicenseError::Network(reason)) => {
                // Offline grace: trust the local record for a bounded window.
                let within_grace = inner
                    .record
                    .as_ref()
                    .map(|r| Utc::now() - r.last_checked < NETWORK_GRACE)
                    .unwrap_or(false);
                if within_grace {
                    warn!(%reason, "license registry unreachable, within offline grace");
                    cache(&mut inner, Ok(local_days), POSITIVE_CACHE_TTL);
                    Ok(local_days)
                } else {
                    let err = LicenseError::Network(reason);
                    cache(&mut inner, Err(err.clone()), POSITIVE_CACHE_TTL);
                    Err(err)
                }
            }
            Err(other) => {
                cache(&mut inner, Err(other.clone()), MISMATCH_CACHE_TTL);
                Err(other)
            }
        }
    }
}

fn cache(inner: &mut Inner, result: Result<i64, LicenseError>, ttl: Duration) {
    inner.cached = Some(CachedValidation {
        result,
        at: Instant::now(),
        ttl,
    });
}

fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

/// Expiry day: the registry's date (or issued + standard duration), plus one
/// day so validity runs through midnight local time.
fn compute_expiry(remote: &RemoteLicense, today: NaiveDate) -> NaiveDate {
    let base = remote.expires_on.unwrap_or_else(|| {
        let issued = remote
            .issued_at
            .map(|t| t.date_naive())
            .unwrap_or(today);
        issued
            .checked_add_days(Days::new(
                remote.duration_days.unwrap_or(DEFAULT_DURATION_DAYS as i64).max(0) as u64,
            ))
            .unwrap_or(issued)
    });
    base.checked_add_days(Days::new(1)).unwrap_or(base)
}

fn load_record(path: &Path) -> anyhow::Result<Option<LicenseRecord>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn persist_record(path: &Path, record: &LicenseRecord) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct FakeRegistry {
        license: StdMutex<RemoteLicense>,
        fetch_calls: AtomicUsize,
    }

    impl FakeRegistry {
        fn available(key: &str) -> Arc<Self> {
            Arc::new(Self {
                license: StdMutex::new(RemoteLicense {
                    key: key.to_string(),
                    status: RemoteStatus::Available,
                    machine_id: None,
                    expires_on: Utc::now().date_naive().checked_add_days(Days::new(30)),
                    issued_at: Some(Utc::now()),
                    duration_days: Some(30),
                }),
                fetch_calls: AtomicUsize::new(0),
            })
        }

        fn with_status(key: &str, status: RemoteStatus) -> Arc<Self> {
            let registry = Self::available(key);
            registry.license.lock().unwrap().status = status;
            registry
        }

        fn fetches(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LicenseRegistry for FakeRegistry {
        async fn fetch(&self, key: &str) -> Result<RemoteLicense, LicenseError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let license = self.license.lock().unwrap().clone();
            if license.key != key {
                return Err(LicenseError::InvalidKey);
            }
            Ok(license)
        }

        async fn bind(&self, key: &str, machine_id: &str) -> Result<RemoteLicense, LicenseError> {
            let mut license = self.license.lock().unwrap();
            if license.key != key {
                return Err(LicenseError::InvalidKey);
            }
            license.status = RemoteStatus::Activated;
            license.machine_id = Some(machine_id.to_string());
            Ok(license.clone())
        }
    }

    fn manager(dir: &std::path::Path, registry: Arc<dyn LicenseRegistry>) -> LicenseManager {
        LicenseManager::new(Arc::new(Paths::resolve(Some(dir)).unwrap()), registry)
    }

    #[tokio::test]
    async fn activation_binds_and_persists() {
        let dir = tempdir().unwrap();
        let registry = FakeRegistry::available("K-1");
        let mgr = manager(dir.path(), registry.clone());

        let report = mgr.activate("K-1").await.unwrap();
        assert!(report.valid);
        assert_eq!(report.machine_id, mgr.fingerprint());
        assert!(dir.path().join("license.json").exists());

        // The registry now shows the binding.
        let remote = registry.license.lock().unwrap().clone();
        assert_eq!(remote.status, RemoteStatus::Activated);
        assert_eq!(remote.machine_id.as_deref(), Some(mgr.fingerprint()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn persisted_record_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), FakeRegistry::available("K-1"));
        mgr.activate("K-1").await.unwrap();

        let mode = std::fs::metadata(dir.path().join("license.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn activation_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mgr = manager(dir.path(), FakeRegistry::available("K-1"));
            mgr.activate("K-1").await.unwrap();
        }
        // New manager instance reloads the record from disk.
        let mgr = manager(dir.path(), FakeRegistry::available("K-1"));
        let liveness = mgr.validate().await.unwrap();
        assert!(liveness.valid);
        assert!(liveness.days_remaining.unwrap() > 0);
    }

    #[tokio::test]
    async fn unknown_key_is_invalid() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), FakeRegistry::available("K-1"));
        assert!(matches!(
            mgr.activate("K-OTHER").await,
            Err(LicenseError::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn revoked_key_cannot_activate() {
        let dir = tempdir().unwrap();
        let mgr = manager(
            dir.path(),
            FakeRegistry::with_status("K-1", RemoteStatus::Revoked),
        );
        assert!(matches!(
            mgr.activate("K-1").await,
            Err(LicenseError::Revoked)
        ));
    }

    #[tokio::test]
    async fn key_bound_elsewhere_is_a_mismatch() {
        let dir = tempdir().unwrap();
        let registry = FakeRegistry::available("K-1");
        registry.license.lock().unwrap().status = RemoteStatus::Activated;
        registry.license.lock().unwrap().machine_id = Some("someone-elses-machine-id".into());

        let mgr = manager(dir.path(), registry);
        assert!(matches!(
            mgr.activate("K-1").await,
            Err(LicenseError::MachineMismatch)
        ));
    }

    #[tokio::test]
    async fn repeated_failures_rate_limit() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), FakeRegistry::available("K-1"));

        for _ in 0..RATE_LIMIT_MAX_FAILURES {
            let _ = mgr.activate("K-WRONG").await;
        }
        match mgr.activate("K-WRONG").await {
            Err(LicenseError::RateLimited { retry_after }) => {
                assert!(retry_after <= RATE_LIMIT_WINDOW);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        // A different key is unaffected.
        assert!(mgr.activate("K-1").await.is_ok());
    }

    #[tokio::test]
    async fn validation_without_activation() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), FakeRegistry::available("K-1"));
        assert!(matches!(
            mgr.validate().await,
            Err(LicenseError::NotActivated)
        ));
        let report = mgr.status().await;
        assert!(!report.activated);
        assert_eq!(report.error_code.as_deref(), Some("not_activated"));
    }

    #[tokio::test]
    async fn machine_mismatch_is_cached_without_registry_calls() {
        let dir = tempdir().unwrap();
        // A record bound to some other machine, as if the data directory
        // was copied wholesale.
        let record = LicenseRecord {
            key: "K-1".into(),
            expiry: Utc::now().date_naive().checked_add_days(Days::new(10)).unwrap(),
            machine_id: "a-different-machine-0000".into(),
            status: LocalLicenseStatus::Activated,
            issued_at: Utc::now(),
            last_checked: Utc::now(),
        };
        let paths = Paths::resolve(Some(dir.path())).unwrap();
        persist_record(&paths.license_file, &record).unwrap();

        let registry = FakeRegistry::available("K-1");
        let mgr = manager(dir.path(), registry.clone());

        for _ in 0..10 {
            assert!(matches!(
                mgr.validate().await,
                Err(LicenseError::MachineMismatch)
            ));
        }
        // All ten served locally (cached after the first), zero registry calls.
        assert_eq!(registry.fetches(), 0);
    }

    #[tokio::test]
    async fn fresh_validation_skips_the_registry() {
        let dir = tempdir().unwrap();
        let registry = FakeRegistry::available("K-1");
        let mgr = manager(dir.path(), registry.clone());
        mgr.activate("K-1").await.unwrap();
        let after_activation = registry.fetches();

        for _ in 0..5 {
            mgr.validate().await.unwrap();
        }
        // last_checked is fresh, so periodic revalidation is not due.
        assert_eq!(registry.fetches(), after_activation);
    }

    #[tokio::test]
    async fn stale_record_revalidates_and_refreshes() {
        let dir = tempdir().unwrap();
        let registry = FakeRegistry::available("K-1");
        let mgr = manager(dir.path(), registry.clone());
        mgr.activate("K-1").await.unwrap();

        // Age the record past the revalidation window and clear the cache.
        {
            let mut inner = mgr.inner.lock().unwrap();
            inner.cached = None;
            inner.record.as_mut().unwrap().last_checked =
                Utc::now() - chrono::Duration::hours(7);
        }
        let before = registry.fetches();
        mgr.validate().await.unwrap();
        assert_eq!(registry.fetches(), before + 1);

        // last_checked was refreshed by the successful revalidation.
        let record = mgr.inner.lock().unwrap().record.clone().unwrap();
        assert!(Utc::now() - record.last_checked < chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn expired_record_is_invalid_and_cached() {
        let dir = tempdir().unwrap();
        let registry = FakeRegistry::available("K-1");
        let mgr = manager(dir.path(), registry.clone());
        mgr.activate("K-1").await.unwrap();

        {
            let mut inner = mgr.inner.lock().unwrap();
            inner.cached = None;
            inner.record.as_mut().unwrap().expiry =
                Utc::now().date_naive().checked_sub_days(Days::new(1)).unwrap();
        }
        let before = registry.fetches();
        assert!(matches!(
            mgr.validate().await,
            Err(LicenseError::Expired(_))
        ));
        // Expiry is a local verdict; no registry traffic.
        assert_eq!(registry.fetches(), before);
    }

    #[test]
    fn expiry_adds_the_midnight_day() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let remote = RemoteLicense {
            key: "K".into(),
            status: RemoteStatus::Activated,
            machine_id: None,
            expires_on: NaiveDate::from_ymd_opt(2025, 7, 1),
            issued_at: None,
            duration_days: None,
        };
        assert_eq!(
            compute_expiry(&remote, today),
            NaiveDate::from_ymd_opt(2025, 7, 2).unwrap()
        );
    }

    #[test]
    fn expiry_falls_back_to_issued_plus_duration() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let issued = Utc::now();
        let remote = RemoteLicense {
            key: "K".into(),
            status: RemoteStatus::Activated,
            machine_id: None,
            expires_on: None,
            issued_at: Some(issued),
            duration_days: Some(10),
        };
        let expected = issued
            .date_naive()
            .checked_add_days(Days::new(11))
            .unwrap();
        assert_eq!(compute_expiry(&remote, today), expected);
    }

    #[test]
    fn key_fingerprints_are_short_and_distinct() {
        let a = key_fingerprint("K-1");
        let b = key_fingerprint("K-2");
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert_eq!(a, key_fingerprint("K-1"));
    }
}
