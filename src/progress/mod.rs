//! Per-stage progress accounting and ETA prediction.
//!
//! A calculator is created per stage attempt, seeded from the metrics
//! store's historical mean, and blends that seed with the realized pace as
//! items complete. `complete()` persists one `TimingRecord` back to the
//! store, once.

pub mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;

use crate::hub::events::{EtaKind, EventKind};

pub use metrics::{MetricsStore, StageAverages, TimingRecord};

/// Processed-item count at which the blend is trusted as "learned".
const LEARNED_THRESHOLD: u64 = 3;

/// Pseudo-count pulling the blend toward history while few items are done.
const BLEND_PRIOR_ITEMS: f64 = 5.0;

pub struct ProgressCalculator {
    pipeline_id: String,
    stage_id: String,
    total: u64,
    processed: u64,
    started: Instant,
    seed_ms_per_item: Option<f64>,
    store: Arc<MetricsStore>,
    metadata: Option<Value>,
    persisted: bool,
}

impl ProgressCalculator {
    pub fn new(
        pipeline_id: impl Into<String>,
        stage_id: impl Into<String>,
        total_items: u64,
        store: Arc<MetricsStore>,
    ) -> Self {
        let stage_id = stage_id.into();
        let seed_ms_per_item = store
            .seed_per_item(&stage_id)
            .map(|d| d.as_millis() as f64);
        Self {
            pipeline_id: pipeline_id.into(),
            stage_id,
            total: total_items.max(1),
            processed: 0,
            started: Instant::now(),
            seed_ms_per_item,
            store,
            metadata: None,
            persisted: false,
        }
    }

    /// Attach run metadata (mode, date range) to the persisted record.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Set the current processed count. Counts never move backwards within
    /// an attempt.
    pub fn update(&mut self, processed: u64) {
        self.processed = self.processed.max(processed.min(self.total));
    }

    /// Mid-run correction when the real amount of work turns out different
    /// from the estimate. Keeps `processed`; subsequent ETAs and
    /// percentages are computed against the new total.
    pub fn adjust_total(&mut self, new_total: u64) {
        self.total = new_total.max(1);
        self.processed = self.processed.min(self.total);
    }

    pub fn percentage(&self) -> u8 {
        ((self.processed as f64 / self.total as f64) * 100.0).round() as u8
    }

    /// Remaining-time prediction and its provenance.
    ///
    /// With nothing processed the prediction comes straight from history
    /// (`estimated`), or is absent (`calculating`) on a cold stage. Once
    /// items complete, realized pace is blended in with weight
    /// `processed / (processed + prior)`, flipping to `learned` at three
    /// processed items.
    pub fn eta(&self) -> (Option<Duration>, EtaKind) {
        let remaining = self.total.saturating_sub(self.processed);
        if self.processed == 0 {
            return match self.seed_ms_per_item {
                Some(seed) => (
                    Some(Duration::from_millis((seed * remaining as f64) as u64)),
                    EtaKind::Estimated,
                ),
                None => (None, EtaKind::Calculating),
            };
        }

        let realized = self.started.elapsed().as_millis() as f64 / self.processed as f64;
        let per_item = match self.seed_ms_per_item {
            Some(seed) => {
                let weight = self.processed as f64 / (self.processed as f64 + BLEND_PRIOR_ITEMS);
                weight * realized + (1.0 - weight) * seed
            }
            None => realized,
        };
        let kind = if self.processed >= LEARNED_THRESHOLD {
            EtaKind::Learned
        } else if self.seed_ms_per_item.is_some() {
            EtaKind::Estimated
        } else {
            EtaKind::Calculating
        };
        (
            Some(Duration::from_millis((per_item * remaining as f64) as u64)),
            kind,
        )
    }

    /// Produce a `progress` event for the push channel.
    pub fn snapshot(&self, message: &str, details: Option<Value>) -> EventKind {
        let (eta, eta_kind) = self.eta();
        EventKind::Progress {
            pipeline_id: self.pipeline_id.clone(),
            stage: self.stage_id.clone(),
            current: self.processed,
            total: self.total,
            percentage: self.percentage(),
            message: message.to_string(),
            eta_seconds: eta.map(|d| d.as_secs()),
            eta_kind,
            details,
        }
    }

    /// Persist this run's timing profile. Idempotent per stage invocation.
    pub fn complete(&mut self) -> Result<()> {
        if self.persisted {
            return Ok(());
        }
        let mut record = TimingRecord::new(
            self.stage_id.clone(),
            self.processed.max(1),
            self.started.elapsed(),
        );
        if let Some(meta) = &self.metadata {
            record = record.with_metadata(meta.clone());
        }
        self.store.record(record)?;
        self.persisted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> Arc<MetricsStore> {
        Arc::new(MetricsStore::new(dir))
    }

    #[test]
    fn percentage_rounds_against_total() {
        let dir = tempdir().unwrap();
        let mut calc = ProgressCalculator::new("p", "harvest", 3, store(dir.path()));
        calc.update(1);
        assert_eq!(calc.percentage(), 33);
        calc.update(2);
        assert_eq!(calc.percentage(), 67);
        calc.update(3);
        assert_eq!(calc.percentage(), 100);
    }

    #[test]
    fn update_never_regresses() {
        let dir = tempdir().unwrap();
        let mut calc = ProgressCalculator::new("p", "harvest", 10, store(dir.path()));
        calc.update(6);
        calc.update(4);
        assert_eq!(calc.processed(), 6);
    }

    #[test]
    fn cold_start_eta_is_calculating() {
        let dir = tempdir().unwrap();
        let calc = ProgressCalculator::new("p", "never-ran", 10, store(dir.path()));
        let (eta, kind) = calc.eta();
        assert_eq!(eta, None);
        assert_eq!(kind, EtaKind::Calculating);
    }

    #[test]
    fn history_seeds_estimated_eta_before_first_item() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.record(TimingRecord::new("harvest", 10, Duration::from_secs(20)))
            .unwrap();

        let calc = ProgressCalculator::new("p", "harvest", 5, s);
        let (eta, kind) = calc.eta();
        assert_eq!(kind, EtaKind::Estimated);
        // 5 items at the historical 2 s/item.
        assert_eq!(eta, Some(Duration::from_secs(10)));
    }

    #[test]
    fn learned_after_three_items() {
        let dir = tempdir().unwrap();
        let mut calc = ProgressCalculator::new("p", "harvest", 10, store(dir.path()));
        calc.update(2);
        assert_eq!(calc.eta().1, EtaKind::Calculating);
        calc.update(3);
        assert_eq!(calc.eta().1, EtaKind::Learned);
    }

    #[test]
    fn adjust_total_preserves_processed_and_recomputes() {
        let dir = tempdir().unwrap();
        let mut calc = ProgressCalculator::new("p", "forward-fill", 15, store(dir.path()));
        calc.update(3);
        assert_eq!(calc.percentage(), 20);

        calc.adjust_total(8);
        assert_eq!(calc.processed(), 3);
        assert_eq!(calc.percentage(), 38); // round(3/8*100)

        // ETA is now computed against 5 remaining items, not 12.
        let (eta, _) = calc.eta();
        let realized_ms = calc.started.elapsed().as_millis() as f64 / 3.0;
        let expected = Duration::from_millis((realized_ms * 5.0) as u64);
        let eta = eta.unwrap();
        let diff = eta.abs_diff(expected);
        assert!(diff < Duration::from_millis(50), "eta {eta:?} vs {expected:?}");
    }

    #[test]
    fn eta_decreases_as_items_complete() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.record(TimingRecord::new("convert", 100, Duration::from_secs(100)))
            .unwrap();
        let mut calc = ProgressCalculator::new("p", "convert", 100, s);

        calc.update(10);
        let (eta_a, _) = calc.eta();
        calc.update(60);
        let (eta_b, _) = calc.eta();
        assert!(eta_b.unwrap() < eta_a.unwrap());
    }

    #[test]
    fn snapshot_carries_the_wire_fields() {
        let dir = tempdir().unwrap();
        let mut calc = ProgressCalculator::new("p-9", "harvest", 10, store(dir.path()));
        calc.update(4);

        match calc.snapshot("downloading", Some(serde_json::json!({"day": "2025-06-04"}))) {
            EventKind::Progress {
                pipeline_id,
                stage,
                current,
                total,
                percentage,
                message,
                details,
                ..
            } => {
                assert_eq!(pipeline_id, "p-9");
                assert_eq!(stage, "harvest");
                assert_eq!(current, 4);
                assert_eq!(total, 10);
                assert_eq!(percentage, 40);
                assert_eq!(message, "downloading");
                assert!(details.is_some());
            }
            _ => panic!("expected progress event"),
        }
    }

    #[test]
    fn complete_persists_exactly_once() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let mut calc = ProgressCalculator::new("p", "indices", 5, s.clone());
        calc.update(5);

        calc.complete().unwrap();
        calc.complete().unwrap();

        assert_eq!(s.history("indices").len(), 1);
    }
}
