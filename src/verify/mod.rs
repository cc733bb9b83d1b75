//! NLI verification: (fragment, claim) pairs into stance edges.
//!
//! Batches go to the remote NLI endpoint; raw probabilities are calibrated
//! with the active per-source parameters before the edge is written. The
//! unique edge index makes re-verification a no-op, and cancellation is
//! cooperative between sub-batches: already-persisted verdicts stay valid.

pub mod calibration;
pub mod metrics;

pub use calibration::{fit_temperature, CalibrationMethod, CalibrationParams};
pub use metrics::{brier_score, detect_degradation, expected_calibration_error, CalibrationReport};

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::CalibrationConfig;
use crate::error::Result;
use crate::rpc::{NliClient, NliLabel, NliPair};
use crate::scheduler::CancellationToken;
use crate::store::types::{Claim, Edge, EdgeRelation, Fragment};
use crate::store::EvidenceStore;

/// Pairs sent to the endpoint per call; cancellation is checked between
/// sub-batches.
const NLI_SUB_BATCH: usize = 8;

/// Outcome of one verification batch.
#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub edges_written: usize,
    pub skipped_existing: usize,
    /// Set when the batch stopped early on cancellation. Partial results
    /// already persisted remain valid.
    pub cancelled: bool,
}

/// NLI verifier bound to one store and one calibration source.
pub struct NliVerifier {
    store: Arc<EvidenceStore>,
    config: CalibrationConfig,
    source: String,
}

impl NliVerifier {
    pub fn new(store: Arc<EvidenceStore>, config: CalibrationConfig) -> Self {
        Self {
            store,
            config,
            source: "nli-default".to_string(),
        }
    }

    /// Use a different calibration source key (e.g. per NLI model id).
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The active calibration parameters, or the identity transform before
    /// any are learned.
    pub fn active_params(&self) -> Result<CalibrationParams> {
        Ok(match self.store.active_calibration_params(&self.source)? {
            Some((version, method, a, b)) => CalibrationParams {
                version,
                method: CalibrationMethod::parse(&method)?,
                a,
                b,
            },
            None => CalibrationParams::identity(),
        })
    }

    /// Verify a batch of (premise fragment, hypothesis claim) pairs.
    pub async fn verify_batch(
        &self,
        pairs: &[(Fragment, Claim)],
        nli: &dyn NliClient,
        cancel: &CancellationToken,
    ) -> Result<VerifyOutcome> {
        let params = self.active_params()?;
        let mut outcome = VerifyOutcome::default();

        // The unique index is the authority, but filtering up front saves
        // endpoint calls on re-runs.
        let mut fresh = Vec::with_capacity(pairs.len());
        for (fragment, claim) in pairs {
            if self.store.nli_verdict_exists(&fragment.id, &claim.id)? {
                outcome.skipped_existing += 1;
            } else {
                fresh.push((fragment, claim));
            }
        }

        for chunk in fresh.chunks(NLI_SUB_BATCH) {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                info!(
                    written = outcome.edges_written,
                    "verification cancelled mid-batch"
                );
                return Ok(outcome);
            }

            let requests: Vec<NliPair> = chunk
                .iter()
                .map(|(fragment, claim)| NliPair::new(&fragment.text, &claim.text))
                .collect();
            let verdicts = nli.nli(&requests).await?;

            for ((fragment, claim), verdict) in chunk.iter().zip(verdicts) {
                let relation = match verdict.label {
                    NliLabel::Entailment => EdgeRelation::Supports,
                    NliLabel::Contradiction => EdgeRelation::Refutes,
                    NliLabel::Neutral => EdgeRelation::Neutral,
                };
                let calibrated = params.calibrate(verdict.probability);
                let edge = Edge::nli(&fragment.id, &claim.id, relation, calibrated)?;
                self.store.insert_edge(&edge)?;
                outcome.edges_written += 1;
                debug!(
                    fragment = %fragment.id,
                    claim = %claim.id,
                    relation = %relation,
                    calibrated,
                    "verdict recorded"
                );
            }
        }
        Ok(outcome)
    }

    /// Record a human-corrected sample for this source. When enough new
    /// samples accumulate a refit runs and activates a new parameter
    /// version; returns that version when it happens.
    pub fn record_feedback(&self, raw_prob: f64, outcome: bool) -> Result<Option<i64>> {
        let total = self
            .store
            .add_calibration_sample(&self.source, raw_prob, outcome)?;
        if total as usize % self.config.recalibrate_after_samples != 0 {
            return Ok(None);
        }

        let samples = self
            .store
            .calibration_samples(&self.source, self.config.window_size)?;
        let temperature = fit_temperature(&samples);
        let next_version = self.active_params()?.version + 1;
        self.store.insert_calibration_params(
            &self.source,
            next_version,
            &CalibrationMethod::Temperature.to_string(),
            temperature,
            0.0,
            true,
        )?;
        info!(
            source = %self.source,
            version = next_version,
            temperature,
            samples = samples.len(),
            "calibration refit"
        );
        Ok(Some(next_version))
    }

    /// Calibration quality over the two most recent evaluation windows.
    pub fn metrics(&self) -> Result<CalibrationReport> {
        let params = self.active_params()?;
        let window = self.config.window_size;
        let recent = self.store.calibration_samples(&self.source, window * 2)?;

        let calibrated: Vec<(f64, bool)> = recent
            .iter()
            .map(|(raw, outcome)| (params.calibrate(*raw), *outcome))
            .collect();
        let (current, previous) = if calibrated.len() > window {
            calibrated.split_at(window)
        } else {
            (&calibrated[..], &[][..])
        };

        let degraded =
            detect_degradation(current, previous, self.config.degradation_threshold);
        if degraded {
            warn!(source = %self.source, "calibration degradation detected");
        }

        Ok(CalibrationReport {
            source: self.source.clone(),
            active_version: params.version,
            brier: brier_score(current),
            ece: expected_calibration_error(current),
            sample_count: current.len(),
            degradation_detected: degraded,
        })
    }

    /// Atomically restore the previous parameter version.
    pub fn rollback(&self) -> Result<i64> {
        self.store.rollback_calibration(&self.source)
    }
}
