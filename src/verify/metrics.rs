//! Calibration quality tracking: Brier score and expected calibration
//! error over evaluation windows.

use serde::{Deserialize, Serialize};

/// Bins used for the ECE histogram.
const ECE_BINS: usize = 10;

/// Mean squared error between predicted probabilities and outcomes.
/// Lower is better; 0.25 is the score of a coin-flip predictor.
pub fn brier_score(samples: &[(f64, bool)]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples
        .iter()
        .map(|(p, outcome)| {
            let y = if *outcome { 1.0 } else { 0.0 };
            (p - y).powi(2)
        })
        .sum::<f64>()
        / samples.len() as f64
}

/// Expected calibration error: the accuracy-vs-confidence gap averaged over
/// probability bins, weighted by bin occupancy.
pub fn expected_calibration_error(samples: &[(f64, bool)]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut bin_conf = [0.0f64; ECE_BINS];
    let mut bin_hits = [0.0f64; ECE_BINS];
    let mut bin_count = [0usize; ECE_BINS];

    for (p, outcome) in samples {
        let bin = ((p * ECE_BINS as f64) as usize).min(ECE_BINS - 1);
        bin_conf[bin] += p;
        bin_hits[bin] += if *outcome { 1.0 } else { 0.0 };
        bin_count[bin] += 1;
    }

    let total = samples.len() as f64;
    (0..ECE_BINS)
        .filter(|i| bin_count[*i] > 0)
        .map(|i| {
            let n = bin_count[i] as f64;
            let avg_conf = bin_conf[i] / n;
            let accuracy = bin_hits[i] / n;
            (n / total) * (avg_conf - accuracy).abs()
        })
        .sum()
}

/// Snapshot of a source's calibration quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub source: String,
    pub active_version: i64,
    pub brier: f64,
    pub ece: f64,
    pub sample_count: usize,
    /// Set when the current window's Brier score worsened past the
    /// configured threshold relative to the previous window.
    pub degradation_detected: bool,
}

/// Compare the current evaluation window against the previous one.
/// Degradation means the Brier score worsened by at least
/// `threshold` (relative).
pub fn detect_degradation(current: &[(f64, bool)], previous: &[(f64, bool)], threshold: f64) -> bool {
    if current.is_empty() || previous.is_empty() {
        return false;
    }
    let now = brier_score(current);
    let before = brier_score(previous);
    if before <= f64::EPSILON {
        return now > f64::EPSILON;
    }
    (now - before) / before >= threshold
}
