//! Confidence calibration for raw NLI probabilities.
//!
//! Raw model probabilities are over-confident in source-dependent ways, so
//! each source carries versioned scaling parameters applied in logit space.
//! Parameters are fit offline from human-corrected samples; this module
//! holds the transform and a deterministic refit.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Probabilities are clamped away from the extremes before the logit.
const P_EPSILON: f64 = 1e-6;

/// Supported scaling families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    /// `sigmoid(logit(p) / T)`, one temperature parameter.
    Temperature,
    /// `sigmoid(a * logit(p) + b)`, Platt scaling.
    Platt,
}

impl CalibrationMethod {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "temperature" => Ok(Self::Temperature),
            "platt" => Ok(Self::Platt),
            other => Err(Error::invalid_input(format!(
                "bad calibration method {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CalibrationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::Platt => write!(f, "platt"),
        }
    }
}

/// One version of a source's calibration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub version: i64,
    pub method: CalibrationMethod,
    pub a: f64,
    pub b: f64,
}

impl CalibrationParams {
    /// The identity transform used before any parameters are learned.
    pub fn identity() -> Self {
        Self {
            version: 0,
            method: CalibrationMethod::Temperature,
            a: 1.0,
            b: 0.0,
        }
    }

    pub fn temperature(version: i64, t: f64) -> Self {
        Self {
            version,
            method: CalibrationMethod::Temperature,
            a: t,
            b: 0.0,
        }
    }

    pub fn platt(version: i64, a: f64, b: f64) -> Self {
        Self {
            version,
            method: CalibrationMethod::Platt,
            a,
            b,
        }
    }

    /// Apply the transform to a raw probability. Output is always in
    /// [0, 1].
    pub fn calibrate(&self, raw: f64) -> f64 {
        let p = raw.clamp(P_EPSILON, 1.0 - P_EPSILON);
        let z = logit(p);
        let scaled = match self.method {
            CalibrationMethod::Temperature => z / self.a.max(P_EPSILON),
            CalibrationMethod::Platt => self.a * z + self.b,
        };
        sigmoid(scaled)
    }
}

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Fit a temperature to (raw probability, outcome) samples by minimising
/// negative log likelihood over a fixed grid. Deterministic; ties keep the
/// smaller temperature.
pub fn fit_temperature(samples: &[(f64, bool)]) -> f64 {
    if samples.is_empty() {
        return 1.0;
    }
    let mut best_t = 1.0;
    let mut best_nll = f64::INFINITY;
    let mut t = 0.25;
    while t <= 4.0 + 1e-9 {
        let params = CalibrationParams::temperature(0, t);
        let nll = negative_log_likelihood(&params, samples);
        if nll < best_nll - 1e-12 {
            best_nll = nll;
            best_t = t;
        }
        t += 0.05;
    }
    best_t
}

fn negative_log_likelihood(params: &CalibrationParams, samples: &[(f64, bool)]) -> f64 {
    samples
        .iter()
        .map(|(raw, outcome)| {
            let p = params.calibrate(*raw).clamp(P_EPSILON, 1.0 - P_EPSILON);
            if *outcome {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum::<f64>()
        / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_near_noop() {
        let id = CalibrationParams::identity();
        for raw in [0.1, 0.3, 0.5, 0.7, 0.95] {
            assert!((id.calibrate(raw) - raw).abs() < 1e-6);
        }
    }

    #[test]
    fn test_temperature_softens_confidence() {
        // T > 1 pulls probabilities toward 0.5.
        let soft = CalibrationParams::temperature(1, 2.0);
        assert!(soft.calibrate(0.9) < 0.9);
        assert!(soft.calibrate(0.1) > 0.1);
        assert!((soft.calibrate(0.5) - 0.5).abs() < 1e-9);

        // T < 1 sharpens.
        let sharp = CalibrationParams::temperature(1, 0.5);
        assert!(sharp.calibrate(0.9) > 0.9);
        assert!(sharp.calibrate(0.1) < 0.1);
    }

    #[test]
    fn test_platt_shift() {
        // A positive intercept raises every probability.
        let shifted = CalibrationParams::platt(1, 1.0, 1.0);
        for raw in [0.2, 0.5, 0.8] {
            assert!(shifted.calibrate(raw) > raw);
        }
    }

    #[test]
    fn test_extreme_inputs_stay_bounded() {
        let params = CalibrationParams::temperature(1, 0.3);
        for raw in [0.0, 1.0, -0.5, 1.5] {
            let c = params.calibrate(raw);
            assert!((0.0..=1.0).contains(&c), "calibrate({}) = {}", raw, c);
        }
    }

    #[test]
    fn test_fit_temperature_on_overconfident_source() {
        // A source that says 0.9 but is right only ~60% of the time needs
        // T > 1 to soften.
        let mut samples = Vec::new();
        for i in 0..100 {
            samples.push((0.9, i % 10 < 6));
        }
        let t = fit_temperature(&samples);
        assert!(t > 1.0, "expected softening temperature, got {}", t);
    }

    #[test]
    fn test_fit_temperature_on_calibrated_source() {
        // A well-calibrated source keeps T near 1.
        let mut samples = Vec::new();
        for i in 0..100 {
            samples.push((0.7, i % 10 < 7));
        }
        let t = fit_temperature(&samples);
        assert!((t - 1.0).abs() < 0.35, "expected T near 1, got {}", t);
    }

    #[test]
    fn test_fit_temperature_empty_defaults() {
        assert_eq!(fit_temperature(&[]), 1.0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Calibrated output always stays in [0, 1].
            #[test]
            fn calibrated_is_bounded(
                raw in 0.0f64..=1.0,
                t in 0.1f64..4.0,
            ) {
                let c = CalibrationParams::temperature(1, t).calibrate(raw);
                prop_assert!((0.0..=1.0).contains(&c));
            }

            /// Calibration is monotone in the raw probability for positive
            /// slopes.
            #[test]
            fn calibration_is_monotone(
                raw_lo in 0.01f64..0.98,
                delta in 0.001f64..0.02,
                t in 0.1f64..4.0,
            ) {
                let params = CalibrationParams::temperature(1, t);
                let lo = params.calibrate(raw_lo);
                let hi = params.calibrate(raw_lo + delta);
                prop_assert!(hi >= lo);
            }

            /// Platt with positive slope is also monotone and bounded.
            #[test]
            fn platt_is_monotone_and_bounded(
                raw_lo in 0.01f64..0.98,
                delta in 0.001f64..0.02,
                a in 0.1f64..3.0,
                b in -2.0f64..2.0,
            ) {
                let params = CalibrationParams::platt(1, a, b);
                let lo = params.calibrate(raw_lo);
                let hi = params.calibrate(raw_lo + delta);
                prop_assert!(hi >= lo);
                prop_assert!((0.0..=1.0).contains(&lo));
                prop_assert!((0.0..=1.0).contains(&hi));
            }
        }
    }
}
