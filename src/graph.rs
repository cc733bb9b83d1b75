//! Evidence-graph aggregation: Bayesian truth confidence and controversy.
//!
//! Truth confidence is the posterior mean of a Beta distribution under a
//! uniform Beta(1,1) prior, where each supporting edge contributes its
//! calibrated confidence as a positive pseudo-count and each refuting edge
//! as a negative one. Neutral edges never move the posterior, and the LLM's
//! extraction confidence never enters the formula.

use serde::{Deserialize, Serialize};

use crate::store::types::{Edge, EdgeRelation};

/// Posterior mean truth confidence for a claim given the confidences of its
/// supporting and refuting edges.
pub fn truth_confidence(supports: &[f64], refutes: &[f64]) -> f64 {
    let support_sum: f64 = supports.iter().sum();
    let refute_sum: f64 = refutes.iter().sum();
    (1.0 + support_sum) / (2.0 + support_sum + refute_sum)
}

/// Controversy: how contested a claim is among its evidence.
pub fn controversy(support_count: usize, refute_count: usize, neutral_count: usize) -> f64 {
    let evidence_count = support_count + refute_count + neutral_count;
    support_count.min(refute_count) as f64 / evidence_count.max(1) as f64
}

/// Aggregate over a claim's edge set, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimAggregate {
    pub support_sum: f64,
    pub refute_sum: f64,
    pub support_count: usize,
    pub refute_count: usize,
    pub neutral_count: usize,
    pub truth_confidence: f64,
    pub controversy: f64,
}

impl ClaimAggregate {
    /// Fold a claim's incoming edges. Non-NLI relations and edges without a
    /// confidence are ignored.
    pub fn from_edges(edges: &[Edge]) -> Self {
        let mut supports = Vec::new();
        let mut refutes = Vec::new();
        let mut neutral_count = 0usize;

        for edge in edges {
            match (edge.relation, edge.confidence) {
                (EdgeRelation::Supports, Some(c)) => supports.push(c),
                (EdgeRelation::Refutes, Some(c)) => refutes.push(c),
                (EdgeRelation::Neutral, _) => neutral_count += 1,
                _ => {}
            }
        }

        Self {
            support_sum: supports.iter().sum(),
            refute_sum: refutes.iter().sum(),
            support_count: supports.len(),
            refute_count: refutes.len(),
            neutral_count,
            truth_confidence: truth_confidence(&supports, &refutes),
            controversy: controversy(supports.len(), refutes.len(), neutral_count),
        }
    }

    /// Total NLI evidence behind the claim.
    pub fn evidence_count(&self) -> usize {
        self.support_count + self.refute_count + self.neutral_count
    }

    /// Whether the claim has evidence on both sides.
    pub fn is_contested(&self) -> bool {
        self.support_count > 0 && self.refute_count > 0
    }
}
