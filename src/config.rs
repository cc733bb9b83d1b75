//! Configuration for the evidence-processing core.
//!
//! All knobs carry the defaults the rest of the crate assumes; hosts
//! deserialize a partial override and get the remainder filled in.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Budgets applied to new tasks unless the client overrides them.
    pub budget: BudgetConfig,
    /// Ranking pool sizes and blend weights.
    pub ranking: RankingConfig,
    /// Scheduler slots, retries, and circuit breakers.
    pub scheduler: SchedulerConfig,
    /// Deadlines and endpoints for remote calls.
    pub rpc: RpcConfig,
    /// Claim extraction limits.
    pub extraction: ExtractionConfig,
    /// NLI calibration maintenance.
    pub calibration: CalibrationConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            ranking: RankingConfig::default(),
            scheduler: SchedulerConfig::default(),
            rpc: RpcConfig::default(),
            extraction: ExtractionConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

/// Per-task budget caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Maximum pages fetched for a task.
    pub max_pages: u32,
    /// Wall-clock cap in seconds.
    pub max_wall_secs: u64,
    /// Fraction of budget at which a soft warning is surfaced.
    pub warn_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_pages: 200,
            max_wall_secs: 3600,
            warn_fraction: 0.8,
        }
    }
}

impl BudgetConfig {
    /// Cap the page budget.
    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = pages;
        self
    }

    /// Cap the wall-clock budget.
    pub fn with_max_wall_secs(mut self, secs: u64) -> Self {
        self.max_wall_secs = secs;
        self
    }
}

/// Ranking-engine pool sizes and weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// BM25 candidate pool size (stage 1).
    pub bm25_pool: usize,
    /// Shortlist kept after embedding rescore (stage 2).
    pub embedding_keep: usize,
    /// Passages kept after cross-encoder rerank (stage 3).
    pub rerank_keep: usize,
    /// Blend weight for the LLM usefulness score in citation filtering.
    pub usefulness_weight: f64,
    /// Blend weight for embedding similarity in citation filtering.
    pub embedding_weight: f64,
    /// Blend weight for the impact score in citation filtering.
    pub impact_weight: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            bm25_pool: 200,
            embedding_keep: 50,
            rerank_keep: 20,
            usefulness_weight: 0.5,
            embedding_weight: 0.3,
            impact_weight: 0.2,
        }
    }
}

/// Scheduler slots, retries, and breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker tasks in the pool.
    pub workers: usize,
    /// Concurrent holders of the network_client slot.
    pub network_slots: usize,
    /// Maximum retry attempts for retryable failures.
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff multiplier per attempt.
    pub backoff_factor: f64,
    /// Circuit-breaker cool-down in seconds before a half-open probe.
    pub breaker_cooldown_secs: u64,
    /// Consecutive failures that open a circuit.
    pub breaker_failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            network_slots: 4,
            max_attempts: 3,
            backoff_base_ms: 200,
            backoff_factor: 2.0,
            breaker_cooldown_secs: 1800,
            breaker_failure_threshold: 2,
        }
    }
}

impl SchedulerConfig {
    /// Set the worker pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the network slot count.
    pub fn with_network_slots(mut self, slots: usize) -> Self {
        self.network_slots = slots.max(1);
        self
    }
}

/// Remote endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Base URL of the embedding/NLI model server.
    pub model_base_url: String,
    /// Base URL of the local LLM runtime.
    pub llm_base_url: String,
    /// Base URL of the fetcher service.
    pub fetcher_base_url: String,
    /// Deadline for fetch calls in seconds.
    pub fetch_timeout_secs: u64,
    /// Deadline for LLM generation in seconds.
    pub llm_timeout_secs: u64,
    /// Deadline for NLI scoring in seconds.
    pub nli_timeout_secs: u64,
    /// Deadline for rerank calls in seconds.
    pub rerank_timeout_secs: u64,
    /// Embedding model identifier recorded with stored vectors.
    pub embedding_model: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            model_base_url: "http://127.0.0.1:8601".to_string(),
            llm_base_url: "http://127.0.0.1:8602".to_string(),
            fetcher_base_url: "http://127.0.0.1:8603".to_string(),
            fetch_timeout_secs: 30,
            llm_timeout_secs: 60,
            nli_timeout_secs: 60,
            rerank_timeout_secs: 30,
            embedding_model: "bge-m3".to_string(),
        }
    }
}

/// Claim-extraction limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Retries for LLM output that fails schema validation.
    pub max_attempts: u32,
    /// Passages handed to the LLM per page.
    pub max_passages: usize,
    /// Claims accepted from a single page.
    pub max_claims_per_page: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_passages: 8,
            max_claims_per_page: 12,
        }
    }
}

/// Calibration maintenance knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Human-corrected samples that trigger a refit for a source.
    pub recalibrate_after_samples: usize,
    /// Relative Brier worsening that raises the degradation flag.
    pub degradation_threshold: f64,
    /// Evaluation window size in samples.
    pub window_size: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            recalibrate_after_samples: 50,
            degradation_threshold: 0.05,
            window_size: 200,
        }
    }
}
