//! Error types for scrutiny-core.

use thiserror::Error;

/// Result type alias using scrutiny-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while processing evidence.
///
/// The variants mirror the classification the scheduler acts on: a job
/// handler returns one of these and the scheduler decides between retry,
/// suspension, and failure.
#[derive(Error, Debug)]
pub enum Error {
    /// Request failed validation or referenced an unknown entity.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Task exceeded its page or wall-clock budget.
    #[error("budget exhausted: {resource}")]
    BudgetExhausted { resource: String },

    /// An external engine or domain throttled us.
    #[error("rate limited by {scope}")]
    RateLimited { scope: String },

    /// The fetcher hit a CAPTCHA or login wall; the job must suspend.
    #[error("authentication required for {url}")]
    AuthRequired { url: String },

    /// Recoverable failure: network timeout, HTTP 5xx, store deadlock.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// LLM output failed schema validation after all retries.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Calibration quality degraded past the alert threshold.
    #[error("calibration degraded for source {source_name}: brier {brier:.4}")]
    CalibrationDegraded { source_name: String, brier: f64 },

    /// Evidence store failure that retries did not clear.
    #[error("store error: {0}")]
    Store(String),

    /// Remote model endpoint error.
    #[error("rpc error: {endpoint} - {message}")]
    Rpc { endpoint: String, message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store corruption or invariant violation. The scheduler halts.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a budget-exhausted error.
    pub fn budget_exhausted(resource: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            resource: resource.into(),
        }
    }

    /// Create a rate-limited error.
    pub fn rate_limited(scope: impl Into<String>) -> Self {
        Self::RateLimited {
            scope: scope.into(),
        }
    }

    /// Create an auth-required error.
    pub fn auth_required(url: impl Into<String>) -> Self {
        Self::AuthRequired { url: url.into() }
    }

    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create an RPC error.
    pub fn rpc(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Whether the scheduler should retry a job that failed with this error.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }

    /// Whether this error suspends the job to the auth queue instead of
    /// failing it.
    pub fn suspends(&self) -> bool {
        matches!(self, Self::AuthRequired { .. })
    }

    /// Whether this error must halt the scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
