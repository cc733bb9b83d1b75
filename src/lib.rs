//! # scrutiny-core
//!
//! The evidence-processing engine of a local-first research assistant
//! exposed as an MCP tool server. An external reasoning client designs
//! search queries and consumes structured evidence; this crate executes
//! the queries, fetches pages, extracts claims, verifies them with NLI
//! scoring, and persists an evidence graph linking every claim back to the
//! fragment and source that produced it.
//!
//! ## Core Components
//!
//! - **Store**: durable, transactional store of tasks, pages, fragments,
//!   claims, edges, and works, with derived evidence views
//! - **Index**: per-fragment and per-claim embedding vectors with cosine
//!   search
//! - **Rank**: BM25 → embedding → cross-encoder rerank narrowing, weighted
//!   by domain trust
//! - **Extract**: page segmentation and LLM claim extraction with
//!   provenance edges
//! - **Verify**: NLI stance verification with calibrated confidences
//! - **Graph**: Bayesian truth aggregation over the evidence graph
//! - **Scheduler**: slot-disciplined job execution with budgets, retries,
//!   auth suspension, and circuit breakers
//! - **Orchestrator**: per-task research state and long-poll status
//! - **Mcp**: the tool surface the reasoning client calls
//!
//! ## Example
//!
//! ```rust,ignore
//! use scrutiny_core::{McpToolRegistry, Orchestrator};
//!
//! let registry = McpToolRegistry::with_core(orchestrator);
//! let created = registry
//!     .execute("create_task", serde_json::json!({
//!         "hypothesis": "Aspirin reduces cardiovascular events"
//!     }))
//!     .await?;
//! ```

pub mod canonical;
pub mod config;
pub mod error;
pub mod extract;
pub mod graph;
pub mod index;
pub mod mcp;
pub mod orchestrator;
pub mod providers;
pub mod rank;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod verify;

// Re-exports for convenience
pub use canonical::{canonical_url, text_hash, url_domain, CanonicalId};
pub use config::{
    BudgetConfig, CalibrationConfig, CoreConfig, ExtractionConfig, RankingConfig, RpcConfig,
    SchedulerConfig,
};
pub use error::{Error, Result};
pub use extract::{
    claim_schema, extraction_prompt, normalize, parse_claims, segment_page, ExtractedClaim,
    ExtractionEngine, Sanitizer, SegmentedBlock,
};
pub use graph::{controversy, truth_confidence, ClaimAggregate};
pub use index::{cosine, EmbeddingIndex};
pub use mcp::{McpTool, McpToolRegistry, ToolHandler};
pub use orchestrator::{
    AuthQueueView, BudgetView, CoreClients, MaterialClaim, Materials, Orchestrator,
    QueryStatusView, StatusSnapshot, StopSummary,
};
pub use providers::{ProviderKind, ProviderRegistry, SearchBackend, SearchHit};
pub use rank::{RankedPassage, RankingEngine};
pub use rpc::{
    EmbedClient, FetchClient, FetchRequest, FetchResponse, FetcherClient, GenerateClient,
    LlmRuntimeClient, ModelServerClient, NliClient, NliLabel, NliPair, NliVerdict, RerankClient,
};
pub use scheduler::{
    BreakerRegistry, BreakerState, CancellationToken, CircuitBreaker, JobHandler, Scheduler,
    SlotTable,
};
pub use store::{
    AdoptionStatus, AuthQueueEntry, Claim, ClaimEvidenceSummary, ClaimId, DomainCategory, Edge,
    EdgeId, EdgeRelation, EvidenceStore, Fragment, FragmentId, FragmentKind, Granularity, Job,
    JobId, JobKind, JobState, NodeKind, Page, PageId, Polarity, Query, QueryId, QueryStatus,
    QueryType, ResourceClaim, SerpItem, Slot, Task, TaskBudget, TaskId, TaskStatus, Work, WorkId,
};
pub use verify::{
    brier_score, expected_calibration_error, fit_temperature, CalibrationMethod,
    CalibrationParams, CalibrationReport, NliVerifier, VerifyOutcome,
};
