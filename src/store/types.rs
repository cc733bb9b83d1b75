//! Row types and identifiers for the evidence store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::canonical::text_hash;
use crate::error::{Error, Result};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| Error::invalid_input(format!("bad id {:?}: {}", s, e)))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a research task.
    TaskId
);
entity_id!(
    /// Unique identifier for a sub-search query.
    QueryId
);
entity_id!(
    /// Unique identifier for a fetched page.
    PageId
);
entity_id!(
    /// Unique identifier for a bibliographic work.
    WorkId
);
entity_id!(
    /// Unique identifier for a text fragment.
    FragmentId
);
entity_id!(
    /// Unique identifier for an extracted claim.
    ClaimId
);
entity_id!(
    /// Unique identifier for an evidence-graph edge.
    EdgeId
);
entity_id!(
    /// Unique identifier for a scheduled job.
    JobId
);

/// Lifecycle of a research task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal tasks are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::invalid_input(format!("bad task status {:?}", other))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// How a query came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Supplied directly by the client.
    Initial,
    /// Broadening of an earlier query.
    Expansion,
    /// Same question from the opposing viewpoint.
    Mirror,
    /// Searches for refuting evidence.
    Reverse,
}

impl QueryType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "initial" => Ok(Self::Initial),
            "expansion" => Ok(Self::Expansion),
            "mirror" => Ok(Self::Mirror),
            "reverse" => Ok(Self::Reverse),
            other => Err(Error::invalid_input(format!("bad query type {:?}", other))),
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Expansion => "expansion",
            Self::Mirror => "mirror",
            Self::Reverse => "reverse",
        };
        write!(f, "{}", s)
    }
}

/// Execution state of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Running,
    Satisfied,
    Partial,
    Exhausted,
    Skipped,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Satisfied | Self::Exhausted | Self::Skipped)
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "satisfied" => Ok(Self::Satisfied),
            "partial" => Ok(Self::Partial),
            "exhausted" => Ok(Self::Exhausted),
            "skipped" => Ok(Self::Skipped),
            other => Err(Error::invalid_input(format!("bad query status {:?}", other))),
        }
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Satisfied => "satisfied",
            Self::Partial => "partial",
            Self::Exhausted => "exhausted",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Structural kind of a page fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Paragraph,
    Heading,
    List,
    Table,
    Quote,
    /// Abstract of an academic work; distinguished for ranking.
    Abstract,
}

impl FragmentKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "paragraph" => Ok(Self::Paragraph),
            "heading" => Ok(Self::Heading),
            "list" => Ok(Self::List),
            "table" => Ok(Self::Table),
            "quote" => Ok(Self::Quote),
            "abstract" => Ok(Self::Abstract),
            other => Err(Error::invalid_input(format!("bad fragment kind {:?}", other))),
        }
    }
}

impl std::fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Paragraph => "paragraph",
            Self::Heading => "heading",
            Self::List => "list",
            Self::Table => "table",
            Self::Quote => "quote",
            Self::Abstract => "abstract",
        };
        write!(f, "{}", s)
    }
}

/// Whether a claim is kept in the working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdoptionStatus {
    Adopted,
    Rejected,
}

impl AdoptionStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "adopted" => Ok(Self::Adopted),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::invalid_input(format!("bad adoption status {:?}", other))),
        }
    }
}

impl std::fmt::Display for AdoptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adopted => write!(f, "adopted"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Polarity of a claim relative to the task hypothesis, as reported by the
/// extraction model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
    Uncertain,
}

impl Polarity {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "uncertain" => Ok(Self::Uncertain),
            other => Err(Error::invalid_input(format!("bad polarity {:?}", other))),
        }
    }
}

impl std::fmt::Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Negative => write!(f, "negative"),
            Self::Uncertain => write!(f, "uncertain"),
        }
    }
}

/// Granularity of an extracted claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// A single verifiable proposition.
    Atomic,
    /// Bundles several propositions; verification is less sharp.
    Composite,
    /// Too vague to verify meaningfully.
    Vague,
}

impl Granularity {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "atomic" => Ok(Self::Atomic),
            "composite" => Ok(Self::Composite),
            "vague" => Ok(Self::Vague),
            other => Err(Error::invalid_input(format!("bad granularity {:?}", other))),
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Atomic => write!(f, "atomic"),
            Self::Composite => write!(f, "composite"),
            Self::Vague => write!(f, "vague"),
        }
    }
}

/// Node kinds an edge may connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Fragment,
    Claim,
    Page,
}

impl NodeKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fragment" => Ok(Self::Fragment),
            "claim" => Ok(Self::Claim),
            "page" => Ok(Self::Page),
            other => Err(Error::invalid_input(format!("bad node kind {:?}", other))),
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fragment => write!(f, "fragment"),
            Self::Claim => write!(f, "claim"),
            Self::Page => write!(f, "page"),
        }
    }
}

/// Typed relation carried by an evidence-graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRelation {
    /// Provenance: the claim was extracted from the fragment.
    Origin,
    /// NLI verdict: the fragment entails the claim.
    Supports,
    /// NLI verdict: the fragment contradicts the claim.
    Refutes,
    /// NLI verdict: no entailment either way.
    Neutral,
    /// Bibliographic reference between pages.
    Cites,
}

impl EdgeRelation {
    /// Relations produced by the NLI verifier.
    pub fn is_nli(&self) -> bool {
        matches!(self, Self::Supports | Self::Refutes | Self::Neutral)
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "origin" => Ok(Self::Origin),
            "supports" => Ok(Self::Supports),
            "refutes" => Ok(Self::Refutes),
            "neutral" => Ok(Self::Neutral),
            "cites" => Ok(Self::Cites),
            other => Err(Error::invalid_input(format!("bad edge relation {:?}", other))),
        }
    }
}

impl std::fmt::Display for EdgeRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Origin => "origin",
            Self::Supports => "supports",
            Self::Refutes => "refutes",
            Self::Neutral => "neutral",
            Self::Cites => "cites",
        };
        write!(f, "{}", s)
    }
}

/// Trust category of a source domain.
///
/// The ordering feeds the ranking multiplier only; it never enters truth
/// confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainCategory {
    Primary,
    Government,
    Academic,
    Trusted,
    Low,
    Unverified,
    /// Excluded from candidate sets entirely.
    Blocked,
}

impl DomainCategory {
    /// Ranking multiplier for this category.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Primary => 1.0,
            Self::Government => 0.9,
            Self::Academic => 0.85,
            Self::Trusted => 0.7,
            Self::Low => 0.4,
            Self::Unverified => 0.25,
            Self::Blocked => 0.0,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(Self::Primary),
            "government" => Ok(Self::Government),
            "academic" => Ok(Self::Academic),
            "trusted" => Ok(Self::Trusted),
            "low" => Ok(Self::Low),
            "unverified" => Ok(Self::Unverified),
            "blocked" => Ok(Self::Blocked),
            other => Err(Error::invalid_input(format!("bad domain category {:?}", other))),
        }
    }
}

impl std::fmt::Display for DomainCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Primary => "primary",
            Self::Government => "government",
            Self::Academic => "academic",
            Self::Trusted => "trusted",
            Self::Low => "low",
            Self::Unverified => "unverified",
            Self::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// A research task: one hypothesis under investigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub hypothesis: String,
    pub status: TaskStatus,
    pub budget: TaskBudget,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(hypothesis: impl Into<String>, budget: TaskBudget) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            hypothesis: hypothesis.into(),
            status: TaskStatus::Pending,
            budget,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Budget caps stored with a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskBudget {
    pub max_pages: u32,
    pub max_wall_secs: u64,
}

impl TaskBudget {
    pub fn new(max_pages: u32, max_wall_secs: u64) -> Self {
        Self {
            max_pages,
            max_wall_secs,
        }
    }
}

/// A sub-search belonging to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    pub task_id: TaskId,
    pub text: String,
    pub query_type: QueryType,
    pub parent_query_id: Option<QueryId>,
    pub depth: u32,
    pub harvest_rate: Option<f64>,
    pub status: QueryStatus,
    pub created_at: DateTime<Utc>,
}

impl Query {
    pub fn new(task_id: TaskId, text: impl Into<String>, query_type: QueryType) -> Self {
        Self {
            id: QueryId::new(),
            task_id,
            text: text.into(),
            query_type,
            parent_query_id: None,
            depth: 0,
            harvest_rate: None,
            status: QueryStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent: QueryId, depth: u32) -> Self {
        self.parent_query_id = Some(parent);
        self.depth = depth;
        self
    }
}

/// A raw search-engine result tied to one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerpItem {
    pub query_id: QueryId,
    pub url: String,
    pub rank: u32,
    pub title: String,
    pub snippet: String,
}

/// A fetched resource keyed by canonical URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    pub url: String,
    pub domain: String,
    pub http_status: u16,
    pub content_hash: String,
    pub title: Option<String>,
    pub language: Option<String>,
    /// Canonical work id, when the page resolves to a bibliographic record.
    pub canonical_id: Option<String>,
    /// Path of the out-of-band body blob.
    pub body_path: Option<String>,
    pub domain_category: DomainCategory,
    pub fetched_at: DateTime<Utc>,
}

/// A normalised bibliographic record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    pub canonical_id: String,
    pub title: String,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub doi: Option<String>,
    pub source_api: String,
    pub authors: Vec<String>,
}

/// A contiguous text span extracted from a page. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub page_id: PageId,
    pub kind: FragmentKind,
    pub position: u32,
    pub text: String,
    pub heading_context: Option<String>,
    pub text_hash: String,
    pub bm25_score: Option<f64>,
    pub embedding_score: Option<f64>,
    pub rerank_score: Option<f64>,
}

impl Fragment {
    /// Build a fragment; the text hash is derived from the text.
    pub fn new(page_id: PageId, kind: FragmentKind, position: u32, text: impl Into<String>) -> Self {
        let text = text.into();
        let text_hash = text_hash(&text);
        Self {
            id: FragmentId::new(),
            page_id,
            kind,
            position,
            text,
            heading_context: None,
            text_hash,
            bm25_score: None,
            embedding_score: None,
            rerank_score: None,
        }
    }

    pub fn with_heading_context(mut self, context: impl Into<String>) -> Self {
        self.heading_context = Some(context.into());
        self
    }
}

/// An atomic factual statement attributed to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub task_id: TaskId,
    pub text: String,
    /// Extraction quality as reported by the model. Not truth.
    pub llm_confidence_raw: f64,
    pub adoption_status: AdoptionStatus,
    pub granularity: Granularity,
    pub expected_polarity: Polarity,
    pub created_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(task_id: TaskId, text: impl Into<String>, llm_confidence_raw: f64) -> Self {
        Self {
            id: ClaimId::new(),
            task_id,
            text: text.into(),
            llm_confidence_raw: llm_confidence_raw.clamp(0.0, 1.0),
            adoption_status: AdoptionStatus::Adopted,
            granularity: Granularity::Atomic,
            expected_polarity: Polarity::Uncertain,
            created_at: Utc::now(),
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.expected_polarity = polarity;
        self
    }
}

/// A typed, directed edge in the evidence graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source_kind: NodeKind,
    pub source_id: String,
    pub target_kind: NodeKind,
    pub target_id: String,
    pub relation: EdgeRelation,
    /// Calibrated NLI confidence; present only on NLI relations.
    pub confidence: Option<f64>,
    pub source_domain_category: Option<DomainCategory>,
    pub corrected_by_human: bool,
    pub correction_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    /// Provenance edge from a fragment to the claim extracted from it.
    pub fn origin(fragment: &FragmentId, claim: &ClaimId) -> Self {
        Self::make(
            NodeKind::Fragment,
            fragment.to_string(),
            NodeKind::Claim,
            claim.to_string(),
            EdgeRelation::Origin,
            None,
        )
    }

    /// NLI verdict edge with calibrated confidence.
    pub fn nli(
        fragment: &FragmentId,
        claim: &ClaimId,
        relation: EdgeRelation,
        confidence: f64,
    ) -> Result<Self> {
        if !relation.is_nli() {
            return Err(Error::invalid_input(format!(
                "{} is not an NLI relation",
                relation
            )));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::invalid_input(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }
        Ok(Self::make(
            NodeKind::Fragment,
            fragment.to_string(),
            NodeKind::Claim,
            claim.to_string(),
            relation,
            Some(confidence),
        ))
    }

    /// Citation edge between pages.
    pub fn cites(citing: &PageId, cited: &PageId) -> Self {
        Self::make(
            NodeKind::Page,
            citing.to_string(),
            NodeKind::Page,
            cited.to_string(),
            EdgeRelation::Cites,
            None,
        )
    }

    fn make(
        source_kind: NodeKind,
        source_id: String,
        target_kind: NodeKind,
        target_id: String,
        relation: EdgeRelation,
        confidence: Option<f64>,
    ) -> Self {
        Self {
            id: EdgeId::new(),
            source_kind,
            source_id,
            target_kind,
            target_id,
            relation,
            confidence,
            source_domain_category: None,
            corrected_by_human: false,
            correction_note: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_domain_category(mut self, category: DomainCategory) -> Self {
        self.source_domain_category = Some(category);
        self
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    TargetQueue,
    VerifyNli,
    CitationGraph,
    Serp,
    Fetch,
    Extract,
    Embed,
    Llm,
    Nli,
}

impl JobKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "target_queue" => Ok(Self::TargetQueue),
            "verify_nli" => Ok(Self::VerifyNli),
            "citation_graph" => Ok(Self::CitationGraph),
            "serp" => Ok(Self::Serp),
            "fetch" => Ok(Self::Fetch),
            "extract" => Ok(Self::Extract),
            "embed" => Ok(Self::Embed),
            "llm" => Ok(Self::Llm),
            "nli" => Ok(Self::Nli),
            other => Err(Error::invalid_input(format!("bad job kind {:?}", other))),
        }
    }

    /// Slot this kind of job occupies while running.
    ///
    /// NLI verification talks to a remote endpoint, so it rides the
    /// unbounded cpu slot; only the local model runtime holds the gpu.
    pub fn slot(&self) -> Slot {
        match self {
            Self::Serp | Self::Fetch | Self::CitationGraph => Slot::NetworkClient,
            Self::Llm | Self::Embed => Slot::Gpu,
            Self::Extract | Self::TargetQueue | Self::VerifyNli | Self::Nli => Slot::CpuNlp,
        }
    }

    /// Scheduling priority; smaller runs sooner.
    pub fn priority(&self) -> i32 {
        match self {
            Self::Serp => 10,
            Self::TargetQueue => 15,
            Self::Fetch => 20,
            Self::CitationGraph => 25,
            Self::Extract => 30,
            Self::Embed => 40,
            Self::VerifyNli => 50,
            Self::Llm => 60,
            Self::Nli => 70,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TargetQueue => "target_queue",
            Self::VerifyNli => "verify_nli",
            Self::CitationGraph => "citation_graph",
            Self::Serp => "serp",
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Embed => "embed",
            Self::Llm => "llm",
            Self::Nli => "nli",
        };
        write!(f, "{}", s)
    }
}

/// Abstract resource a job occupies while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Gpu,
    BrowserHeadful,
    NetworkClient,
    CpuNlp,
}

impl Slot {
    /// Slots that cannot be held while this one is.
    pub fn excludes(&self) -> Option<Slot> {
        match self {
            Self::Gpu => Some(Self::BrowserHeadful),
            Self::BrowserHeadful => Some(Self::Gpu),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "gpu" => Ok(Self::Gpu),
            "browser_headful" => Ok(Self::BrowserHeadful),
            "network_client" => Ok(Self::NetworkClient),
            "cpu_nlp" => Ok(Self::CpuNlp),
            other => Err(Error::invalid_input(format!("bad slot {:?}", other))),
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Gpu => "gpu",
            Self::BrowserHeadful => "browser_headful",
            Self::NetworkClient => "network_client",
            Self::CpuNlp => "cpu_nlp",
        };
        write!(f, "{}", s)
    }
}

/// State of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    AwaitingAuth,
}

impl JobState {
    /// Valid transitions in the job lifecycle DAG.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (*self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, AwaitingAuth)
                | (Running, Pending)      // retry after transient failure
                | (AwaitingAuth, Pending) // auth resolved
                | (AwaitingAuth, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "awaiting_auth" => Ok(Self::AwaitingAuth),
            other => Err(Error::invalid_input(format!("bad job state {:?}", other))),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::AwaitingAuth => "awaiting_auth",
        };
        write!(f, "{}", s)
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_id: Option<TaskId>,
    pub kind: JobKind,
    pub priority: i32,
    pub slot: Slot,
    pub state: JobState,
    pub input: Value,
    pub output: Option<Value>,
    /// Parent job for tracing causality.
    pub cause_id: Option<JobId>,
    /// Domain the job touches, for per-domain rate limits.
    pub domain: Option<String>,
    pub attempt: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(kind: JobKind, input: Value) -> Self {
        Self {
            id: JobId::new(),
            task_id: None,
            kind,
            priority: kind.priority(),
            slot: kind.slot(),
            state: JobState::Pending,
            input,
            output: None,
            cause_id: None,
            domain: None,
            attempt: 0,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn caused_by(mut self, cause: JobId) -> Self {
        self.cause_id = Some(cause);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Entry in the human-in-the-loop authentication queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthQueueEntry {
    pub id: i64,
    pub job_id: JobId,
    pub url: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outcome of trying to claim a shared resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceClaim {
    /// This worker now owns the resource.
    Claimed,
    /// Another worker got there first.
    AlreadyClaimedBy(String),
}
