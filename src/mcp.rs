//! MCP (Model Context Protocol) tool definitions for the research core.
//!
//! This module defines the tool surface an external reasoning client talks
//! to. Transport framing and JSON-Schema validation of responses belong to
//! the host; here each tool carries its input schema, and handlers run
//! against the shared orchestrator context.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::store::types::{
    ClaimId, EdgeId, EdgeRelation, NodeKind, QueryType, TaskBudget, TaskId,
};

/// An MCP tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    /// Tool name (must be unique)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for input parameters
    pub input_schema: Value,
    /// Category for organization
    pub category: Option<String>,
}

impl McpTool {
    /// Create a new MCP tool.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Value::Object(Default::default()),
            category: None,
        }
    }

    /// Set the input schema.
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Type alias for tool handler function.
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Registry of MCP tools.
pub struct McpToolRegistry {
    tools: HashMap<String, (McpTool, ToolHandler)>,
}

impl McpToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Create a registry wired to a running core.
    pub fn with_core(orchestrator: Arc<Orchestrator>) -> Self {
        let mut registry = Self::new();

        registry.register_create_task(&orchestrator);
        registry.register_queue_searches(&orchestrator);
        registry.register_get_status(&orchestrator);
        registry.register_stop_task(&orchestrator);
        registry.register_get_materials(&orchestrator);
        registry.register_query_view(&orchestrator);
        registry.register_query_sql(&orchestrator);
        registry.register_vector_search(&orchestrator);
        registry.register_feedback(&orchestrator);
        registry.register_calibration_metrics(&orchestrator);
        registry.register_calibration_rollback(&orchestrator);
        registry.register_get_auth_queue(&orchestrator);
        registry.register_resolve_auth(&orchestrator);

        registry
    }

    /// Register a tool with its handler.
    pub fn register(&mut self, tool: McpTool, handler: ToolHandler) {
        self.tools.insert(tool.name.clone(), (tool, handler));
    }

    /// Get a tool definition by name.
    pub fn get_tool(&self, name: &str) -> Option<&McpTool> {
        self.tools.get(name).map(|(tool, _)| tool)
    }

    /// Get all tool definitions.
    pub fn tools(&self) -> Vec<&McpTool> {
        self.tools.values().map(|(tool, _)| tool).collect()
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, input: Value) -> Result<Value> {
        let handler = {
            let (_, handler) = self
                .tools
                .get(name)
                .ok_or_else(|| Error::invalid_input(format!("unknown tool: {}", name)))?;
            Arc::clone(handler)
        };
        handler(input).await
    }

    /// Get tool count.
    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Export tools as JSON schema for MCP.
    pub fn export_schema(&self) -> Value {
        let tools: Vec<Value> = self
            .tools()
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();

        json!({ "tools": tools })
    }

    // =========================================================================
    // Tool registrations
    // =========================================================================

    fn register_create_task(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "create_task",
            "Create a research task for a hypothesis. Returns the task id and \
             the budget it will run under.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "hypothesis": { "type": "string" },
                "config": {
                    "type": "object",
                    "properties": {
                        "max_pages": { "type": "integer", "minimum": 1 },
                        "max_wall_secs": { "type": "integer", "minimum": 1 }
                    }
                }
            },
            "required": ["hypothesis"]
        }))
        .with_category("task");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: CreateTaskInput = parse_input(input)?;
                let budget = request.config.map(|c| TaskBudget {
                    max_pages: c.max_pages.unwrap_or(200),
                    max_wall_secs: c.max_wall_secs.unwrap_or(3600),
                });
                let task = orch.create_task(&request.hypothesis, budget)?;
                Ok(json!({
                    "task_id": task.id.to_string(),
                    "budget": {
                        "max_pages": task.budget.max_pages,
                        "max_wall_secs": task.budget.max_wall_secs,
                    }
                }))
            })
        });
        self.register(tool, handler);
    }

    fn register_queue_searches(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "queue_searches",
            "Queue search queries for a task. Non-blocking: queries run in the \
             background and get_status reports their progress.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "queries": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1
                },
                "options": {
                    "type": "object",
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": ["initial", "expansion", "mirror", "reverse"]
                        }
                    }
                }
            },
            "required": ["task_id", "queries"]
        }))
        .with_category("task");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: QueueSearchesInput = parse_input(input)?;
                let task_id = TaskId::parse(&request.task_id)?;
                let query_type = request
                    .options
                    .and_then(|o| o.query_type)
                    .map(|t| QueryType::parse(&t))
                    .transpose()?
                    .unwrap_or(QueryType::Initial);
                let ids = orch.queue_searches(&task_id, &request.queries, query_type)?;
                Ok(json!({
                    "queued_count": ids.len(),
                    "query_ids": ids.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
                }))
            })
        });
        self.register(tool, handler);
    }

    fn register_get_status(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "get_status",
            "Status snapshot for a task: query progress, budget, job queue, \
             auth queue, warnings. Pass wait to long-poll until something \
             meaningful changes.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "wait": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": 120,
                    "description": "Seconds to block waiting for a state change"
                }
            },
            "required": ["task_id"]
        }))
        .with_category("task");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: GetStatusInput = parse_input(input)?;
                let task_id = TaskId::parse(&request.task_id)?;
                let snapshot = orch.get_status(&task_id, request.wait).await?;
                Ok(serde_json::to_value(snapshot)?)
            })
        });
        self.register(tool, handler);
    }

    fn register_stop_task(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "stop_task",
            "Stop a task: cancel its jobs and mark it terminal.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "reason": { "type": "string" }
            },
            "required": ["task_id"]
        }))
        .with_category("task");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: StopTaskInput = parse_input(input)?;
                let task_id = TaskId::parse(&request.task_id)?;
                let summary = orch.stop_task(&task_id, request.reason.as_deref())?;
                Ok(json!({
                    "final_status": summary.final_status.to_string(),
                    "summary": { "cancelled_jobs": summary.cancelled_jobs },
                }))
            })
        });
        self.register(tool, handler);
    }

    fn register_get_materials(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "get_materials",
            "Claims with their evidence aggregates, the fragments behind them, \
             and optionally the full edge set.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "include_graph": { "type": "boolean", "default": false }
            },
            "required": ["task_id"]
        }))
        .with_category("evidence");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: GetMaterialsInput = parse_input(input)?;
                let task_id = TaskId::parse(&request.task_id)?;
                let materials =
                    orch.get_materials(&task_id, request.include_graph.unwrap_or(false))?;

                let claim_count = materials.claims.len();
                let supported = materials
                    .claims
                    .iter()
                    .filter(|c| c.evidence.support_count > 0)
                    .count();
                let contested = materials
                    .claims
                    .iter()
                    .filter(|c| c.evidence.support_count > 0 && c.evidence.refute_count > 0)
                    .count();
                let mean_confidence = if claim_count == 0 {
                    0.5
                } else {
                    materials
                        .claims
                        .iter()
                        .map(|c| c.evidence.truth_confidence)
                        .sum::<f64>()
                        / claim_count as f64
                };

                let mut value = serde_json::to_value(&materials)?;
                value["evidence_summary"] = json!({
                    "claim_count": claim_count,
                    "supported_claims": supported,
                    "contested_claims": contested,
                    "mean_truth_confidence": mean_confidence,
                });
                Ok(value)
            })
        });
        self.register(tool, handler);
    }

    fn register_query_view(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "query_view",
            "Rows of a named evidence view (claim_evidence, contradictions, \
             hub_pages, ...).",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "view_name": { "type": "string" },
                "task_id": { "type": "string" }
            },
            "required": ["view_name"]
        }))
        .with_category("evidence");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: QueryViewInput = parse_input(input)?;
                let task_id = request.task_id.as_deref().map(TaskId::parse).transpose()?;
                let rows = orch
                    .store()
                    .query_view(&request.view_name, task_id.as_ref())?;
                Ok(json!({ "rows": rows }))
            })
        });
        self.register(tool, handler);
    }

    fn register_query_sql(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "query_sql",
            "Read-only SELECT over the allowlisted evidence views.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string" },
                "params": { "type": "array" }
            },
            "required": ["sql"]
        }))
        .with_category("evidence");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: QuerySqlInput = parse_input(input)?;
                let params = request.params.unwrap_or_default();
                let rows = orch.store().query_sql(&request.sql, &params)?;
                Ok(json!({ "rows": rows }))
            })
        });
        self.register(tool, handler);
    }

    fn register_vector_search(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "vector_search",
            "Cosine search over stored fragment or claim vectors.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "target": { "type": "string", "enum": ["fragment", "claim"] },
                "k": { "type": "integer", "minimum": 1, "default": 10 }
            },
            "required": ["query", "target"]
        }))
        .with_category("evidence");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: VectorSearchInput = parse_input(input)?;
                let target = NodeKind::parse(&request.target)?;
                let results = orch
                    .vector_search(&request.query, target, request.k.unwrap_or(10))
                    .await?;
                Ok(json!({
                    "results": results
                        .into_iter()
                        .map(|(id, score)| json!({"id": id, "score": score}))
                        .collect::<Vec<_>>(),
                }))
            })
        });
        self.register(tool, handler);
    }

    fn register_feedback(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "feedback",
            "Human corrections: reject a claim, correct an NLI edge, or block \
             a domain. Edge corrections feed the calibration sample store.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["reject_claim", "correct_edge", "block_domain"]
                },
                "target_id": { "type": "string" },
                "relation": {
                    "type": "string",
                    "enum": ["supports", "refutes", "neutral"]
                },
                "reason": { "type": "string" }
            },
            "required": ["action", "target_id"]
        }))
        .with_category("feedback");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: FeedbackInput = parse_input(input)?;
                let reason = request.reason.as_deref().unwrap_or("client feedback");
                match request.action.as_str() {
                    "reject_claim" => {
                        orch.reject_claim(&ClaimId::parse(&request.target_id)?, reason)?;
                    }
                    "correct_edge" => {
                        let relation = request
                            .relation
                            .as_deref()
                            .ok_or_else(|| Error::invalid_input("correct_edge needs relation"))?;
                        orch.correct_edge(
                            &EdgeId::parse(&request.target_id)?,
                            EdgeRelation::parse(relation)?,
                            reason,
                        )?;
                    }
                    "block_domain" => {
                        orch.block_domain(&request.target_id)?;
                    }
                    other => {
                        return Err(Error::invalid_input(format!(
                            "unknown feedback action {:?}",
                            other
                        )))
                    }
                }
                Ok(json!({ "ok": true }))
            })
        });
        self.register(tool, handler);
    }

    fn register_calibration_metrics(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "calibration_metrics",
            "Brier score and expected calibration error for the active NLI \
             calibration, with the degradation flag.",
        )
        .with_schema(json!({ "type": "object", "properties": {} }))
        .with_category("calibration");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |_input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let report = orch.verifier().metrics()?;
                Ok(serde_json::to_value(report)?)
            })
        });
        self.register(tool, handler);
    }

    fn register_calibration_rollback(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "calibration_rollback",
            "Atomically restore the previous calibration parameter version.",
        )
        .with_schema(json!({ "type": "object", "properties": {} }))
        .with_category("calibration");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |_input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let version = orch.verifier().rollback()?;
                Ok(json!({ "restored_version": version }))
            })
        });
        self.register(tool, handler);
    }

    fn register_get_auth_queue(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "get_auth_queue",
            "URLs waiting for human authentication.",
        )
        .with_schema(json!({ "type": "object", "properties": {} }))
        .with_category("auth");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |_input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let entries = orch.store().pending_auth_entries()?;
                Ok(json!({
                    "pending_count": entries.len(),
                    "entries": entries,
                }))
            })
        });
        self.register(tool, handler);
    }

    fn register_resolve_auth(&mut self, orchestrator: &Arc<Orchestrator>) {
        let tool = McpTool::new(
            "resolve_auth",
            "Mark an auth-queue entry resolved; the suspended job is retried \
             with the captured session.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "queue_id": { "type": "integer" }
            },
            "required": ["queue_id"]
        }))
        .with_category("auth");

        let orch = Arc::clone(orchestrator);
        let handler: ToolHandler = Arc::new(move |input| {
            let orch = Arc::clone(&orch);
            Box::pin(async move {
                let request: ResolveAuthInput = parse_input(input)?;
                let job_id = orch.resolve_auth(request.queue_id)?;
                Ok(json!({ "job_id": job_id.to_string() }))
            })
        });
        self.register(tool, handler);
    }
}

impl Default for McpToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: Value) -> Result<T> {
    serde_json::from_value(input)
        .map_err(|e| Error::invalid_input(format!("bad tool input: {}", e)))
}

/// Input for create_task.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskInput {
    pub hypothesis: String,
    pub config: Option<TaskBudgetInput>,
}

/// Budget overrides inside create_task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskBudgetInput {
    pub max_pages: Option<u32>,
    pub max_wall_secs: Option<u64>,
}

/// Input for queue_searches.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSearchesInput {
    pub task_id: String,
    pub queries: Vec<String>,
    pub options: Option<QueueSearchesOptions>,
}

/// Options inside queue_searches.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSearchesOptions {
    #[serde(rename = "type")]
    pub query_type: Option<String>,
}

/// Input for get_status.
#[derive(Debug, Clone, Deserialize)]
pub struct GetStatusInput {
    pub task_id: String,
    pub wait: Option<u64>,
}

/// Input for stop_task.
#[derive(Debug, Clone, Deserialize)]
pub struct StopTaskInput {
    pub task_id: String,
    pub reason: Option<String>,
}

/// Input for get_materials.
#[derive(Debug, Clone, Deserialize)]
pub struct GetMaterialsInput {
    pub task_id: String,
    pub include_graph: Option<bool>,
}

/// Input for query_view.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryViewInput {
    pub view_name: String,
    pub task_id: Option<String>,
}

/// Input for query_sql.
#[derive(Debug, Clone, Deserialize)]
pub struct QuerySqlInput {
    pub sql: String,
    pub params: Option<Vec<Value>>,
}

/// Input for vector_search.
#[derive(Debug, Clone, Deserialize)]
pub struct VectorSearchInput {
    pub query: String,
    pub target: String,
    pub k: Option<usize>,
}

/// Input for feedback.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackInput {
    pub action: String,
    pub target_id: String,
    pub relation: Option<String>,
    pub reason: Option<String>,
}

/// Input for resolve_auth.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveAuthInput {
    pub queue_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::extract::ExtractionEngine;
    use crate::index::EmbeddingIndex;
    use crate::orchestrator::CoreClients;
    use crate::providers::ProviderRegistry;
    use crate::rank::RankingEngine;
    use crate::rpc::{
        MockEmbedClient, MockFetchClient, MockGenerateClient, MockNliClient, MockRerankClient,
        NliLabel,
    };
    use crate::scheduler::Scheduler;
    use crate::store::EvidenceStore;
    use crate::verify::NliVerifier;

    fn registry() -> (Arc<EvidenceStore>, McpToolRegistry) {
        let store = Arc::new(EvidenceStore::in_memory().unwrap());
        let config = CoreConfig::default();
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), config.scheduler.clone()));
        let index = Arc::new(EmbeddingIndex::new(
            Arc::clone(&store),
            config.rpc.embedding_model.clone(),
        ));
        let ranking = Arc::new(RankingEngine::new(
            Arc::clone(&store),
            Arc::clone(&index),
            config.ranking.clone(),
        ));
        let extraction = Arc::new(ExtractionEngine::new(
            Arc::clone(&store),
            Arc::clone(&index),
            ranking,
            config.extraction.clone(),
        ));
        let verifier = Arc::new(NliVerifier::new(
            Arc::clone(&store),
            config.calibration.clone(),
        ));
        let providers = ProviderRegistry::new(scheduler.breakers());
        let clients = CoreClients {
            embed: Arc::new(MockEmbedClient::returning(vec![1.0, 0.0])),
            rerank: Arc::new(MockRerankClient::with_scores(vec![0.9])),
            nli: Arc::new(MockNliClient::always(NliLabel::Entailment, 0.9)),
            llm: Arc::new(MockGenerateClient::returning("{}")),
            fetch: Arc::new(MockFetchClient::new()),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            scheduler,
            index,
            extraction,
            verifier,
            Arc::new(providers),
            clients,
            config,
        ));
        (store, McpToolRegistry::with_core(orchestrator))
    }

    #[test]
    fn test_registry_exposes_full_surface() {
        let (_store, registry) = registry();
        for name in [
            "create_task",
            "queue_searches",
            "get_status",
            "stop_task",
            "get_materials",
            "query_view",
            "query_sql",
            "vector_search",
            "feedback",
            "calibration_metrics",
            "calibration_rollback",
            "get_auth_queue",
            "resolve_auth",
        ] {
            assert!(registry.get_tool(name).is_some(), "missing tool {}", name);
        }
        assert_eq!(registry.count(), 13);
    }

    #[test]
    fn test_export_schema_shape() {
        let (_store, registry) = registry();
        let schema = registry.export_schema();
        let tools = schema["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 13);
        for tool in tools {
            assert!(tool["name"].is_string());
            assert!(tool["inputSchema"].is_object());
        }
    }

    #[tokio::test]
    async fn test_create_task_and_status_round_trip() {
        let (_store, registry) = registry();

        let created = registry
            .execute(
                "create_task",
                json!({
                    "hypothesis": "Aspirin reduces cardiovascular events",
                    "config": {"max_pages": 10}
                }),
            )
            .await
            .unwrap();
        let task_id = created["task_id"].as_str().unwrap().to_string();
        assert_eq!(created["budget"]["max_pages"], 10);

        let status = registry
            .execute("get_status", json!({"task_id": task_id}))
            .await
            .unwrap();
        assert_eq!(status["task_status"], "pending");
        assert_eq!(status["budget"]["pages_fetched"], 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_input() {
        let (_store, registry) = registry();

        let err = registry.execute("no_such_tool", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = registry
            .execute("create_task", json!({"not_hypothesis": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = registry
            .execute("get_status", json!({"task_id": "not-a-uuid"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_stop_task_via_tool() {
        let (_store, registry) = registry();
        let created = registry
            .execute("create_task", json!({"hypothesis": "stop me"}))
            .await
            .unwrap();
        let task_id = created["task_id"].as_str().unwrap();

        let stopped = registry
            .execute("stop_task", json!({"task_id": task_id, "reason": "done"}))
            .await
            .unwrap();
        assert_eq!(stopped["final_status"], "cancelled");
        assert_eq!(stopped["summary"]["cancelled_jobs"], 0);
    }

    #[tokio::test]
    async fn test_query_view_and_sql_tools() {
        let (_store, registry) = registry();

        let rows = registry
            .execute("query_view", json!({"view_name": "v_claim_evidence"}))
            .await
            .unwrap();
        assert!(rows["rows"].as_array().unwrap().is_empty());

        let rows = registry
            .execute(
                "query_sql",
                json!({"sql": "SELECT claim_id FROM v_claim_evidence"}),
            )
            .await
            .unwrap();
        assert!(rows["rows"].as_array().unwrap().is_empty());

        let err = registry
            .execute("query_sql", json!({"sql": "DROP TABLE tasks"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_feedback_block_domain() {
        let (store, registry) = registry();
        registry
            .execute(
                "feedback",
                json!({"action": "block_domain", "target_id": "spam.example"}),
            )
            .await
            .unwrap();
        assert_eq!(
            store.domain_category("spam.example").unwrap(),
            crate::store::types::DomainCategory::Blocked
        );
    }

    #[tokio::test]
    async fn test_get_materials_summary_shape() {
        let (_store, registry) = registry();
        let created = registry
            .execute("create_task", json!({"hypothesis": "materials"}))
            .await
            .unwrap();
        let task_id = created["task_id"].as_str().unwrap();

        let materials = registry
            .execute("get_materials", json!({"task_id": task_id}))
            .await
            .unwrap();
        assert_eq!(materials["evidence_summary"]["claim_count"], 0);
        assert!(materials["claims"].as_array().unwrap().is_empty());
        // Graph omitted unless requested.
        assert!(materials.get("edges").is_none() || materials["edges"].is_null());
    }
}
