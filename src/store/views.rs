//! Read views over the evidence store.
//!
//! Everything here is algebraic over the core tables: each call reads a
//! consistent snapshot in a single statement, and truth confidence is
//! always computed at read time.

use rusqlite::types::ValueRef;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::store::evidence::EvidenceStore;
use crate::store::types::TaskId;

/// Views exposed through `query_view` and reachable from `query_sql`.
pub const ALLOWED_VIEWS: &[&str] = &[
    "v_claim_evidence",
    "v_contradictions",
    "v_claim_origins",
    "v_evidence_chain",
    "v_hub_pages",
    "v_orphan_sources",
    "v_evidence_freshness",
    "v_emerging_consensus",
    "v_orphan_claims",
];

/// Per-claim evidence summary as reported by `v_claim_evidence`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClaimEvidenceSummary {
    pub claim_id: String,
    pub text: String,
    pub llm_confidence_raw: f64,
    pub support_sum: f64,
    pub refute_sum: f64,
    pub support_count: u32,
    pub refute_count: u32,
    pub neutral_count: u32,
    pub truth_confidence: f64,
    pub controversy: f64,
}

impl EvidenceStore {
    /// Rows of a named view, optionally filtered by task. Unknown view
    /// names are rejected.
    pub fn query_view(&self, view: &str, task_id: Option<&TaskId>) -> Result<Vec<Value>> {
        if !ALLOWED_VIEWS.contains(&view) {
            return Err(Error::invalid_input(format!("unknown view {:?}", view)));
        }
        let has_task_column = matches!(
            view,
            "v_claim_evidence" | "v_contradictions" | "v_emerging_consensus" | "v_orphan_claims"
        );
        let sql = match (task_id, has_task_column) {
            (Some(_), true) => format!("SELECT * FROM {} WHERE task_id = ?1", view),
            _ => format!("SELECT * FROM {}", view),
        };

        let conn = self.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Fatal(format!("store mutex poisoned: {}", e)))?;
        let mut stmt = conn.prepare(&sql).map_err(|e| Error::store(e.to_string()))?;
        let rows = match task_id {
            Some(task_id) if has_task_column => {
                let id = task_id.to_string();
                collect_json_rows(&mut stmt, &[id.as_str()])
            }
            _ => collect_json_rows(&mut stmt, &[]),
        }?;
        Ok(rows)
    }

    /// Run a read-only query against the allowlisted views.
    ///
    /// Only single SELECT statements are admitted, and every table
    /// reference must be one of the views; the base tables are not
    /// reachable from here.
    pub fn query_sql(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
        validate_readonly_sql(sql)?;

        let conn = self.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Fatal(format!("store mutex poisoned: {}", e)))?;
        let mut stmt = conn.prepare(sql).map_err(|e| Error::store(e.to_string()))?;

        let owned: Vec<Box<dyn rusqlite::ToSql>> = params
            .iter()
            .map(|p| -> Box<dyn rusqlite::ToSql> {
                match p {
                    Value::Null => Box::new(None::<String>),
                    Value::Bool(b) => Box::new(*b),
                    Value::Number(n) if n.is_i64() => Box::new(n.as_i64().unwrap_or(0)),
                    Value::Number(n) => Box::new(n.as_f64().unwrap_or(0.0)),
                    other => Box::new(other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string())),
                }
            })
            .collect();
        let refs: Vec<&dyn rusqlite::ToSql> = owned.iter().map(|b| b.as_ref()).collect();
        collect_json_rows_params(&mut stmt, refs.as_slice())
    }

    /// Summaries for every claim of a task, in claim-id order.
    pub fn claim_evidence_summaries(&self, task_id: &TaskId) -> Result<Vec<ClaimEvidenceSummary>> {
        let rows = self.query_view("v_claim_evidence", Some(task_id))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(summary_from_row(&row)?);
        }
        out.sort_by(|a, b| a.claim_id.cmp(&b.claim_id));
        Ok(out)
    }

    /// Walk the evidence chain outward from a claim: its fragments, their
    /// pages, and pages those pages cite, transitively. Cycles in the
    /// citation graph are cut by the visited set inside the recursive CTE.
    pub fn evidence_chain(&self, claim_id: &str, max_depth: u32) -> Result<Vec<Value>> {
        let conn = self.connection();
        let conn = conn
            .lock()
            .map_err(|e| Error::Fatal(format!("store mutex poisoned: {}", e)))?;
        let mut stmt = conn
            .prepare(
                "WITH RECURSIVE chain(page_id, depth) AS (
                    SELECT DISTINCT f.page_id, 0
                    FROM edges e
                    JOIN fragments f ON f.id = e.source_id
                    WHERE e.target_kind = 'claim' AND e.target_id = ?1
                  UNION
                    SELECT cite.target_id, chain.depth + 1
                    FROM chain
                    JOIN edges cite
                        ON cite.relation = 'cites'
                        AND cite.source_kind = 'page'
                        AND cite.source_id = chain.page_id
                    WHERE chain.depth < ?2
                )
                SELECT c.page_id, c.depth, p.url, p.domain
                FROM chain c JOIN pages p ON p.id = c.page_id
                ORDER BY c.depth, c.page_id",
            )
            .map_err(|e| Error::store(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![claim_id, max_depth], |row| {
                Ok(json!({
                    "page_id": row.get::<_, String>(0)?,
                    "depth": row.get::<_, i64>(1)?,
                    "url": row.get::<_, String>(2)?,
                    "domain": row.get::<_, String>(3)?,
                }))
            })
            .map_err(|e| Error::store(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::store(e.to_string()))?;
        Ok(rows)
    }
}

fn summary_from_row(row: &Value) -> Result<ClaimEvidenceSummary> {
    serde_json::from_value(row.clone()).map_err(Error::from)
}

fn validate_readonly_sql(sql: &str) -> Result<()> {
    let trimmed = sql.trim().trim_end_matches(';');
    if trimmed.contains(';') {
        return Err(Error::invalid_input("only a single statement is allowed"));
    }
    let lowered = trimmed.to_lowercase();
    if !lowered.starts_with("select") {
        return Err(Error::invalid_input("only SELECT statements are allowed"));
    }
    for keyword in ["insert", "update", "delete", "drop", "alter", "create", "pragma", "attach"] {
        if lowered
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .any(|tok| tok == keyword)
        {
            return Err(Error::invalid_input(format!(
                "statement contains forbidden keyword {:?}",
                keyword
            )));
        }
    }
    // Every FROM/JOIN target must be an allowlisted view.
    let tokens: Vec<&str> = lowered
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',')
        .filter(|t| !t.is_empty())
        .collect();
    for window in tokens.windows(2) {
        if window[0] == "from" || window[0] == "join" {
            let target = window[1];
            if !ALLOWED_VIEWS.contains(&target) {
                return Err(Error::invalid_input(format!(
                    "table {:?} is not an allowlisted view",
                    target
                )));
            }
        }
    }
    Ok(())
}

fn collect_json_rows(stmt: &mut rusqlite::Statement<'_>, params: &[&str]) -> Result<Vec<Value>> {
    let refs: Vec<&dyn rusqlite::ToSql> =
        params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
    collect_json_rows_params(stmt, refs.as_slice())
}

fn collect_json_rows_params(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Value>> {
    let column_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut rows = stmt
        .query(params)
        .map_err(|e| Error::store(e.to_string()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| Error::store(e.to_string()))? {
        let mut object = Map::new();
        for (i, name) in column_names.iter().enumerate() {
            let value = match row.get_ref(i).map_err(|e| Error::store(e.to_string()))? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => json!(v),
                ValueRef::Real(v) => json!(v),
                ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
                ValueRef::Blob(b) => json!(format!("<blob {} bytes>", b.len())),
            };
            object.insert(name.clone(), value);
        }
        out.push(Value::Object(object));
    }
    Ok(out)
}
