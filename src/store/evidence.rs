//! SQLite-backed evidence store.
//!
//! Single writer behind a mutex, WAL readers, short transactions. Every
//! mutating operation is durable before it returns.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::schema::initialize_schema;
use crate::store::types::*;

/// Attempts made against a busy database before giving up.
const BUSY_RETRIES: u32 = 3;

/// Durable, transactional store of tasks, pages, fragments, claims, edges,
/// works, and jobs.
pub struct EvidenceStore {
    conn: Arc<Mutex<Connection>>,
}

impl EvidenceStore {
    /// Open or create a store at the given path. Migrations run before the
    /// first operation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::store(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::store(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::store(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::store(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection, retrying a bounded number of times
    /// when the database is busy.
    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Fatal(format!("store mutex poisoned: {}", e)))?;

        let mut attempt = 0;
        loop {
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    warn!(attempt, "store busy, retrying");
                    std::thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
                }
                Err(e) => return Err(Error::store(e.to_string())),
            }
        }
    }

    // ==================== Tasks ====================

    /// Insert a new task.
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, hypothesis, status, max_pages, max_wall_secs,
                                    pages_fetched, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
                params![
                    task.id.to_string(),
                    task.hypothesis,
                    task.status.to_string(),
                    task.budget.max_pages,
                    task.budget.max_wall_secs as i64,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Get a task by id.
    pub fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, hypothesis, status, max_pages, max_wall_secs,
                        created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id.to_string()],
                row_to_task,
            )
            .optional()
        })
    }

    /// Update a task's status. Terminal tasks are never mutated.
    pub fn update_task_status(&self, id: &TaskId, status: TaskStatus) -> Result<()> {
        let current = self
            .get_task(id)?
            .ok_or_else(|| Error::invalid_input(format!("unknown task {}", id)))?;
        if current.status.is_terminal() {
            return Err(Error::invalid_input(format!(
                "task {} is terminal ({})",
                id, current.status
            )));
        }
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.to_string(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Record one fetched page against the task budget; returns the new
    /// count.
    pub fn record_page_fetched(&self, id: &TaskId) -> Result<u32> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET pages_fetched = pages_fetched + 1, updated_at = ?2
                 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )?;
            conn.query_row(
                "SELECT pages_fetched FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
        })
    }

    /// Pages fetched so far for a task.
    pub fn pages_fetched(&self, id: &TaskId) -> Result<u32> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT pages_fetched FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
        })
    }

    // ==================== Queries ====================

    /// Insert a query row.
    pub fn insert_query(&self, query: &Query) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queries (id, task_id, text, query_type, parent_query_id,
                                      depth, harvest_rate, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    query.id.to_string(),
                    query.task_id.to_string(),
                    query.text,
                    query.query_type.to_string(),
                    query.parent_query_id.as_ref().map(|q| q.to_string()),
                    query.depth,
                    query.harvest_rate,
                    query.status.to_string(),
                    query.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Get a query by id.
    pub fn get_query(&self, id: &QueryId) -> Result<Option<Query>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, task_id, text, query_type, parent_query_id, depth,
                        harvest_rate, status, created_at
                 FROM queries WHERE id = ?1",
                params![id.to_string()],
                row_to_query,
            )
            .optional()
        })
    }

    /// All queries of a task in creation order.
    pub fn queries_for_task(&self, task_id: &TaskId) -> Result<Vec<Query>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, text, query_type, parent_query_id, depth,
                        harvest_rate, status, created_at
                 FROM queries WHERE task_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map(params![task_id.to_string()], row_to_query)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Update a query's status.
    pub fn update_query_status(&self, id: &QueryId, status: QueryStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE queries SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status.to_string()],
            )?;
            Ok(())
        })
    }

    /// Update a query's harvest rate.
    pub fn update_query_harvest(&self, id: &QueryId, harvest_rate: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE queries SET harvest_rate = ?2 WHERE id = ?1",
                params![id.to_string(), harvest_rate],
            )?;
            Ok(())
        })
    }

    /// Insert SERP items, deduplicating per query by URL. Returns the number
    /// actually inserted.
    pub fn insert_serp_items(&self, items: &[SerpItem]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO serp_items (query_id, url, rank, title, snippet)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for item in items {
                    inserted += stmt.execute(params![
                        item.query_id.to_string(),
                        item.url,
                        item.rank,
                        item.title,
                        item.snippet,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
    }

    /// SERP items for a query, in rank order.
    pub fn serp_items(&self, query_id: &QueryId) -> Result<Vec<SerpItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT query_id, url, rank, title, snippet
                 FROM serp_items WHERE query_id = ?1 ORDER BY rank",
            )?;
            let rows = stmt
                .query_map(params![query_id.to_string()], |row| {
                    Ok(SerpItem {
                        query_id: parse_id(row.get::<_, String>(0)?, QueryId),
                        url: row.get(1)?,
                        rank: row.get(2)?,
                        title: row.get(3)?,
                        snippet: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ==================== Pages & works ====================

    /// Insert a page keyed by canonical URL. On collision the existing row
    /// wins and `is_new` is false; no error is raised.
    pub fn upsert_page(&self, page: &Page) -> Result<(PageId, bool)> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO pages
                    (id, url, domain, http_status, content_hash, title, language,
                     canonical_id, body_path, domain_category, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    page.id.to_string(),
                    page.url,
                    page.domain,
                    page.http_status,
                    page.content_hash,
                    page.title,
                    page.language,
                    page.canonical_id,
                    page.body_path,
                    page.domain_category.to_string(),
                    page.fetched_at.to_rfc3339(),
                ],
            )?;
            let id: String = conn.query_row(
                "SELECT id FROM pages WHERE url = ?1",
                params![page.url],
                |row| row.get(0),
            )?;
            Ok((parse_id(id, PageId), inserted > 0))
        })
    }

    /// Get a page by id.
    pub fn get_page(&self, id: &PageId) -> Result<Option<Page>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, url, domain, http_status, content_hash, title, language,
                        canonical_id, body_path, domain_category, fetched_at
                 FROM pages WHERE id = ?1",
                params![id.to_string()],
                row_to_page,
            )
            .optional()
        })
    }

    /// Get a page by canonical URL.
    pub fn get_page_by_url(&self, url: &str) -> Result<Option<Page>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, url, domain, http_status, content_hash, title, language,
                        canonical_id, body_path, domain_category, fetched_at
                 FROM pages WHERE url = ?1",
                params![url],
                row_to_page,
            )
            .optional()
        })
    }

    /// Insert a bibliographic work with its authors and provider identifiers.
    /// Keyed by canonical id; the existing row wins on collision.
    pub fn upsert_work(
        &self,
        work: &Work,
        identifiers: &[(String, String)],
    ) -> Result<(WorkId, bool)> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO works (id, canonical_id, title, year, venue, doi, source_api)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    work.id.to_string(),
                    work.canonical_id,
                    work.title,
                    work.year,
                    work.venue,
                    work.doi,
                    work.source_api,
                ],
            )?;
            let id: String = tx.query_row(
                "SELECT id FROM works WHERE canonical_id = ?1",
                params![work.canonical_id],
                |row| row.get(0),
            )?;
            if inserted > 0 {
                let mut stmt = tx.prepare(
                    "INSERT INTO work_authors (work_id, position, name) VALUES (?1, ?2, ?3)",
                )?;
                for (position, name) in work.authors.iter().enumerate() {
                    stmt.execute(params![id, position as i64, name])?;
                }
            }
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO work_identifiers
                        (identifier_type, identifier_value, work_id)
                     VALUES (?1, ?2, ?3)",
                )?;
                for (id_type, id_value) in identifiers {
                    stmt.execute(params![id_type, id_value, id])?;
                }
            }
            tx.commit()?;
            Ok((parse_id(id, WorkId), inserted > 0))
        })
    }

    /// Resolve a provider identifier to the owning work.
    pub fn work_by_identifier(&self, id_type: &str, id_value: &str) -> Result<Option<WorkId>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT work_id FROM work_identifiers
                 WHERE identifier_type = ?1 AND identifier_value = ?2",
                params![id_type, id_value],
                |row| Ok(parse_id(row.get::<_, String>(0)?, WorkId)),
            )
            .optional()
        })
    }

    // ==================== Fragments ====================

    /// Batch-insert fragments for a page, deduplicating by text hash within
    /// the page. Returns the fragments that were actually inserted.
    pub fn insert_fragments(&self, fragments: &[Fragment]) -> Result<Vec<Fragment>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut kept = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO fragments
                        (id, page_id, kind, position, text, heading_context, text_hash,
                         bm25_score, embedding_score, rerank_score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )?;
                for fragment in fragments {
                    let inserted = stmt.execute(params![
                        fragment.id.to_string(),
                        fragment.page_id.to_string(),
                        fragment.kind.to_string(),
                        fragment.position,
                        fragment.text,
                        fragment.heading_context,
                        fragment.text_hash,
                        fragment.bm25_score,
                        fragment.embedding_score,
                        fragment.rerank_score,
                        Utc::now().to_rfc3339(),
                    ])?;
                    if inserted > 0 {
                        kept.push(fragment.clone());
                    }
                }
            }
            tx.commit()?;
            Ok(kept)
        })
    }

    /// Get a fragment by id.
    pub fn get_fragment(&self, id: &FragmentId) -> Result<Option<Fragment>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, page_id, kind, position, text, heading_context, text_hash,
                        bm25_score, embedding_score, rerank_score
                 FROM fragments WHERE id = ?1",
                params![id.to_string()],
                row_to_fragment,
            )
            .optional()
        })
    }

    /// All fragments of a page in position order.
    pub fn fragments_for_page(&self, page_id: &PageId) -> Result<Vec<Fragment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, page_id, kind, position, text, heading_context, text_hash,
                        bm25_score, embedding_score, rerank_score
                 FROM fragments WHERE page_id = ?1 ORDER BY position",
            )?;
            let rows = stmt
                .query_map(params![page_id.to_string()], row_to_fragment)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Persist ranking scores on a fragment.
    pub fn update_fragment_scores(
        &self,
        id: &FragmentId,
        bm25: Option<f64>,
        embedding: Option<f64>,
        rerank: Option<f64>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE fragments SET
                    bm25_score = COALESCE(?2, bm25_score),
                    embedding_score = COALESCE(?3, embedding_score),
                    rerank_score = COALESCE(?4, rerank_score)
                 WHERE id = ?1",
                params![id.to_string(), bm25, embedding, rerank],
            )?;
            Ok(())
        })
    }

    /// BM25 search over the fragment full-text index. Ties and final order
    /// are resolved by (rank, page_id, fragment id) so results are stable.
    pub fn search_fragments_bm25(&self, query: &str, limit: usize) -> Result<Vec<(Fragment, f64)>> {
        let match_expr = fts_match_expr(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.id, f.page_id, f.kind, f.position, f.text, f.heading_context,
                        f.text_hash, f.bm25_score, f.embedding_score, f.rerank_score,
                        bm25(fragments_fts) AS score
                 FROM fragments f
                 JOIN fragments_fts fts ON f.rowid = fts.rowid
                 WHERE fragments_fts MATCH ?1
                 ORDER BY score, f.page_id, f.id
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![match_expr, limit as i64], |row| {
                    let fragment = row_to_fragment(row)?;
                    // fts5 bm25() returns lower-is-better; flip the sign so
                    // callers can treat it as a score.
                    let score: f64 = row.get(10)?;
                    Ok((fragment, -score))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Text hashes of the most recent fragments for a task, newest first.
    /// Feeds the novelty computation.
    pub fn recent_fragment_hashes(&self, task_id: &TaskId, limit: usize) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.text_hash FROM fragments f
                 JOIN pages p ON p.id = f.page_id
                 JOIN resource_index r
                    ON r.identifier_type = 'url' AND r.identifier_value = p.url
                 WHERE r.task_id = ?1
                 ORDER BY f.created_at DESC, f.id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![task_id.to_string(), limit as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ==================== Claims ====================

    /// Insert a claim together with its origin edges, atomically. Every
    /// claim enters the store with at least one origin edge.
    pub fn insert_claim(&self, claim: &Claim, origin_fragments: &[FragmentId]) -> Result<()> {
        if origin_fragments.is_empty() {
            return Err(Error::invalid_input(
                "a claim requires at least one origin fragment",
            ));
        }
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO claims (id, task_id, text, llm_confidence_raw,
                                     adoption_status, granularity, expected_polarity,
                                     created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    claim.id.to_string(),
                    claim.task_id.to_string(),
                    claim.text,
                    claim.llm_confidence_raw,
                    claim.adoption_status.to_string(),
                    claim.granularity.to_string(),
                    claim.expected_polarity.to_string(),
                    claim.created_at.to_rfc3339(),
                ],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO edges
                        (id, source_kind, source_id, target_kind, target_id, relation,
                         created_at)
                     VALUES (?1, 'fragment', ?2, 'claim', ?3, 'origin', ?4)",
                )?;
                for fragment in origin_fragments {
                    stmt.execute(params![
                        EdgeId::new().to_string(),
                        fragment.to_string(),
                        claim.id.to_string(),
                        Utc::now().to_rfc3339(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Get a claim by id.
    pub fn get_claim(&self, id: &ClaimId) -> Result<Option<Claim>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, task_id, text, llm_confidence_raw, adoption_status,
                        granularity, expected_polarity, created_at
                 FROM claims WHERE id = ?1",
                params![id.to_string()],
                row_to_claim,
            )
            .optional()
        })
    }

    /// All claims of a task.
    pub fn claims_for_task(&self, task_id: &TaskId) -> Result<Vec<Claim>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, text, llm_confidence_raw, adoption_status,
                        granularity, expected_polarity, created_at
                 FROM claims WHERE task_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map(params![task_id.to_string()], row_to_claim)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Reject a claim with an audited reason. The only mutation a claim
    /// ever sees.
    pub fn reject_claim(&self, id: &ClaimId, reason: &str) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE claims SET adoption_status = 'rejected', rejection_reason = ?2
                 WHERE id = ?1",
                params![id.to_string(), reason],
            )
        })?;
        if changed == 0 {
            return Err(Error::invalid_input(format!("unknown claim {}", id)));
        }
        self.log_event("claim_rejected", None, None, reason)?;
        Ok(())
    }

    // ==================== Edges ====================

    /// Insert an edge, tolerating duplicates: if an edge with the same
    /// endpoints and relation exists, its id is returned unchanged.
    pub fn insert_edge(&self, edge: &Edge) -> Result<EdgeId> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO edges
                    (id, source_kind, source_id, target_kind, target_id, relation,
                     confidence, source_domain_category, corrected_by_human,
                     correction_note, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    edge.id.to_string(),
                    edge.source_kind.to_string(),
                    edge.source_id,
                    edge.target_kind.to_string(),
                    edge.target_id,
                    edge.relation.to_string(),
                    edge.confidence,
                    edge.source_domain_category.map(|c| c.to_string()),
                    edge.corrected_by_human,
                    edge.correction_note,
                    edge.created_at.to_rfc3339(),
                ],
            )?;
            if inserted > 0 {
                Ok(edge.id.clone())
            } else {
                let existing: String = conn.query_row(
                    "SELECT id FROM edges
                     WHERE source_kind = ?1 AND source_id = ?2
                       AND target_kind = ?3 AND target_id = ?4 AND relation = ?5",
                    params![
                        edge.source_kind.to_string(),
                        edge.source_id,
                        edge.target_kind.to_string(),
                        edge.target_id,
                        edge.relation.to_string(),
                    ],
                    |row| row.get(0),
                )?;
                Ok(parse_id(existing, EdgeId))
            }
        })
    }

    /// Get an edge by id.
    pub fn get_edge(&self, id: &EdgeId) -> Result<Option<Edge>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, source_kind, source_id, target_kind, target_id, relation,
                        confidence, source_domain_category, corrected_by_human,
                        correction_note, created_at
                 FROM edges WHERE id = ?1",
                params![id.to_string()],
                row_to_edge,
            )
            .optional()
        })
    }

    /// Whether an NLI verdict already exists for a (fragment, claim) pair.
    pub fn nli_verdict_exists(&self, fragment: &FragmentId, claim: &ClaimId) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM edges
                 WHERE source_kind = 'fragment' AND source_id = ?1
                   AND target_kind = 'claim' AND target_id = ?2
                   AND relation IN ('supports', 'refutes', 'neutral')",
                params![fragment.to_string(), claim.to_string()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// All edges pointing at a claim.
    pub fn edges_for_claim(&self, claim: &ClaimId) -> Result<Vec<Edge>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_kind, source_id, target_kind, target_id, relation,
                        confidence, source_domain_category, corrected_by_human,
                        correction_note, created_at
                 FROM edges
                 WHERE target_kind = 'claim' AND target_id = ?1
                 ORDER BY created_at, id",
            )?;
            let rows = stmt
                .query_map(params![claim.to_string()], row_to_edge)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// All edges targeting any claim of a task.
    pub fn edges_for_task(&self, task_id: &TaskId) -> Result<Vec<Edge>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.source_kind, e.source_id, e.target_kind, e.target_id,
                        e.relation, e.confidence, e.source_domain_category,
                        e.corrected_by_human, e.correction_note, e.created_at
                 FROM edges e
                 JOIN claims c ON c.id = e.target_id AND e.target_kind = 'claim'
                 WHERE c.task_id = ?1
                 ORDER BY e.created_at, e.id",
            )?;
            let rows = stmt
                .query_map(params![task_id.to_string()], row_to_edge)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Apply a human correction to an edge: flip the relation and/or the
    /// confidence, with an audit note.
    pub fn correct_edge(
        &self,
        id: &EdgeId,
        relation: EdgeRelation,
        confidence: Option<f64>,
        note: &str,
    ) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE edges SET relation = ?2, confidence = ?3,
                        corrected_by_human = 1, correction_note = ?4
                 WHERE id = ?1",
                params![id.to_string(), relation.to_string(), confidence, note],
            )
        })?;
        if changed == 0 {
            return Err(Error::invalid_input(format!("unknown edge {}", id)));
        }
        Ok(())
    }

    // ==================== Resource index ====================

    /// Claim exclusive ownership of a resource across workers. Race-safe:
    /// an insert-if-absent followed by a read of the winner.
    pub fn claim_resource(
        &self,
        identifier_type: &str,
        identifier_value: &str,
        worker_id: &str,
        task_id: Option<&TaskId>,
    ) -> Result<ResourceClaim> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO resource_index
                    (identifier_type, identifier_value, worker_id, task_id, claimed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    identifier_type,
                    identifier_value,
                    worker_id,
                    task_id.map(|t| t.to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            let owner: String = conn.query_row(
                "SELECT worker_id FROM resource_index
                 WHERE identifier_type = ?1 AND identifier_value = ?2",
                params![identifier_type, identifier_value],
                |row| row.get(0),
            )?;
            if owner == worker_id {
                Ok(ResourceClaim::Claimed)
            } else {
                Ok(ResourceClaim::AlreadyClaimedBy(owner))
            }
        })
    }

    /// Record the page a claimed resource resolved to.
    pub fn bind_resource_page(
        &self,
        identifier_type: &str,
        identifier_value: &str,
        page_id: &PageId,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE resource_index SET page_id = ?3
                 WHERE identifier_type = ?1 AND identifier_value = ?2",
                params![identifier_type, identifier_value, page_id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Release a claimed resource, e.g. when its fetch failed permanently.
    pub fn release_resource(&self, identifier_type: &str, identifier_value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM resource_index
                 WHERE identifier_type = ?1 AND identifier_value = ?2",
                params![identifier_type, identifier_value],
            )?;
            Ok(())
        })
    }

    // ==================== Domain rules ====================

    /// Assign a trust category to a domain.
    pub fn set_domain_category(&self, domain: &str, category: DomainCategory) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO domain_rules (domain, category) VALUES (?1, ?2)
                 ON CONFLICT(domain) DO UPDATE SET category = excluded.category",
                params![domain, category.to_string()],
            )?;
            Ok(())
        })
    }

    /// Trust category of a domain; unknown domains are unverified.
    pub fn domain_category(&self, domain: &str) -> Result<DomainCategory> {
        self.with_conn(|conn| {
            let found: Option<String> = conn
                .query_row(
                    "SELECT category FROM domain_rules WHERE domain = ?1",
                    params![domain],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found
                .and_then(|s| DomainCategory::parse(&s).ok())
                .unwrap_or(DomainCategory::Unverified))
        })
    }

    // ==================== Event log & extraction errors ====================

    /// Append a structured event.
    pub fn log_event(
        &self,
        kind: &str,
        task_id: Option<&TaskId>,
        job_id: Option<&JobId>,
        detail: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO event_log (kind, task_id, job_id, detail) VALUES (?1, ?2, ?3, ?4)",
                params![
                    kind,
                    task_id.map(|t| t.to_string()),
                    job_id.map(|j| j.to_string()),
                    detail,
                ],
            )?;
            Ok(())
        })
    }

    /// Record a failed extraction attempt for a page.
    pub fn record_extraction_error(&self, page_id: &PageId, attempt: u32, detail: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO extraction_errors (page_id, attempt, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![page_id.to_string(), attempt, detail, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Raw connection handle, shared with the embedding index and views.
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
    )
}

/// Escape a free-text query into a quoted FTS5 match expression.
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|t| t.len() > 2)
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn parse_id<T>(s: String, wrap: impl Fn(uuid::Uuid) -> T) -> T {
    // Ids in the store were written by this crate; a parse failure means
    // corruption, which maps to the nil uuid rather than a panic mid-query.
    wrap(uuid::Uuid::parse_str(&s).unwrap_or(uuid::Uuid::nil()))
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: parse_id(row.get::<_, String>(0)?, TaskId),
        hypothesis: row.get(1)?,
        status: TaskStatus::parse(&row.get::<_, String>(2)?).unwrap_or(TaskStatus::Pending),
        budget: TaskBudget {
            max_pages: row.get(3)?,
            max_wall_secs: row.get::<_, i64>(4)? as u64,
        },
        created_at: parse_datetime(row.get::<_, String>(5)?),
        updated_at: parse_datetime(row.get::<_, String>(6)?),
    })
}

fn row_to_query(row: &rusqlite::Row) -> rusqlite::Result<Query> {
    Ok(Query {
        id: parse_id(row.get::<_, String>(0)?, QueryId),
        task_id: parse_id(row.get::<_, String>(1)?, TaskId),
        text: row.get(2)?,
        query_type: QueryType::parse(&row.get::<_, String>(3)?).unwrap_or(QueryType::Initial),
        parent_query_id: row
            .get::<_, Option<String>>(4)?
            .map(|s| parse_id(s, QueryId)),
        depth: row.get(5)?,
        harvest_rate: row.get(6)?,
        status: QueryStatus::parse(&row.get::<_, String>(7)?).unwrap_or(QueryStatus::Pending),
        created_at: parse_datetime(row.get::<_, String>(8)?),
    })
}

fn row_to_page(row: &rusqlite::Row) -> rusqlite::Result<Page> {
    Ok(Page {
        id: parse_id(row.get::<_, String>(0)?, PageId),
        url: row.get(1)?,
        domain: row.get(2)?,
        http_status: row.get(3)?,
        content_hash: row.get(4)?,
        title: row.get(5)?,
        language: row.get(6)?,
        canonical_id: row.get(7)?,
        body_path: row.get(8)?,
        domain_category: DomainCategory::parse(&row.get::<_, String>(9)?)
            .unwrap_or(DomainCategory::Unverified),
        fetched_at: parse_datetime(row.get::<_, String>(10)?),
    })
}

fn row_to_fragment(row: &rusqlite::Row) -> rusqlite::Result<Fragment> {
    Ok(Fragment {
        id: parse_id(row.get::<_, String>(0)?, FragmentId),
        page_id: parse_id(row.get::<_, String>(1)?, PageId),
        kind: FragmentKind::parse(&row.get::<_, String>(2)?).unwrap_or(FragmentKind::Paragraph),
        position: row.get(3)?,
        text: row.get(4)?,
        heading_context: row.get(5)?,
        text_hash: row.get(6)?,
        bm25_score: row.get(7)?,
        embedding_score: row.get(8)?,
        rerank_score: row.get(9)?,
    })
}

fn row_to_claim(row: &rusqlite::Row) -> rusqlite::Result<Claim> {
    Ok(Claim {
        id: parse_id(row.get::<_, String>(0)?, ClaimId),
        task_id: parse_id(row.get::<_, String>(1)?, TaskId),
        text: row.get(2)?,
        llm_confidence_raw: row.get(3)?,
        adoption_status: AdoptionStatus::parse(&row.get::<_, String>(4)?)
            .unwrap_or(AdoptionStatus::Adopted),
        granularity: Granularity::parse(&row.get::<_, String>(5)?).unwrap_or(Granularity::Atomic),
        expected_polarity: Polarity::parse(&row.get::<_, String>(6)?)
            .unwrap_or(Polarity::Uncertain),
        created_at: parse_datetime(row.get::<_, String>(7)?),
    })
}

fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<Edge> {
    Ok(Edge {
        id: parse_id(row.get::<_, String>(0)?, EdgeId),
        source_kind: NodeKind::parse(&row.get::<_, String>(1)?).unwrap_or(NodeKind::Fragment),
        source_id: row.get(2)?,
        target_kind: NodeKind::parse(&row.get::<_, String>(3)?).unwrap_or(NodeKind::Claim),
        target_id: row.get(4)?,
        relation: EdgeRelation::parse(&row.get::<_, String>(5)?).unwrap_or(EdgeRelation::Neutral),
        confidence: row.get(6)?,
        source_domain_category: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| DomainCategory::parse(&s).ok()),
        corrected_by_human: row.get(8)?,
        correction_note: row.get(9)?,
        created_at: parse_datetime(row.get::<_, String>(10)?),
    })
}

const JOB_COLUMNS: &str =
    "id, task_id, kind, priority, slot, state, input_json, output_json,
     cause_id, domain, attempt, queued_at, started_at, finished_at, error";

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let input: String = row.get(6)?;
    let output: Option<String> = row.get(7)?;
    Ok(Job {
        id: parse_id(row.get::<_, String>(0)?, JobId),
        task_id: row.get::<_, Option<String>>(1)?.map(|s| parse_id(s, TaskId)),
        kind: JobKind::parse(&row.get::<_, String>(2)?).unwrap_or(JobKind::Fetch),
        priority: row.get(3)?,
        slot: Slot::parse(&row.get::<_, String>(4)?).unwrap_or(Slot::CpuNlp),
        state: JobState::parse(&row.get::<_, String>(5)?).unwrap_or(JobState::Pending),
        input: serde_json::from_str(&input).unwrap_or(Value::Null),
        output: output.and_then(|s| serde_json::from_str(&s).ok()),
        cause_id: row.get::<_, Option<String>>(8)?.map(|s| parse_id(s, JobId)),
        domain: row.get(9)?,
        attempt: row.get(10)?,
        queued_at: parse_datetime(row.get::<_, String>(11)?),
        started_at: row.get::<_, Option<String>>(12)?.map(parse_datetime),
        finished_at: row.get::<_, Option<String>>(13)?.map(parse_datetime),
        error: row.get(14)?,
    })
}

impl EvidenceStore {
    // ==================== Jobs ====================

    /// Persist a new job.
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, task_id, kind, priority, slot, state, input_json,
                                   output_json, cause_id, domain, attempt, queued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    job.id.to_string(),
                    job.task_id.as_ref().map(|t| t.to_string()),
                    job.kind.to_string(),
                    job.priority,
                    job.slot.to_string(),
                    job.state.to_string(),
                    job.input.to_string(),
                    job.output.as_ref().map(|o| o.to_string()),
                    job.cause_id.as_ref().map(|c| c.to_string()),
                    job.domain,
                    job.attempt,
                    job.queued_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Get a job by id.
    pub fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id.to_string()],
                row_to_job,
            )
            .optional()
        })
    }

    /// Pending jobs ready to run, in claim order: priority, then FIFO,
    /// then id. Jobs requeued with a backoff delay stay invisible until
    /// their `queued_at` arrives.
    pub fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs WHERE state = 'pending' AND queued_at <= ?1
                 ORDER BY priority, queued_at, id LIMIT ?2",
                JOB_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![Utc::now().to_rfc3339(), limit as i64], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Atomically move a pending job to queued. Returns false if another
    /// worker claimed it first.
    pub fn try_claim_job(&self, id: &JobId) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET state = 'queued' WHERE id = ?1 AND state = 'pending'",
                params![id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Transition a job, enforcing the lifecycle DAG.
    pub fn transition_job(&self, id: &JobId, next: JobState) -> Result<()> {
        let job = self
            .get_job(id)?
            .ok_or_else(|| Error::invalid_input(format!("unknown job {}", id)))?;
        if !job.state.can_transition_to(next) {
            return Err(Error::invalid_input(format!(
                "job {} cannot go {} -> {}",
                id, job.state, next
            )));
        }
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            match next {
                JobState::Running => conn.execute(
                    "UPDATE jobs SET state = ?2, started_at = ?3 WHERE id = ?1",
                    params![id.to_string(), next.to_string(), now],
                ),
                s if s.is_terminal() => conn.execute(
                    "UPDATE jobs SET state = ?2, finished_at = ?3 WHERE id = ?1",
                    params![id.to_string(), next.to_string(), now],
                ),
                _ => conn.execute(
                    "UPDATE jobs SET state = ?2 WHERE id = ?1",
                    params![id.to_string(), next.to_string()],
                ),
            }?;
            Ok(())
        })
    }

    /// Record a successful job result.
    pub fn complete_job(&self, id: &JobId, output: &Value) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET state = 'completed', output_json = ?2, finished_at = ?3
                 WHERE id = ?1 AND state = 'running'",
                params![id.to_string(), output.to_string(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Record a failed job with its error message. A job already cancelled
    /// by `stop_task` keeps its cancelled state.
    pub fn fail_job(&self, id: &JobId, error: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET state = 'failed', error = ?2, finished_at = ?3
                 WHERE id = ?1 AND state = 'running'",
                params![id.to_string(), error, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Requeue a running job for retry after a backoff delay, bumping the
    /// attempt counter. The job re-enters the queue at the back of its
    /// priority tier once the delay elapses.
    pub fn requeue_job(&self, id: &JobId, error: &str, delay: Duration) -> Result<u32> {
        let not_before = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET state = 'pending', attempt = attempt + 1,
                        error = ?2, queued_at = ?3
                 WHERE id = ?1 AND state = 'running'",
                params![id.to_string(), error, not_before.to_rfc3339()],
            )?;
            conn.query_row(
                "SELECT attempt FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
        })
    }

    /// Cancel every non-terminal job of a task. Returns the ids affected.
    pub fn cancel_task_jobs(&self, task_id: &TaskId) -> Result<Vec<JobId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM jobs
                 WHERE task_id = ?1
                   AND state IN ('pending', 'queued', 'running', 'awaiting_auth')",
            )?;
            let ids: Vec<String> = stmt
                .query_map(params![task_id.to_string()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let now = Utc::now().to_rfc3339();
            for id in &ids {
                conn.execute(
                    "UPDATE jobs SET state = 'cancelled', finished_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
            }
            Ok(ids.into_iter().map(|s| parse_id(s, JobId)).collect())
        })
    }

    /// Counts of jobs by state, for status reporting.
    pub fn job_counts(&self, task_id: Option<&TaskId>) -> Result<Vec<(JobState, u32)>> {
        self.with_conn(|conn| {
            let (sql, task) = match task_id {
                Some(t) => (
                    "SELECT state, COUNT(*) FROM jobs WHERE task_id = ?1 GROUP BY state",
                    Some(t.to_string()),
                ),
                None => ("SELECT state, COUNT(*) FROM jobs GROUP BY state", None),
            };
            let mut stmt = conn.prepare(sql)?;
            let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(JobState, u32)> {
                let state = JobState::parse(&row.get::<_, String>(0)?)
                    .unwrap_or(JobState::Pending);
                Ok((state, row.get(1)?))
            };
            let rows = match task {
                Some(t) => stmt
                    .query_map(params![t], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
                None => stmt
                    .query_map([], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
            };
            Ok(rows)
        })
    }

    // ==================== Auth queue ====================

    /// Park a job in the authentication queue.
    pub fn push_auth_queue(&self, job_id: &JobId, url: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_queue (job_id, url, created_at) VALUES (?1, ?2, ?3)",
                params![job_id.to_string(), url, Utc::now().to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Unresolved auth-queue entries, oldest first.
    pub fn pending_auth_entries(&self) -> Result<Vec<AuthQueueEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, url, resolved, created_at, resolved_at
                 FROM auth_queue WHERE resolved = 0 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(AuthQueueEntry {
                        id: row.get(0)?,
                        job_id: parse_id(row.get::<_, String>(1)?, JobId),
                        url: row.get(2)?,
                        resolved: row.get(3)?,
                        created_at: parse_datetime(row.get::<_, String>(4)?),
                        resolved_at: row.get::<_, Option<String>>(5)?.map(parse_datetime),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Mark an auth-queue entry resolved, returning the suspended job id.
    pub fn resolve_auth_entry(&self, entry_id: i64) -> Result<JobId> {
        let job_id: Option<String> = self.with_conn(|conn| {
            let job: Option<String> = conn
                .query_row(
                    "SELECT job_id FROM auth_queue WHERE id = ?1 AND resolved = 0",
                    params![entry_id],
                    |row| row.get(0),
                )
                .optional()?;
            if job.is_some() {
                conn.execute(
                    "UPDATE auth_queue SET resolved = 1, resolved_at = ?2 WHERE id = ?1",
                    params![entry_id, Utc::now().to_rfc3339()],
                )?;
            }
            Ok(job)
        })?;
        job_id
            .map(|s| parse_id(s, JobId))
            .ok_or_else(|| Error::invalid_input(format!("unknown auth entry {}", entry_id)))
    }

    // ==================== Calibration ====================

    /// Store a calibration parameter version for a source.
    pub fn insert_calibration_params(
        &self,
        source: &str,
        version: i64,
        method: &str,
        param_a: f64,
        param_b: f64,
        activate: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            if activate {
                tx.execute(
                    "UPDATE calibration_params SET active = 0 WHERE source = ?1",
                    params![source],
                )?;
            }
            tx.execute(
                "INSERT INTO calibration_params
                    (source, version, method, param_a, param_b, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    source,
                    version,
                    method,
                    param_a,
                    param_b,
                    activate,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// The active calibration parameters for a source:
    /// (version, method, a, b).
    pub fn active_calibration_params(
        &self,
        source: &str,
    ) -> Result<Option<(i64, String, f64, f64)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT version, method, param_a, param_b FROM calibration_params
                 WHERE source = ?1 AND active = 1",
                params![source],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
        })
    }

    /// Atomically re-activate the previous parameter version. Returns the
    /// version rolled back to.
    pub fn rollback_calibration(&self, source: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT version FROM calibration_params
                     WHERE source = ?1 AND active = 1",
                    params![source],
                    |row| row.get(0),
                )
                .optional()?;
            let previous: Option<i64> = match current {
                Some(v) => tx.query_row(
                    "SELECT MAX(version) FROM calibration_params
                     WHERE source = ?1 AND version < ?2",
                    params![source, v],
                    |row| row.get::<_, Option<i64>>(0),
                )?,
                None => None,
            };
            let Some(previous) = previous else {
                return Ok(-1);
            };
            tx.execute(
                "UPDATE calibration_params SET active = 0 WHERE source = ?1",
                params![source],
            )?;
            tx.execute(
                "UPDATE calibration_params SET active = 1
                 WHERE source = ?1 AND version = ?2",
                params![source, previous],
            )?;
            tx.commit()?;
            Ok(previous)
        })
        .and_then(|v| {
            if v < 0 {
                Err(Error::invalid_input(format!(
                    "no previous calibration version for source {:?}",
                    source
                )))
            } else {
                Ok(v)
            }
        })
    }

    /// Append a human-corrected calibration sample. Returns the total
    /// samples recorded for the source.
    pub fn add_calibration_sample(&self, source: &str, raw_prob: f64, outcome: bool) -> Result<u64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO calibration_samples (source, raw_prob, outcome, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source, raw_prob, outcome, Utc::now().to_rfc3339()],
            )?;
            conn.query_row(
                "SELECT COUNT(*) FROM calibration_samples WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
        })
    }

    /// The newest calibration samples for a source as (raw_prob, outcome),
    /// newest first, bounded by `limit`.
    pub fn calibration_samples(&self, source: &str, limit: usize) -> Result<Vec<(f64, bool)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT raw_prob, outcome FROM calibration_samples
                 WHERE source = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![source, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
