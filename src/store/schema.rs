//! SQLite schema and migrations for the evidence store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL for concurrent readers alongside the single writer.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // Writers block briefly instead of failing on contention.
    conn.pragma_update(None, "busy_timeout", 5_000)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            hypothesis TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            max_pages INTEGER NOT NULL,
            max_wall_secs INTEGER NOT NULL,
            pages_fetched INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queries (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            text TEXT NOT NULL,
            query_type TEXT NOT NULL,
            parent_query_id TEXT,
            depth INTEGER NOT NULL DEFAULT 0,
            harvest_rate REAL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queries_task ON queries(task_id);

        CREATE TABLE IF NOT EXISTS serp_items (
            query_id TEXT NOT NULL REFERENCES queries(id) ON DELETE CASCADE,
            url TEXT NOT NULL,
            rank INTEGER NOT NULL,
            title TEXT NOT NULL,
            snippet TEXT NOT NULL,
            PRIMARY KEY (query_id, url)
        );

        CREATE TABLE IF NOT EXISTS pages (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL UNIQUE,
            domain TEXT NOT NULL,
            http_status INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            title TEXT,
            language TEXT,
            canonical_id TEXT,
            body_path TEXT,
            domain_category TEXT NOT NULL DEFAULT 'unverified',
            fetched_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pages_domain ON pages(domain);
        CREATE INDEX IF NOT EXISTS idx_pages_canonical ON pages(canonical_id);

        CREATE TABLE IF NOT EXISTS works (
            id TEXT PRIMARY KEY,
            canonical_id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            year INTEGER,
            venue TEXT,
            doi TEXT,
            source_api TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS work_authors (
            work_id TEXT NOT NULL REFERENCES works(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (work_id, position)
        );

        CREATE TABLE IF NOT EXISTS work_identifiers (
            identifier_type TEXT NOT NULL,
            identifier_value TEXT NOT NULL,
            work_id TEXT NOT NULL REFERENCES works(id) ON DELETE CASCADE,
            PRIMARY KEY (identifier_type, identifier_value)
        );

        CREATE TABLE IF NOT EXISTS fragments (
            id TEXT PRIMARY KEY,
            page_id TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            position INTEGER NOT NULL,
            text TEXT NOT NULL,
            heading_context TEXT,
            text_hash TEXT NOT NULL,
            bm25_score REAL,
            embedding_score REAL,
            rerank_score REAL,
            created_at TEXT NOT NULL,
            UNIQUE (page_id, text_hash)
        );
        CREATE INDEX IF NOT EXISTS idx_fragments_page ON fragments(page_id);
        CREATE INDEX IF NOT EXISTS idx_fragments_hash ON fragments(text_hash);

        CREATE TABLE IF NOT EXISTS claims (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            text TEXT NOT NULL,
            llm_confidence_raw REAL NOT NULL,
            adoption_status TEXT NOT NULL DEFAULT 'adopted',
            granularity TEXT NOT NULL DEFAULT 'atomic',
            expected_polarity TEXT NOT NULL DEFAULT 'uncertain',
            rejection_reason TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_claims_task ON claims(task_id);

        CREATE TABLE IF NOT EXISTS edges (
            id TEXT PRIMARY KEY,
            source_kind TEXT NOT NULL,
            source_id TEXT NOT NULL,
            target_kind TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relation TEXT NOT NULL,
            confidence REAL,
            source_domain_category TEXT,
            corrected_by_human INTEGER NOT NULL DEFAULT 0,
            correction_note TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (source_kind, source_id, target_kind, target_id, relation)
        );
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_kind, target_id);
        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_kind, source_id);

        CREATE TABLE IF NOT EXISTS embeddings (
            target_kind TEXT NOT NULL,
            target_id TEXT NOT NULL,
            model_id TEXT NOT NULL,
            vector BLOB NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (target_kind, target_id, model_id)
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            task_id TEXT,
            kind TEXT NOT NULL,
            priority INTEGER NOT NULL,
            slot TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            input_json TEXT NOT NULL,
            output_json TEXT,
            cause_id TEXT,
            domain TEXT,
            attempt INTEGER NOT NULL DEFAULT 0,
            queued_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(state, priority, queued_at, id);
        CREATE INDEX IF NOT EXISTS idx_jobs_task ON jobs(task_id);

        CREATE TABLE IF NOT EXISTS resource_index (
            identifier_type TEXT NOT NULL,
            identifier_value TEXT NOT NULL,
            worker_id TEXT NOT NULL,
            task_id TEXT,
            page_id TEXT,
            claimed_at TEXT NOT NULL,
            PRIMARY KEY (identifier_type, identifier_value)
        );

        CREATE TABLE IF NOT EXISTS auth_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            url TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            resolved_at TEXT
        );

        CREATE TABLE IF NOT EXISTS extraction_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            page_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            detail TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS event_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            task_id TEXT,
            job_id TEXT,
            detail TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS calibration_params (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            version INTEGER NOT NULL,
            method TEXT NOT NULL,
            param_a REAL NOT NULL,
            param_b REAL NOT NULL DEFAULT 0.0,
            active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (source, version)
        );

        CREATE TABLE IF NOT EXISTS calibration_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            raw_prob REAL NOT NULL,
            outcome INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_calibration_samples_source
            ON calibration_samples(source, id);

        CREATE TABLE IF NOT EXISTS domain_rules (
            domain TEXT PRIMARY KEY,
            category TEXT NOT NULL
        );
        ",
    )?;

    // Full-text search over fragment text, kept in sync by triggers.
    conn.execute_batch(
        "
        CREATE VIRTUAL TABLE IF NOT EXISTS fragments_fts USING fts5(
            text,
            content='fragments',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS fragments_ai AFTER INSERT ON fragments BEGIN
            INSERT INTO fragments_fts(rowid, text) VALUES (NEW.rowid, NEW.text);
        END;
        CREATE TRIGGER IF NOT EXISTS fragments_ad AFTER DELETE ON fragments BEGIN
            INSERT INTO fragments_fts(fragments_fts, rowid, text)
                VALUES ('delete', OLD.rowid, OLD.text);
        END;
        ",
    )?;

    create_views(conn)?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Read views over the core tables. Truth confidence is derived here, never
/// stored: the Beta(1,1) posterior mean over calibrated NLI confidences.
fn create_views(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "
        CREATE VIEW IF NOT EXISTS v_claim_evidence AS
        SELECT
            claim_id,
            task_id,
            text,
            llm_confidence_raw,
            adoption_status,
            support_sum,
            refute_sum,
            support_count,
            refute_count,
            neutral_count,
            (1.0 + support_sum) / (2.0 + support_sum + refute_sum)
                AS truth_confidence,
            CAST(MIN(support_count, refute_count) AS REAL)
                / MAX(1, support_count + refute_count + neutral_count)
                AS controversy
        FROM (
            SELECT
                c.id AS claim_id,
                c.task_id AS task_id,
                c.text AS text,
                c.llm_confidence_raw AS llm_confidence_raw,
                c.adoption_status AS adoption_status,
                COALESCE(SUM(CASE WHEN e.relation = 'supports'
                    THEN e.confidence END), 0.0) AS support_sum,
                COALESCE(SUM(CASE WHEN e.relation = 'refutes'
                    THEN e.confidence END), 0.0) AS refute_sum,
                COUNT(CASE WHEN e.relation = 'supports' THEN 1 END)
                    AS support_count,
                COUNT(CASE WHEN e.relation = 'refutes' THEN 1 END)
                    AS refute_count,
                COUNT(CASE WHEN e.relation = 'neutral' THEN 1 END)
                    AS neutral_count
            FROM claims c
            LEFT JOIN edges e
                ON e.target_kind = 'claim'
                AND e.target_id = c.id
                AND e.relation IN ('supports', 'refutes', 'neutral')
            GROUP BY c.id
        );

        CREATE VIEW IF NOT EXISTS v_contradictions AS
        SELECT * FROM v_claim_evidence
        WHERE support_count > 0 AND refute_count > 0
        ORDER BY controversy DESC, claim_id;

        CREATE VIEW IF NOT EXISTS v_claim_origins AS
        SELECT
            c.id AS claim_id,
            c.text AS claim_text,
            f.id AS fragment_id,
            f.heading_context AS heading_context,
            p.id AS page_id,
            p.url AS url,
            p.domain AS domain
        FROM claims c
        JOIN edges e
            ON e.target_kind = 'claim' AND e.target_id = c.id
            AND e.relation = 'origin'
        JOIN fragments f ON f.id = e.source_id
        JOIN pages p ON p.id = f.page_id;

        CREATE VIEW IF NOT EXISTS v_evidence_chain AS
        SELECT
            c.id AS claim_id,
            e.relation AS relation,
            e.confidence AS confidence,
            f.id AS fragment_id,
            f.kind AS fragment_kind,
            p.id AS page_id,
            p.url AS url,
            p.domain AS domain,
            cited.id AS cited_page_id,
            cited.url AS cited_url
        FROM claims c
        JOIN edges e
            ON e.target_kind = 'claim' AND e.target_id = c.id
        JOIN fragments f ON f.id = e.source_id
        JOIN pages p ON p.id = f.page_id
        LEFT JOIN edges cite
            ON cite.relation = 'cites'
            AND cite.source_kind = 'page' AND cite.source_id = p.id
        LEFT JOIN pages cited ON cited.id = cite.target_id;

        CREATE VIEW IF NOT EXISTS v_hub_pages AS
        SELECT
            p.id AS page_id,
            p.url AS url,
            p.domain AS domain,
            COUNT(e.id) AS citation_count
        FROM pages p
        JOIN edges e
            ON e.relation = 'cites'
            AND e.target_kind = 'page' AND e.target_id = p.id
        GROUP BY p.id
        ORDER BY citation_count DESC, p.id;

        CREATE VIEW IF NOT EXISTS v_orphan_sources AS
        SELECT p.id AS page_id, p.url AS url, p.domain AS domain,
               p.fetched_at AS fetched_at
        FROM pages p
        WHERE NOT EXISTS (
            SELECT 1 FROM fragments f
            JOIN edges e ON e.source_kind = 'fragment' AND e.source_id = f.id
            WHERE f.page_id = p.id
        );

        CREATE VIEW IF NOT EXISTS v_evidence_freshness AS
        SELECT
            c.id AS claim_id,
            MIN(p.fetched_at) AS oldest_evidence,
            MAX(p.fetched_at) AS newest_evidence,
            COUNT(DISTINCT p.id) AS page_count
        FROM claims c
        JOIN edges e
            ON e.target_kind = 'claim' AND e.target_id = c.id
            AND e.relation IN ('supports', 'refutes', 'neutral')
        JOIN fragments f ON f.id = e.source_id
        JOIN pages p ON p.id = f.page_id
        GROUP BY c.id;

        CREATE VIEW IF NOT EXISTS v_emerging_consensus AS
        SELECT v.*, domains.domain_count
        FROM v_claim_evidence v
        JOIN (
            SELECT e.target_id AS claim_id,
                   COUNT(DISTINCT p.domain) AS domain_count
            FROM edges e
            JOIN fragments f ON f.id = e.source_id
            JOIN pages p ON p.id = f.page_id
            WHERE e.target_kind = 'claim' AND e.relation = 'supports'
            GROUP BY e.target_id
        ) domains ON domains.claim_id = v.claim_id
        WHERE v.truth_confidence >= 0.75
          AND v.refute_count = 0
          AND domains.domain_count >= 2
        ORDER BY v.truth_confidence DESC, v.claim_id;

        CREATE VIEW IF NOT EXISTS v_orphan_claims AS
        SELECT c.id AS claim_id, c.task_id, c.text
        FROM claims c
        WHERE NOT EXISTS (
            SELECT 1 FROM edges e
            WHERE e.target_kind = 'claim' AND e.target_id = c.id
              AND e.relation = 'origin'
        );
        ",
    )
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='tasks'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
