// src/core/schemas.rs
// Centralized database schema definitions for the registry and oracle cache.

// --- Registry (topics, books, chunks, projections, cross-references) ---
pub const REGISTRY_DB_NAME: &str = "registry.db";

pub const REGISTRY_SCHEMA_BOOKS: &str = "
    CREATE TABLE IF NOT EXISTS books (
        book_id TEXT PRIMARY KEY,
        science TEXT NOT NULL,
        title TEXT,
        author TEXT,
        manifest_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
";

pub const REGISTRY_SCHEMA_TOPICS: &str = "
    CREATE TABLE IF NOT EXISTS topics (
        topic_id TEXT PRIMARY KEY,
        parent_topic_id TEXT,
        display_title_ar TEXT NOT NULL,
        display_title_en TEXT,
        aliases_ar TEXT NOT NULL DEFAULT '[]',
        aliases_en TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL DEFAULT 'active',
        created_by TEXT NOT NULL,
        created_at TEXT NOT NULL,
        notes TEXT DEFAULT '',
        FOREIGN KEY(parent_topic_id) REFERENCES topics(topic_id)
    )
";

pub const REGISTRY_SCHEMA_CHUNKS: &str = "
    CREATE TABLE IF NOT EXISTS chunks (
        chunk_id TEXT PRIMARY KEY,
        book_id TEXT NOT NULL,
        file TEXT NOT NULL,
        dom_anchor TEXT NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        page_index INTEGER,
        body_path TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        supersedes_chunk_id TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY(book_id) REFERENCES books(book_id)
    )
";

pub const REGISTRY_SCHEMA_PROJECTIONS: &str = "
    CREATE TABLE IF NOT EXISTS projections (
        topic_id TEXT NOT NULL,
        chunk_id TEXT NOT NULL,
        canonical_path TEXT NOT NULL,
        projected_path TEXT NOT NULL,
        link_type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY(topic_id, chunk_id),
        FOREIGN KEY(topic_id) REFERENCES topics(topic_id),
        FOREIGN KEY(chunk_id) REFERENCES chunks(chunk_id)
    )
";

pub const REGISTRY_SCHEMA_XREFS: &str = "
    CREATE TABLE IF NOT EXISTS xrefs (
        from_chunk_id TEXT NOT NULL,
        to_chunk_id TEXT NOT NULL,
        relation TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY(from_chunk_id, to_chunk_id, relation)
    )
";

pub const REGISTRY_SCHEMA_INDEX_CHUNKS_BOOK: &str =
    "CREATE INDEX IF NOT EXISTS idx_chunks_book ON chunks(book_id)";
pub const REGISTRY_SCHEMA_INDEX_TOPICS_PARENT: &str =
    "CREATE INDEX IF NOT EXISTS idx_topics_parent ON topics(parent_topic_id)";
pub const REGISTRY_SCHEMA_INDEX_PROJECTIONS_CHUNK: &str =
    "CREATE INDEX IF NOT EXISTS idx_projections_chunk ON projections(chunk_id)";

// --- Oracle cache (Layer C, append-only, keyed by (candidate_id, model_id, prompt_hash)) ---
pub const ORACLE_DB_NAME: &str = "oracle_cache.db";

pub const ORACLE_SCHEMA_CACHE: &str = "
    CREATE TABLE IF NOT EXISTS oracle_cache (
        candidate_id TEXT NOT NULL,
        model_id TEXT NOT NULL,
        prompt_hash TEXT NOT NULL,
        is_heading INTEGER NOT NULL,
        level INTEGER NOT NULL,
        normalized_title TEXT NOT NULL,
        confidence REAL NOT NULL,
        reason TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY(candidate_id, model_id, prompt_hash)
    )
";

// --- Run state (approval gate transitions) ---
pub const RUN_DB_NAME: &str = "runs.db";

pub const RUN_SCHEMA_RUNS: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        book_id TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'PROPOSED',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const RUN_SCHEMA_TRANSITIONS: &str = "
    CREATE TABLE IF NOT EXISTS run_transitions (
        run_id TEXT NOT NULL,
        from_state TEXT NOT NULL,
        to_state TEXT NOT NULL,
        ts TEXT NOT NULL,
        actor TEXT NOT NULL,
        FOREIGN KEY(run_id) REFERENCES runs(run_id)
    )
";
