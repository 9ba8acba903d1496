//! Database connection and initialization utilities.
//!
//! Low-level SQLite connection primitives and subsystem schema
//! initialization. Mutations go through `core::broker::DbBroker` rather
//! than calling `db_connect` directly, so every write is serialized and
//! appended to the run's audit log.

use crate::core::broker::DbBroker;
use crate::core::error::IbpError;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

/// Establish a SQLite connection with IBP's standard configuration.
///
/// Enables:
/// - WAL (Write-Ahead Logging) mode for better concurrency
/// - Foreign key constraints
/// - 5-second busy timeout for lock contention
pub fn db_connect(db_path: &str) -> Result<Connection, IbpError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

pub fn registry_db_path(root: &Path) -> PathBuf {
    root.join(schemas::REGISTRY_DB_NAME)
}

pub fn oracle_db_path(root: &Path) -> PathBuf {
    root.join(schemas::ORACLE_DB_NAME)
}

pub fn run_db_path(root: &Path) -> PathBuf {
    root.join(schemas::RUN_DB_NAME)
}

/// Initializes the registry (topics, books, chunks, projections, xrefs).
pub fn initialize_registry_db(root: &Path) -> Result<(), IbpError> {
    let db_path = registry_db_path(root);
    fs::create_dir_all(root)?;

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "ibp", None, "registry.init", |conn| {
        conn.execute(schemas::REGISTRY_SCHEMA_BOOKS, [])?;
        conn.execute(schemas::REGISTRY_SCHEMA_TOPICS, [])?;
        conn.execute(schemas::REGISTRY_SCHEMA_CHUNKS, [])?;
        conn.execute(schemas::REGISTRY_SCHEMA_PROJECTIONS, [])?;
        conn.execute(schemas::REGISTRY_SCHEMA_XREFS, [])?;
        conn.execute(schemas::REGISTRY_SCHEMA_INDEX_CHUNKS_BOOK, [])?;
        conn.execute(schemas::REGISTRY_SCHEMA_INDEX_TOPICS_PARENT, [])?;
        conn.execute(schemas::REGISTRY_SCHEMA_INDEX_PROJECTIONS_CHUNK, [])?;
        Ok(())
    })
}

/// Initializes the oracle's persistent, append-only verification cache.
pub fn initialize_oracle_db(root: &Path) -> Result<(), IbpError> {
    let db_path = oracle_db_path(root);
    fs::create_dir_all(root)?;

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "ibp", None, "oracle.init", |conn| {
        conn.execute(schemas::ORACLE_SCHEMA_CACHE, [])?;
        Ok(())
    })
}

/// Initializes the run/approval-gate state table.
pub fn initialize_run_db(root: &Path) -> Result<(), IbpError> {
    let db_path = run_db_path(root);
    fs::create_dir_all(root)?;

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "ibp", None, "runs.init", |conn| {
        conn.execute(schemas::RUN_SCHEMA_RUNS, [])?;
        conn.execute(schemas::RUN_SCHEMA_TRANSITIONS, [])?;
        Ok(())
    })
}
