//! Schema definitions and bootstrap for the coordinator state store.

use hostd_common::{CoordinatorError, Result};
use rusqlite::Connection;

/// Current schema version, checked against the `user_version` pragma.
pub const SCHEMA_VERSION: u32 = 1;

const CREATE_INSTANCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    spec TEXT NOT NULL,                -- JSON InstanceSpec
    desired TEXT NOT NULL,
    observed TEXT NOT NULL DEFAULT 'unknown',
    container_handle TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    restart_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_reconciled_at TEXT
)
"#;

const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

const CREATE_SAMPLES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS samples (
    instance_id TEXT NOT NULL,
    sampled_at TEXT NOT NULL,
    cpu_percent REAL NOT NULL,
    memory_bytes INTEGER NOT NULL,
    disk_bytes INTEGER NOT NULL
)
"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_instances_drift ON instances (desired, observed)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_instance_status ON tasks (instance_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_samples_instance_time ON samples (instance_id, sampled_at)",
];

/// Create tables and indexes, stamping the schema version on a fresh
/// database. An existing database with a different version is rejected
/// rather than migrated in place.
pub fn bootstrap(conn: &Connection) -> Result<()> {
    let version: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(CoordinatorError::storage)?;

    if version != 0 && version != SCHEMA_VERSION {
        return Err(CoordinatorError::Storage(format!(
            "unsupported state store schema version {version} (expected {SCHEMA_VERSION})"
        )));
    }

    conn.execute(CREATE_INSTANCES_TABLE, [])
        .map_err(CoordinatorError::storage)?;
    conn.execute(CREATE_TASKS_TABLE, [])
        .map_err(CoordinatorError::storage)?;
    conn.execute(CREATE_SAMPLES_TABLE, [])
        .map_err(CoordinatorError::storage)?;
    for index in CREATE_INDEXES {
        conn.execute(index, []).map_err(CoordinatorError::storage)?;
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(CoordinatorError::storage)?;

    Ok(())
}
