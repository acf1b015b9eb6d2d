//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::AllocatorError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), AllocatorError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        if current_version < 2 {
            conn.execute_batch("ALTER TABLE runs ADD COLUMN watermark_item_id INTEGER;")
                .map_err(|e| AllocatorError::Database(format!("Failed to migrate runs table: {}", e)))?;
        }
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, AllocatorError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), AllocatorError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), AllocatorError> {
    conn.execute_batch(CATALOG_SCHEMA)
        .map_err(|e| AllocatorError::Database(format!("Failed to create catalog tables: {}", e)))?;

    conn.execute_batch(ALLOCATION_SCHEMA)
        .map_err(|e| AllocatorError::Database(format!("Failed to create allocation tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| AllocatorError::Database(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Items and recipients, written by the ingestion and admin collaborators
const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    locator TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recipients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT,
    weight INTEGER NOT NULL DEFAULT 1 CHECK (weight BETWEEN 1 AND 1000),
    weekly_quota INTEGER NOT NULL DEFAULT 0 CHECK (weekly_quota >= 0),
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
"#;

/// Runs, allocations, exclusions and pickup receipts
const ALLOCATION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    watermark TEXT,
    watermark_item_id INTEGER,
    stats_json TEXT
);

-- One row per (item, recipient), ever. Rows are never deleted.
CREATE TABLE IF NOT EXISTS allocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL REFERENCES items(id),
    recipient_id INTEGER NOT NULL REFERENCES recipients(id),
    run_id INTEGER REFERENCES runs(id),
    status TEXT NOT NULL DEFAULT 'queued',
    expires_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_notified_at TEXT,
    download_token TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (item_id, recipient_id)
);

CREATE TABLE IF NOT EXISTS exclusions (
    recipient_id INTEGER NOT NULL REFERENCES recipients(id),
    item_id INTEGER NOT NULL REFERENCES items(id),
    until TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (recipient_id, item_id)
);

CREATE TABLE IF NOT EXISTS pickup_receipts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    allocation_id INTEGER NOT NULL REFERENCES allocations(id),
    remote_addr TEXT,
    client_id TEXT,
    recorded_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_items_created_at ON items(created_at);
CREATE INDEX IF NOT EXISTS idx_allocations_status_expires ON allocations(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_allocations_run_recipient ON allocations(run_id, recipient_id);
CREATE INDEX IF NOT EXISTS idx_exclusions_item ON exclusions(item_id, until);
CREATE INDEX IF NOT EXISTS idx_runs_kind_finished ON runs(kind, finished_at);
CREATE INDEX IF NOT EXISTS idx_receipts_allocation ON pickup_receipts(allocation_id);
"#;
