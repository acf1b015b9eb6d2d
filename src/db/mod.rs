//! SQLite persistence for allocation state
//!
//! One database file holds the catalog rows the engines read (items,
//! recipients) next to the rows they own (runs, allocations, exclusions,
//! pickup receipts).
//!
//! ## Tables
//!
//! - `items` - ingested media descriptors, ordered by creation id
//! - `recipients` - weighted destinations with a per-run quota
//! - `runs` - one row per engine execution, with stats and pool watermark
//! - `allocations` - unique (item, recipient) rows carrying the lifecycle status
//! - `exclusions` - (recipient, item) cooldown bars written by the expiry sweep
//! - `pickup_receipts` - append-only accessor records
//!
//! ## Locking
//!
//! The connection sits behind a mutex, so engine runs in one process never
//! interleave. Engines additionally open `IMMEDIATE` transactions, which take
//! SQLite's write lock up front and exclude runs from other processes.

pub mod schema;
pub mod models;
pub mod items;
pub mod recipients;
pub mod runs;
pub mod allocations;
pub mod exclusions;
pub mod receipts;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::AllocatorError;

/// SQLite database for allocation state
pub struct AllocatorDb {
    conn: Mutex<Connection>,
}

impl AllocatorDb {
    /// Open or create the database inside `storage_dir`
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self, AllocatorError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| AllocatorError::Database(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| AllocatorError::Database(format!("Failed to set PRAGMA: {}", e)))?;
        conn.busy_timeout(busy_timeout)?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, AllocatorError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| AllocatorError::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, AllocatorError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, AllocatorError>
    where
        F: FnOnce(&Connection) -> Result<T, AllocatorError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| AllocatorError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access (needed for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, AllocatorError>
    where
        F: FnOnce(&mut Connection) -> Result<T, AllocatorError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| AllocatorError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, AllocatorError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, AllocatorError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                item_count: count("SELECT COUNT(*) FROM items")?,
                recipient_count: count("SELECT COUNT(*) FROM recipients WHERE active = 1")?,
                run_count: count("SELECT COUNT(*) FROM runs")?,
                unfinished_runs: count("SELECT COUNT(*) FROM runs WHERE finished_at IS NULL")?,
                exclusion_count: count("SELECT COUNT(*) FROM exclusions")?,
                allocations_by_status: allocations::count_by_status(conn)?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub item_count: u64,
    pub recipient_count: u64,
    pub run_count: u64,
    /// Runs that started but never finalized: failed or still running
    pub unfinished_runs: u64,
    pub exclusion_count: u64,
    pub allocations_by_status: HashMap<String, u64>,
}

// Re-exports
pub use models::{
    AccessorInfo, Allocation, AllocationStatus, ExclusionEntry, Item, PickupReceipt, Recipient,
    Run, RunKind,
};
pub use items::NewItem;
pub use recipients::NewRecipient;
pub use allocations::AllocationQuery;
