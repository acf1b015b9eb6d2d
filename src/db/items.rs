//! Item reads and ingestion-side inserts

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use tracing::debug;

use super::models::{format_timestamp, AllocationStatus, Item};
use super::runs::PoolWatermark;
use crate::error::AllocatorError;

/// Input for recording an ingested item
#[derive(Debug, Clone, Deserialize)]
pub struct NewItem {
    pub content_hash: String,
    #[serde(default)]
    pub size_bytes: i64,
    pub locator: String,
    /// Defaults to the insert time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewItem {
    pub fn new(content_hash: impl Into<String>, size_bytes: i64, locator: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            size_bytes,
            locator: locator.into(),
            created_at: None,
        }
    }

    pub fn created_at(mut self, ts: DateTime<Utc>) -> Self {
        self.created_at = Some(ts);
        self
    }
}

pub fn insert_item(conn: &Connection, input: &NewItem) -> Result<Item, AllocatorError> {
    if input.content_hash.is_empty() {
        return Err(AllocatorError::InvalidInput("content_hash must not be empty".into()));
    }

    let created_at = input.created_at.unwrap_or_else(Utc::now);
    conn.execute(
        "INSERT INTO items (content_hash, size_bytes, locator, created_at) VALUES (?, ?, ?, ?)",
        params![
            input.content_hash,
            input.size_bytes,
            input.locator,
            format_timestamp(&created_at),
        ],
    )?;

    let id = conn.last_insert_rowid();
    debug!(item_id = id, hash = %input.content_hash, "Recorded item");

    get_item(conn, id)?
        .ok_or_else(|| AllocatorError::Internal("Item not found after insert".to_string()))
}

pub fn get_item(conn: &Connection, id: i64) -> Result<Option<Item>, AllocatorError> {
    let item = conn
        .query_row("SELECT * FROM items WHERE id = ?", params![id], Item::from_row)
        .optional()?;
    Ok(item)
}

/// Items needing allocation: created at or before `snapshot` and not yet seen
/// by the watermark run (newer timestamp, or a higher id than it had seen),
/// plus items whose latest allocation expired. De-duplicated and ordered by
/// creation id.
pub fn pending_pool(
    conn: &Connection,
    watermark: Option<PoolWatermark>,
    snapshot: DateTime<Utc>,
) -> Result<Vec<Item>, AllocatorError> {
    let seen_at = watermark.map(|w| format_timestamp(&w.at));
    let seen_id = watermark.and_then(|w| w.item_id);

    let mut stmt = conn.prepare(
        r#"
        SELECT i.* FROM items i
        WHERE i.created_at <= ?3
          AND (?1 IS NULL OR i.created_at > ?1 OR (?4 IS NOT NULL AND i.id > ?4))
        UNION
        SELECT i.* FROM items i
        WHERE (
            SELECT a.status FROM allocations a
            WHERE a.item_id = i.id
            ORDER BY a.id DESC
            LIMIT 1
        ) = ?2
        ORDER BY id ASC
        "#,
    )?;

    let items = stmt
        .query_map(
            params![seen_at, AllocationStatus::Expired, format_timestamp(&snapshot), seen_id],
            Item::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    debug!(count = items.len(), "Loaded allocation pool");
    Ok(items)
}

/// Highest item id created at or before `snapshot`
pub fn newest_item_id(conn: &Connection, snapshot: DateTime<Utc>) -> Result<Option<i64>, AllocatorError> {
    let id = conn.query_row(
        "SELECT MAX(id) FROM items WHERE created_at <= ?",
        params![format_timestamp(&snapshot)],
        |row| row.get(0),
    )?;
    Ok(id)
}
