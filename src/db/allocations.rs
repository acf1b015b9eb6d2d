//! Allocation rows and their guarded status transitions
//!
//! Every status change is a compare-and-swap on the expected prior status:
//! the UPDATE only matches while the row is still in that status, and the
//! caller learns from the affected-row count whether it won.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use tracing::debug;

use super::models::{format_timestamp, Allocation, AllocationStatus};
use crate::error::AllocatorError;

/// Filters for listing allocations (admin display)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllocationQuery {
    pub run_id: Option<i64>,
    pub recipient_id: Option<i64>,
    pub item_id: Option<i64>,
    #[serde(default)]
    pub statuses: Vec<AllocationStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Create a queued allocation. Fails with `Constraint` if the pair already exists.
pub fn insert_allocation(
    conn: &Connection,
    item_id: i64,
    recipient_id: i64,
    run_id: i64,
    now: DateTime<Utc>,
) -> Result<Allocation, AllocatorError> {
    let ts = format_timestamp(&now);
    conn.execute(
        r#"
        INSERT INTO allocations (item_id, recipient_id, run_id, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![item_id, recipient_id, run_id, AllocationStatus::Queued, ts, ts],
    )?;

    let id = conn.last_insert_rowid();
    debug!(allocation_id = id, item_id, recipient_id, run_id, "Queued allocation");

    get_allocation(conn, id)?
        .ok_or_else(|| AllocatorError::Internal("Allocation not found after insert".to_string()))
}

pub fn get_allocation(conn: &Connection, id: i64) -> Result<Option<Allocation>, AllocatorError> {
    let allocation = conn
        .query_row("SELECT * FROM allocations WHERE id = ?", params![id], Allocation::from_row)
        .optional()?;
    Ok(allocation)
}

pub fn find_allocation(
    conn: &Connection,
    item_id: i64,
    recipient_id: i64,
) -> Result<Option<Allocation>, AllocatorError> {
    let allocation = conn
        .query_row(
            "SELECT * FROM allocations WHERE item_id = ? AND recipient_id = ?",
            params![item_id, recipient_id],
            Allocation::from_row,
        )
        .optional()?;
    Ok(allocation)
}

/// Recipients that already hold an allocation for `item_id`, in any status
pub fn recipients_holding_item(conn: &Connection, item_id: i64) -> Result<HashSet<i64>, AllocatorError> {
    let mut stmt = conn.prepare("SELECT recipient_id FROM allocations WHERE item_id = ?")?;
    let holders = stmt
        .query_map(params![item_id], |row| row.get(0))?
        .collect::<Result<HashSet<i64>, _>>()?;
    Ok(holders)
}

pub fn list_allocations(conn: &Connection, query: &AllocationQuery) -> Result<Vec<Allocation>, AllocatorError> {
    let mut sql = String::from("SELECT * FROM allocations");
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(run_id) = query.run_id {
        conditions.push("run_id = ?".to_string());
        values.push(Box::new(run_id));
    }

    if let Some(recipient_id) = query.recipient_id {
        conditions.push("recipient_id = ?".to_string());
        values.push(Box::new(recipient_id));
    }

    if let Some(item_id) = query.item_id {
        conditions.push("item_id = ?".to_string());
        values.push(Box::new(item_id));
    }

    if !query.statuses.is_empty() {
        let placeholders: Vec<_> = query.statuses.iter().map(|_| "?").collect();
        conditions.push(format!("status IN ({})", placeholders.join(", ")));
        for status in &query.statuses {
            values.push(Box::new(*status));
        }
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    sql.push_str(" ORDER BY id ASC LIMIT ? OFFSET ?");
    values.push(Box::new(query.limit.map(i64::from).unwrap_or(-1)));
    values.push(Box::new(query.offset.unwrap_or(0)));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();

    let allocations = stmt
        .query_map(param_refs.as_slice(), Allocation::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(allocations)
}

/// Queued allocations grouped by recipient, for the notification collaborator
pub fn queued_by_recipient(conn: &Connection) -> Result<BTreeMap<i64, Vec<Allocation>>, AllocatorError> {
    let queued = list_allocations(conn, &AllocationQuery {
        statuses: vec![AllocationStatus::Queued],
        ..Default::default()
    })?;

    let mut grouped: BTreeMap<i64, Vec<Allocation>> = BTreeMap::new();
    for allocation in queued {
        grouped.entry(allocation.recipient_id).or_default().push(allocation);
    }
    Ok(grouped)
}

/// Notified allocations whose deadline passed, one keyset page at a time
pub fn overdue_page(
    conn: &Connection,
    now: DateTime<Utc>,
    after_id: i64,
    limit: usize,
) -> Result<Vec<Allocation>, AllocatorError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM allocations
        WHERE status = ? AND expires_at IS NOT NULL AND expires_at < ? AND id > ?
        ORDER BY id ASC
        LIMIT ?
        "#,
    )?;

    let page = stmt
        .query_map(
            params![AllocationStatus::Notified, format_timestamp(&now), after_id, limit as i64],
            Allocation::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(page)
}

/// Store a freshly minted token hash and deadline.
///
/// Moves `queued` to `notified` (stamping `last_notified_at`); a `notified`
/// row keeps its status. Returns false if the row left `expected` meanwhile.
pub fn record_mint(
    conn: &Connection,
    id: i64,
    expected: AllocationStatus,
    token_hash: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, AllocatorError> {
    let changed = conn.execute(
        r#"
        UPDATE allocations SET
            download_token = ?1,
            expires_at = ?2,
            last_notified_at = CASE WHEN status = ?3 THEN ?4 ELSE last_notified_at END,
            status = ?5,
            attempts = attempts + 1,
            updated_at = ?4
        WHERE id = ?6 AND status = ?7
        "#,
        params![
            token_hash,
            format_timestamp(&expires_at),
            AllocationStatus::Queued,
            format_timestamp(&now),
            AllocationStatus::Notified,
            id,
            expected,
        ],
    )?;
    Ok(changed == 1)
}

/// Compare-and-swap the status. Returns false when the row was not in `from`.
pub fn transition(
    conn: &Connection,
    id: i64,
    from: AllocationStatus,
    to: AllocationStatus,
    now: DateTime<Utc>,
) -> Result<bool, AllocatorError> {
    let changed = conn.execute(
        "UPDATE allocations SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        params![to, format_timestamp(&now), id, from],
    )?;

    if changed == 1 {
        debug!(allocation_id = id, from = %from, to = %to, "Allocation transitioned");
    }
    Ok(changed == 1)
}

/// picked_up -> queued, clearing everything a previous notification set
pub fn return_to_pool(conn: &Connection, id: i64, now: DateTime<Utc>) -> Result<bool, AllocatorError> {
    let changed = conn.execute(
        r#"
        UPDATE allocations SET
            status = ?, download_token = NULL, expires_at = NULL,
            last_notified_at = NULL, updated_at = ?
        WHERE id = ? AND status = ?
        "#,
        params![
            AllocationStatus::Queued,
            format_timestamp(&now),
            id,
            AllocationStatus::PickedUp,
        ],
    )?;
    Ok(changed == 1)
}

pub fn count_by_status(conn: &Connection) -> Result<HashMap<String, u64>, AllocatorError> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM allocations GROUP BY status")?;
    let counts = stmt
        .query_map([], |row| {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((status, count as u64))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(counts)
}
