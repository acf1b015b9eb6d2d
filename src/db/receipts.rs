//! Append-only pickup receipts

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::models::{format_timestamp, AccessorInfo, PickupReceipt};
use crate::error::AllocatorError;

pub fn insert_receipt(
    conn: &Connection,
    allocation_id: i64,
    accessor: &AccessorInfo,
    now: DateTime<Utc>,
) -> Result<PickupReceipt, AllocatorError> {
    conn.execute(
        "INSERT INTO pickup_receipts (allocation_id, remote_addr, client_id, recorded_at) VALUES (?, ?, ?, ?)",
        params![allocation_id, accessor.remote_addr, accessor.client_id, format_timestamp(&now)],
    )?;

    let id = conn.last_insert_rowid();
    let receipt = conn.query_row(
        "SELECT * FROM pickup_receipts WHERE id = ?",
        params![id],
        PickupReceipt::from_row,
    )?;
    Ok(receipt)
}

pub fn receipts_for_allocation(conn: &Connection, allocation_id: i64) -> Result<Vec<PickupReceipt>, AllocatorError> {
    let mut stmt = conn.prepare("SELECT * FROM pickup_receipts WHERE allocation_id = ? ORDER BY id ASC")?;
    let receipts = stmt
        .query_map(params![allocation_id], PickupReceipt::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(receipts)
}
