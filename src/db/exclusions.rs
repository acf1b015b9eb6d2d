//! Exclusion ledger: temporary (recipient, item) bars

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::{format_timestamp, ExclusionEntry};
use crate::error::AllocatorError;

/// Insert or overwrite the bar for a pair. The new `until` replaces the old
/// one; cooldowns never stack.
pub fn upsert_exclusion(
    conn: &Connection,
    recipient_id: i64,
    item_id: i64,
    until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), AllocatorError> {
    conn.execute(
        r#"
        INSERT INTO exclusions (recipient_id, item_id, until, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (recipient_id, item_id)
        DO UPDATE SET until = excluded.until, updated_at = excluded.updated_at
        "#,
        params![recipient_id, item_id, format_timestamp(&until), format_timestamp(&now)],
    )?;
    Ok(())
}

/// Recipients barred from `item_id` at `now`
pub fn active_for_item(
    conn: &Connection,
    item_id: i64,
    now: DateTime<Utc>,
) -> Result<HashSet<i64>, AllocatorError> {
    let mut stmt = conn.prepare("SELECT recipient_id FROM exclusions WHERE item_id = ? AND until > ?")?;
    let excluded = stmt
        .query_map(params![item_id, format_timestamp(&now)], |row| row.get(0))?
        .collect::<Result<HashSet<i64>, _>>()?;
    Ok(excluded)
}

pub fn get_exclusion(
    conn: &Connection,
    recipient_id: i64,
    item_id: i64,
) -> Result<Option<ExclusionEntry>, AllocatorError> {
    let entry = conn
        .query_row(
            "SELECT * FROM exclusions WHERE recipient_id = ? AND item_id = ?",
            params![recipient_id, item_id],
            ExclusionEntry::from_row,
        )
        .optional()?;
    Ok(entry)
}

/// All entries, or only those still active at `active_at`
pub fn list_exclusions(
    conn: &Connection,
    active_at: Option<DateTime<Utc>>,
) -> Result<Vec<ExclusionEntry>, AllocatorError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM exclusions
        WHERE ?1 IS NULL OR until > ?1
        ORDER BY recipient_id ASC, item_id ASC
        "#,
    )?;
    let entries = stmt
        .query_map(params![active_at.map(|ts| format_timestamp(&ts))], ExclusionEntry::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{items, recipients, AllocatorDb, NewItem, NewRecipient};
    use chrono::Duration;

    #[test]
    fn test_upsert_overwrites_instead_of_stacking() {
        let db = AllocatorDb::open_in_memory().unwrap();
        let now = Utc::now();

        db.with_conn(|conn| {
            let item = items::insert_item(conn, &NewItem::new("sha256-0a", 1, "blobs/0a"))?;
            let recipient = recipients::insert_recipient(conn, &NewRecipient::new("ben", 1, 1))?;

            upsert_exclusion(conn, recipient.id, item.id, now + Duration::days(14), now)?;
            upsert_exclusion(conn, recipient.id, item.id, now + Duration::days(2), now)?;

            let entries = list_exclusions(conn, None)?;
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].until.timestamp(), (now + Duration::days(2)).timestamp());

            assert!(active_for_item(conn, item.id, now)?.contains(&recipient.id));
            assert!(active_for_item(conn, item.id, now + Duration::days(3))?.is_empty());
            assert!(list_exclusions(conn, Some(now + Duration::days(3)))?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
