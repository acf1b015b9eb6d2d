//! Recipient rows (managed by the admin collaborator)

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

use super::models::{format_timestamp, Recipient};
use crate::error::AllocatorError;

#[derive(Debug, Clone, Deserialize)]
pub struct NewRecipient {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Ring slots per revolution, 1..=MAX_RECIPIENT_WEIGHT
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub weekly_quota: u32,
}

/// Upper bound on weight; the ring materializes one slot per unit
pub const MAX_RECIPIENT_WEIGHT: u32 = 1000;

fn default_weight() -> u32 {
    1
}

impl NewRecipient {
    pub fn new(name: impl Into<String>, weight: u32, weekly_quota: u32) -> Self {
        Self {
            name: name.into(),
            email: None,
            weight,
            weekly_quota,
        }
    }
}

pub fn insert_recipient(conn: &Connection, input: &NewRecipient) -> Result<Recipient, AllocatorError> {
    if input.weight == 0 || input.weight > MAX_RECIPIENT_WEIGHT {
        return Err(AllocatorError::InvalidInput(format!(
            "Recipient weight must be between 1 and {}, got: {}",
            MAX_RECIPIENT_WEIGHT, input.weight
        )));
    }

    conn.execute(
        "INSERT INTO recipients (name, email, weight, weekly_quota, created_at) VALUES (?, ?, ?, ?, ?)",
        params![
            input.name,
            input.email,
            input.weight,
            input.weekly_quota,
            format_timestamp(&Utc::now()),
        ],
    )?;

    let id = conn.last_insert_rowid();
    get_recipient(conn, id)?
        .ok_or_else(|| AllocatorError::Internal("Recipient not found after insert".to_string()))
}

pub fn get_recipient(conn: &Connection, id: i64) -> Result<Option<Recipient>, AllocatorError> {
    let recipient = conn
        .query_row("SELECT * FROM recipients WHERE id = ?", params![id], Recipient::from_row)
        .optional()?;
    Ok(recipient)
}

/// Active recipients in id order; this order defines the ring layout
pub fn list_active_recipients(conn: &Connection) -> Result<Vec<Recipient>, AllocatorError> {
    let mut stmt = conn.prepare("SELECT * FROM recipients WHERE active = 1 ORDER BY id ASC")?;
    let recipients = stmt
        .query_map([], Recipient::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(recipients)
}

pub fn set_active(conn: &Connection, id: i64, active: bool) -> Result<(), AllocatorError> {
    let changed = conn.execute(
        "UPDATE recipients SET active = ? WHERE id = ?",
        params![active, id],
    )?;

    if changed == 0 {
        return Err(AllocatorError::NotFound(format!("recipient {}", id)));
    }
    Ok(())
}
