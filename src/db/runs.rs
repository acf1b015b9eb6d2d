//! Run records: one row per engine execution

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use super::models::{format_timestamp, parse_timestamp, Run, RunKind};
use crate::error::AllocatorError;

/// Where the previous distribution run stopped reading new items.
///
/// `at` bounds the pool by `created_at`; `item_id` catches rows that commit
/// later with a `created_at` at or before `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolWatermark {
    pub at: DateTime<Utc>,
    pub item_id: Option<i64>,
}

/// Open a run. The row stays unfinished until [`finalize_run`] is called.
pub fn create_run(conn: &Connection, kind: RunKind, started_at: DateTime<Utc>) -> Result<Run, AllocatorError> {
    let correlation_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO runs (correlation_id, kind, started_at) VALUES (?, ?, ?)",
        params![correlation_id, kind, format_timestamp(&started_at)],
    )?;

    let id = conn.last_insert_rowid();
    debug!(run_id = id, kind = %kind, "Opened run");

    get_run(conn, id)?
        .ok_or_else(|| AllocatorError::Internal("Run not found after insert".to_string()))
}

pub fn finalize_run(
    conn: &Connection,
    run_id: i64,
    finished_at: DateTime<Utc>,
    stats: &serde_json::Value,
    watermark: Option<PoolWatermark>,
) -> Result<Run, AllocatorError> {
    let changed = conn.execute(
        r#"
        UPDATE runs SET finished_at = ?, stats_json = ?, watermark = ?, watermark_item_id = ?
        WHERE id = ? AND finished_at IS NULL
        "#,
        params![
            format_timestamp(&finished_at),
            serde_json::to_string(stats)?,
            watermark.map(|w| format_timestamp(&w.at)),
            watermark.and_then(|w| w.item_id),
            run_id,
        ],
    )?;

    if changed == 0 {
        return Err(AllocatorError::InvalidInput(format!(
            "Run {} does not exist or is already finalized",
            run_id
        )));
    }

    get_run(conn, run_id)?
        .ok_or_else(|| AllocatorError::NotFound(format!("run {}", run_id)))
}

pub fn get_run(conn: &Connection, id: i64) -> Result<Option<Run>, AllocatorError> {
    let run = conn
        .query_row("SELECT * FROM runs WHERE id = ?", params![id], Run::from_row)
        .optional()?;
    Ok(run)
}

pub fn last_completed_run(conn: &Connection, kind: RunKind) -> Result<Option<Run>, AllocatorError> {
    let run = conn
        .query_row(
            r#"
            SELECT * FROM runs
            WHERE kind = ? AND finished_at IS NOT NULL
            ORDER BY finished_at DESC, id DESC
            LIMIT 1
            "#,
            params![kind],
            Run::from_row,
        )
        .optional()?;
    Ok(run)
}

/// Stored pool watermark of the latest finished distribution run
pub fn distribution_watermark(conn: &Connection) -> Result<Option<PoolWatermark>, AllocatorError> {
    let raw: Option<(String, Option<i64>)> = conn
        .query_row(
            r#"
            SELECT watermark, watermark_item_id FROM runs
            WHERE kind = ? AND finished_at IS NOT NULL AND watermark IS NOT NULL
            ORDER BY watermark DESC, id DESC
            LIMIT 1
            "#,
            params![RunKind::Distribution],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match raw {
        Some((raw, item_id)) => parse_timestamp(&raw)
            .map(|at| Some(PoolWatermark { at, item_id }))
            .map_err(|e| AllocatorError::Database(format!("Bad watermark {:?}: {}", raw, e))),
        None => Ok(None),
    }
}

/// Most recent runs first
pub fn list_runs(conn: &Connection, kind: Option<RunKind>, limit: u32) -> Result<Vec<Run>, AllocatorError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM runs WHERE (?1 IS NULL OR kind = ?1) ORDER BY id DESC LIMIT ?2",
    )?;
    let runs = stmt
        .query_map(params![kind, limit], Run::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(runs)
}
