//! Row models shared by the repository modules

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{Row, ToSql};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Timestamps
// ============================================================================

/// Fixed-width UTC timestamp, so text comparison in SQL is chronological
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}

fn ts_column(row: &Row, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(name)?;
    parse_timestamp(&raw).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn opt_ts_column(row: &Row, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(name)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw).map(Some).map_err(|e| {
            let idx = row.as_ref().column_index(name).unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        }),
    }
}

// ============================================================================
// Enums
// ============================================================================

#[derive(Error, Debug)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Allocation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Queued,
    Notified,
    PickedUp,
    Expired,
    Rejected,
}

impl AllocationStatus {
    pub const ALL: [AllocationStatus; 5] = [
        AllocationStatus::Queued,
        AllocationStatus::Notified,
        AllocationStatus::PickedUp,
        AllocationStatus::Expired,
        AllocationStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Queued => "queued",
            AllocationStatus::Notified => "notified",
            AllocationStatus::PickedUp => "picked_up",
            AllocationStatus::Expired => "expired",
            AllocationStatus::Rejected => "rejected",
        }
    }

    /// Statuses from which the item can never be picked up again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocationStatus::PickedUp | AllocationStatus::Expired | AllocationStatus::Rejected
        )
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "allocation status",
                value: s.to_string(),
            })
    }
}

impl ToSql for AllocationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AllocationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Which engine a run belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Distribution,
    Expiry,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Distribution => "distribution",
            RunKind::Expiry => "expiry",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "distribution" => Ok(RunKind::Distribution),
            "expiry" => Ok(RunKind::Expiry),
            other => Err(ParseEnumError {
                kind: "run kind",
                value: other.to_string(),
            }),
        }
    }
}

impl ToSql for RunKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Ingested media item; immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub content_hash: String,
    pub size_bytes: i64,
    /// Where the packaging collaborator finds the bytes
    pub locator: String,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            content_hash: row.get("content_hash")?,
            size_bytes: row.get("size_bytes")?,
            locator: row.get("locator")?,
            created_at: ts_column(row, "created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    /// Ring slots per revolution
    pub weight: u32,
    /// Allocations this recipient may take per distribution run
    pub weekly_quota: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Recipient {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            email: row.get("email")?,
            weight: row.get("weight")?,
            weekly_quota: row.get("weekly_quota")?,
            active: row.get("active")?,
            created_at: ts_column(row, "created_at")?,
        })
    }
}

/// One item handed to one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: i64,
    pub item_id: i64,
    pub recipient_id: i64,
    pub run_id: Option<i64>,
    pub status: AllocationStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_notified_at: Option<DateTime<Utc>>,
    /// `sha256-<hex>` of the pickup secret; the secret itself is never stored
    pub download_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Allocation {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            item_id: row.get("item_id")?,
            recipient_id: row.get("recipient_id")?,
            run_id: row.get("run_id")?,
            status: row.get("status")?,
            expires_at: opt_ts_column(row, "expires_at")?,
            attempts: row.get("attempts")?,
            last_notified_at: opt_ts_column(row, "last_notified_at")?,
            download_token: row.get("download_token")?,
            created_at: ts_column(row, "created_at")?,
            updated_at: ts_column(row, "updated_at")?,
        })
    }

    /// Whether the pickup deadline has passed at `now`
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|deadline| now >= deadline).unwrap_or(true)
    }
}

/// Temporary bar on a (recipient, item) pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionEntry {
    pub recipient_id: i64,
    pub item_id: i64,
    pub until: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExclusionEntry {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            recipient_id: row.get("recipient_id")?,
            item_id: row.get("item_id")?,
            until: ts_column(row, "until")?,
            updated_at: ts_column(row, "updated_at")?,
        })
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until > now
    }
}

/// One engine execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub correlation_id: String,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Pool snapshot time; only set on distribution runs
    pub watermark: Option<DateTime<Utc>>,
    /// Highest item id the pool had seen at `watermark`
    pub watermark_item_id: Option<i64>,
    pub stats: Option<serde_json::Value>,
}

impl Run {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let stats_json: Option<String> = row.get("stats_json")?;
        let stats = match stats_json {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                let idx = row.as_ref().column_index("stats_json").unwrap_or(0);
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })?),
            None => None,
        };

        Ok(Self {
            id: row.get("id")?,
            correlation_id: row.get("correlation_id")?,
            kind: row.get("kind")?,
            started_at: ts_column(row, "started_at")?,
            finished_at: opt_ts_column(row, "finished_at")?,
            watermark: opt_ts_column(row, "watermark")?,
            watermark_item_id: row.get("watermark_item_id")?,
            stats,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Read an integer counter out of the stats summary
    pub fn stat(&self, key: &str) -> Option<u64> {
        self.stats.as_ref()?.get(key)?.as_u64()
    }
}

/// Who fetched an allocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessorInfo {
    pub remote_addr: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickupReceipt {
    pub id: i64,
    pub allocation_id: i64,
    pub remote_addr: Option<String>,
    pub client_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl PickupReceipt {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            allocation_id: row.get("allocation_id")?,
            remote_addr: row.get("remote_addr")?,
            client_id: row.get("client_id")?,
            recorded_at: ts_column(row, "recorded_at")?,
        })
    }
}
