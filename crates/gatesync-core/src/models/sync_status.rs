//! Per-peer, per-table sync progress

use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::{label_from_sql, ParseEnumError};
use crate::config::SyncTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Failed,
    InProgress,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::InProgress => "IN_PROGRESS",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "IN_PROGRESS" => Ok(Self::InProgress),
            _ => Err(ParseEnumError::new("sync status", s)),
        }
    }
}

impl ToSql for SyncStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for SyncStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        label_from_sql(value)
    }
}

/// Result of one sync attempt, as recorded in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    Failed(String),
}

/// One row per (peer, table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Peer ordinal
    pub node_id: u32,
    pub table: SyncTable,
    /// Last successful cycle (Unix ms)
    pub last_sync_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub status: SyncStatus,
    /// Only populated while `status` is `FAILED`
    pub error_message: Option<String>,
    /// Highest peer change id applied here
    pub pull_cursor: i64,
    /// Last inbound push from the peer (Unix ms)
    pub last_received_at: Option<i64>,
}

impl SyncMetadata {
    pub fn minutes_since_sync(&self, now_ms: i64) -> Option<i64> {
        self.last_sync_at
            .map(|last| now_ms.saturating_sub(last).max(0) / 60_000)
    }
}

/// Monitoring view of a metadata row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusRow {
    #[serde(flatten)]
    pub metadata: SyncMetadata,
    pub minutes_since_sync: Option<i64>,
}

impl SyncStatusRow {
    pub fn new(metadata: SyncMetadata, now_ms: i64) -> Self {
        let minutes_since_sync = metadata.minutes_since_sync(now_ms);
        Self {
            metadata,
            minutes_since_sync,
        }
    }
}
