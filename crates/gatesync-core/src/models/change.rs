//! Change-queue entries and their wire form

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::{label_from_sql, ParseEnumError};
use crate::config::SyncTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(ParseEnumError::new("change operation", s)),
        }
    }
}

impl ToSql for ChangeOperation {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ChangeOperation {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        label_from_sql(value)
    }
}

/// A local mutation waiting to reach every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Local sequence; peers use it as their pull cursor
    pub id: i64,
    pub table: SyncTable,
    pub record_id: i64,
    pub operation: ChangeOperation,
    /// Record version before the mutation (`None` for inserts)
    pub base_version: Option<i64>,
    /// Full row snapshot after the mutation
    pub payload: serde_json::Value,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Acknowledged by every configured peer
    pub synced: bool,
}

impl ChangeEntry {
    pub fn to_envelope(&self, origin_node: u32) -> ChangeEnvelope {
        ChangeEnvelope {
            change_id: self.id,
            origin_node,
            table: self.table,
            record_id: self.record_id,
            operation: self.operation,
            base_version: self.base_version,
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}

/// A change as shipped between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub change_id: i64,
    pub origin_node: u32,
    pub table: SyncTable,
    pub record_id: i64,
    pub operation: ChangeOperation,
    #[serde(default)]
    pub base_version: Option<i64>,
    pub payload: serde_json::Value,
    pub created_at: i64,
}
