//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::{label_from_sql, ParseEnumError};
use crate::config::SyncTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Incoming insert collides with an existing unique key
    InsertDuplicate,
    /// Incoming update does not descend from the local version
    UpdateConflict,
}

impl ConflictKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InsertDuplicate => "INSERT_DUPLICATE",
            Self::UpdateConflict => "UPDATE_CONFLICT",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT_DUPLICATE" => Ok(Self::InsertDuplicate),
            "UPDATE_CONFLICT" => Ok(Self::UpdateConflict),
            _ => Err(ParseEnumError::new("conflict kind", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
}

impl ConflictWinner {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl FromStr for ConflictWinner {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            _ => Err(ParseEnumError::new("conflict winner", s)),
        }
    }
}

impl ToSql for ConflictKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ConflictKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        label_from_sql(value)
    }
}

impl ToSql for ConflictWinner {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ConflictWinner {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        label_from_sql(value)
    }
}

/// Recorded collision between a local row and an incoming change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub table: SyncTable,
    /// Record the incoming change targeted
    pub record_id: i64,
    pub kind: ConflictKind,
    /// Node that originated the incoming change
    pub origin_node: u32,
    /// Incoming change as received
    pub payload: serde_json::Value,
    /// Local row at detection time
    pub local_payload: Option<serde_json::Value>,
    /// Side whose content was kept, when decided automatically
    pub winner: Option<ConflictWinner>,
    pub resolved: bool,
    /// Detection timestamp (unix ms)
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}
