//! Data models for gatesync

mod access_log;
mod change;
mod gate;
mod sync_conflict;
mod sync_status;
mod user;

pub use access_log::{AccessLog, AccessResult, EventType, NewAccessLog};
pub use change::{ChangeEntry, ChangeEnvelope, ChangeOperation};
pub use gate::GateKind;
pub use sync_conflict::{ConflictKind, ConflictWinner, SyncConflict};
pub use sync_status::{SyncMetadata, SyncOutcome, SyncStatus, SyncStatusRow};
pub use user::{NewUser, User, UserPatch, UserStatus, UserType, WriteStamp};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use thiserror::Error;

use crate::config::SyncTable;

/// A stored or received enum label that is not one of the known values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Read a TEXT column into any of the label enums.
pub(crate) fn label_from_sql<T>(value: ValueRef<'_>) -> FromSqlResult<T>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    value
        .as_str()?
        .parse::<T>()
        .map_err(|error| FromSqlError::Other(Box::new(error)))
}

impl ToSql for SyncTable {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for SyncTable {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse::<Self>()
            .map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}
