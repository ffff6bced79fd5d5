//! Entry/exit event log model

use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::{label_from_sql, ParseEnumError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Entry,
    Exit,
    Denied,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Exit => "EXIT",
            Self::Denied => "DENIED",
        }
    }
}

impl FromStr for EventType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENTRY" => Ok(Self::Entry),
            "EXIT" => Ok(Self::Exit),
            "DENIED" => Ok(Self::Denied),
            _ => Err(ParseEnumError::new("event type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessResult {
    Pass,
    Fail,
}

impl AccessResult {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

impl FromStr for AccessResult {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            _ => Err(ParseEnumError::new("access result", s)),
        }
    }
}

impl ToSql for EventType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for EventType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        label_from_sql(value)
    }
}

impl ToSql for AccessResult {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for AccessResult {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        label_from_sql(value)
    }
}

/// One scan event. Append-only: only `synced`/`sync_timestamp` ever change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
    pub id: i64,
    /// `None` for scans of unknown credentials
    pub user_id: Option<i64>,
    pub event_type: EventType,
    pub gate_id: i64,
    pub booth_id: i64,
    pub device_id: Option<i64>,
    /// Event timestamp (Unix ms)
    pub created_at: i64,
    pub result: AccessResult,
    pub message: Option<String>,
    /// Ordinal of the node that recorded the event
    pub node_id: u32,
    /// Every peer has the row
    pub synced: bool,
    pub sync_timestamp: Option<i64>,
}

impl AccessLog {
    /// Event fields are equal (ignores the local sync stamp).
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.user_id == other.user_id
            && self.event_type == other.event_type
            && self.gate_id == other.gate_id
            && self.booth_id == other.booth_id
            && self.device_id == other.device_id
            && self.created_at == other.created_at
            && self.result == other.result
            && self.message == other.message
            && self.node_id == other.node_id
    }
}

/// Input for appending an event on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccessLog {
    #[serde(default)]
    pub user_id: Option<i64>,
    pub event_type: EventType,
    pub gate_id: i64,
    pub booth_id: i64,
    #[serde(default)]
    pub device_id: Option<i64>,
    pub result: AccessResult,
    #[serde(default)]
    pub message: Option<String>,
}

impl NewAccessLog {
    pub const fn new(event_type: EventType, result: AccessResult, gate_id: i64, booth_id: i64) -> Self {
        Self {
            user_id: None,
            event_type,
            gate_id,
            booth_id,
            device_id: None,
            result,
            message: None,
        }
    }

    #[must_use]
    pub const fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub const fn with_device(mut self, device_id: i64) -> Self {
        self.device_id = Some(device_id);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
