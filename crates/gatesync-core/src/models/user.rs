//! User model

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use super::{label_from_sql, ParseEnumError};
use crate::error::{Error, Result};
use crate::util::normalize_text_option;

const MAX_RFID_TAG_LEN: usize = 100;

/// Access class of a credential holder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserType {
    #[default]
    Common,
    #[serde(rename = "VIP")]
    Vip,
    Backstage,
}

impl UserType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Common => "Common",
            Self::Vip => "VIP",
            Self::Backstage => "Backstage",
        }
    }
}

impl FromStr for UserType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "common" => Ok(Self::Common),
            "vip" => Ok(Self::Vip),
            "backstage" => Ok(Self::Backstage),
            _ => Err(ParseEnumError::new("user type", s)),
        }
    }
}

/// Presence status of a credential holder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    #[default]
    #[serde(rename = "IDLE")]
    Idle,
    In,
    Out,
    Expired,
    Banned,
}

impl UserStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::In => "In",
            Self::Out => "Out",
            Self::Expired => "Expired",
            Self::Banned => "Banned",
        }
    }
}

impl FromStr for UserStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "expired" => Ok(Self::Expired),
            "banned" => Ok(Self::Banned),
            _ => Err(ParseEnumError::new("user status", s)),
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for UserType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for UserType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        label_from_sql(value)
    }
}

impl ToSql for UserStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for UserStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        label_from_sql(value)
    }
}

/// Timestamp and ordinal of the write a row currently holds.
///
/// Ordering is the last-writer-wins order: a later timestamp is greater, and
/// for equal timestamps the lower ordinal is greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStamp {
    pub updated_at: i64,
    pub updated_by: u32,
}

impl Ord for WriteStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.updated_at
            .cmp(&other.updated_at)
            .then_with(|| other.updated_by.cmp(&self.updated_by))
    }
}

impl PartialOrd for WriteStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An authorized credential holder, replicated across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Partitioned primary key
    pub id: i64,
    /// RFID credential, unique across all nodes
    pub rfid_tag: String,
    pub name: Option<String>,
    /// National ID
    pub nic: Option<String>,
    pub user_type: UserType,
    pub status: UserStatus,
    pub last_gate_id: Option<i64>,
    pub last_booth_id: Option<i64>,
    pub is_active: bool,
    /// Mutation counter, bumped on every local or replicated write
    pub version: i64,
    /// Unix ms of the last write applied on this node
    pub last_sync_at: Option<i64>,
    /// Ordinal of the node that created the row (never changes)
    pub node_id: u32,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Timestamp of the write whose content the row holds (Unix ms)
    pub updated_at: i64,
    /// Ordinal of the node that made that write
    pub updated_by: u32,
    /// Soft delete flag for sync
    pub is_deleted: bool,
}

impl User {
    pub const fn stamp(&self) -> WriteStamp {
        WriteStamp {
            updated_at: self.updated_at,
            updated_by: self.updated_by,
        }
    }

    /// Replicated fields are equal (ignores `version` and `last_sync_at`,
    /// which are per-node bookkeeping).
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.rfid_tag == other.rfid_tag
            && self.name == other.name
            && self.nic == other.nic
            && self.user_type == other.user_type
            && self.status == other.status
            && self.last_gate_id == other.last_gate_id
            && self.last_booth_id == other.last_booth_id
            && self.is_active == other.is_active
            && self.node_id == other.node_id
            && self.created_at == other.created_at
            && self.is_deleted == other.is_deleted
            && self.stamp() == other.stamp()
    }

    /// Both rows describe the same person.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.name == other.name && self.nic == other.nic && self.user_type == other.user_type
    }

    /// Between two enrolments of one person, the earlier one survives:
    /// lowest `(created_at, node_id, id)` wins on every node.
    pub fn outranks_enrolment(&self, other: &Self) -> bool {
        (self.created_at, self.node_id, self.id) < (other.created_at, other.node_id, other.id)
    }

    /// Copy the replicated content of `winner` onto this row, keeping this
    /// row's bookkeeping.
    pub fn take_content(&mut self, winner: &Self) {
        self.rfid_tag.clone_from(&winner.rfid_tag);
        self.name.clone_from(&winner.name);
        self.nic.clone_from(&winner.nic);
        self.user_type = winner.user_type;
        self.status = winner.status;
        self.last_gate_id = winner.last_gate_id;
        self.last_booth_id = winner.last_booth_id;
        self.is_active = winner.is_active;
        self.is_deleted = winner.is_deleted;
        self.updated_at = winner.updated_at;
        self.updated_by = winner.updated_by;
    }

    /// Whether the credential may pass a gate at all.
    pub const fn can_scan(&self) -> bool {
        self.is_active
            && !self.is_deleted
            && !matches!(self.status, UserStatus::Banned | UserStatus::Expired)
    }
}

/// Input for creating a user on this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub rfid_tag: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nic: Option<String>,
    #[serde(default)]
    pub user_type: UserType,
}

impl NewUser {
    pub fn new(rfid_tag: impl Into<String>) -> Self {
        Self {
            rfid_tag: rfid_tag.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_nic(mut self, nic: impl Into<String>) -> Self {
        self.nic = Some(nic.into());
        self
    }

    #[must_use]
    pub const fn with_user_type(mut self, user_type: UserType) -> Self {
        self.user_type = user_type;
        self
    }

    /// Trim fields and check the credential.
    pub fn normalized(self) -> Result<Self> {
        let rfid_tag = self.rfid_tag.trim().to_string();
        if rfid_tag.is_empty() {
            return Err(Error::InvalidInput("RFID tag cannot be empty".to_string()));
        }
        if rfid_tag.chars().count() > MAX_RFID_TAG_LEN {
            return Err(Error::InvalidInput(format!(
                "RFID tag cannot exceed {MAX_RFID_TAG_LEN} characters"
            )));
        }
        Ok(Self {
            rfid_tag,
            name: normalize_text_option(self.name),
            nic: normalize_text_option(self.nic),
            user_type: self.user_type,
        })
    }
}

/// Partial update of a user; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPatch {
    pub name: Option<String>,
    pub nic: Option<String>,
    pub user_type: Option<UserType>,
    pub status: Option<UserStatus>,
    pub last_gate_id: Option<i64>,
    pub last_booth_id: Option<i64>,
    pub is_active: Option<bool>,
}

impl UserPatch {
    pub fn status(status: UserStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, user: &mut User) {
        if let Some(name) = &self.name {
            user.name = normalize_text_option(Some(name.clone()));
        }
        if let Some(nic) = &self.nic {
            user.nic = normalize_text_option(Some(nic.clone()));
        }
        if let Some(user_type) = self.user_type {
            user.user_type = user_type;
        }
        if let Some(status) = self.status {
            user.status = status;
        }
        if let Some(gate_id) = self.last_gate_id {
            user.last_gate_id = Some(gate_id);
        }
        if let Some(booth_id) = self.last_booth_id {
            user.last_booth_id = Some(booth_id);
        }
        if let Some(is_active) = self.is_active {
            user.is_active = is_active;
        }
    }
}
