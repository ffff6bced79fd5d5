//! User and log row access
//!
//! Reads are public through the repositories. Row writes are crate-private:
//! every mutation of a synchronized table goes through the change recorder or
//! the conflict resolver so that versions and the change queue stay in step.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::SyncTable;
use crate::error::{Error, Result};
use crate::models::{AccessLog, User};
use crate::partition::IdPartitioner;

const USER_COLUMNS: &str = "id, rfid_tag, name, nic, user_type, status, last_gate_id, \
     last_booth_id, is_active, version, last_sync_at, node_id, created_at, updated_at, \
     updated_by, is_deleted";

const LOG_COLUMNS: &str = "id, user_id, event_type, gate_id, booth_id, device_id, created_at, \
     result, message, node_id, synced, sync_timestamp";

/// Read access to replicated users
pub struct UserRepository<'a> {
    conn: &'a Connection,
}

impl<'a> UserRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get a user by ID, including soft-deleted rows
    pub fn get(&self, id: i64) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                parse_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Find a user by RFID credential, including soft-deleted rows
    pub fn find_by_tag(&self, rfid_tag: &str) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE rfid_tag = ?1"),
                params![rfid_tag],
                parse_user,
            )
            .optional()?;
        Ok(user)
    }

    /// List live users, newest first
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<User>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE is_deleted = 0
             ORDER BY created_at DESC, id DESC
             LIMIT ?1 OFFSET ?2"
        ))?;

        let users = stmt
            .query_map(params![limit as i64, offset as i64], parse_user)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(users)
    }
}

/// Read access to replicated event logs
pub struct LogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LogRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: i64) -> Result<Option<AccessLog>> {
        let log = self
            .conn
            .query_row(
                &format!("SELECT {LOG_COLUMNS} FROM logs WHERE id = ?1"),
                params![id],
                parse_log,
            )
            .optional()?;
        Ok(log)
    }

    /// List logs, newest first
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<AccessLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM logs
             ORDER BY created_at DESC, id DESC
             LIMIT ?1 OFFSET ?2"
        ))?;

        let logs = stmt
            .query_map(params![limit as i64, offset as i64], parse_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(logs)
    }

    /// List the events of one user, newest first
    pub fn list_for_user(&self, user_id: i64, limit: usize) -> Result<Vec<AccessLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM logs
             WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2"
        ))?;

        let logs = stmt
            .query_map(params![user_id, limit as i64], parse_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(logs)
    }

    pub fn count_unsynced(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM logs WHERE synced = 0", [], |row| {
                row.get(0)
            })?)
    }
}

/// Highest key this node has allocated in `table`, if any.
pub(crate) fn max_owned_id(
    conn: &Connection,
    table: SyncTable,
    partitioner: &IdPartitioner,
) -> Result<Option<i64>> {
    let sql = match table {
        SyncTable::Users => "SELECT MAX(id) FROM users WHERE id % ?1 = ?2",
        SyncTable::Logs => "SELECT MAX(id) FROM logs WHERE id % ?1 = ?2",
    };
    let max = conn.query_row(
        sql,
        params![partitioner.node_count(), partitioner.residue()],
        |row| row.get::<_, Option<i64>>(0),
    )?;
    Ok(max)
}

pub(crate) fn insert_user_row(conn: &Connection, user: &User) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO users ({USER_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            user.id,
            user.rfid_tag,
            user.name,
            user.nic,
            user.user_type,
            user.status,
            user.last_gate_id,
            user.last_booth_id,
            user.is_active,
            user.version,
            user.last_sync_at,
            user.node_id,
            user.created_at,
            user.updated_at,
            user.updated_by,
            user.is_deleted,
        ],
    )?;
    Ok(())
}

/// Write `user` over the stored row if the stored version is still
/// `expected_version` (compare-and-set).
pub(crate) fn update_user_row(conn: &Connection, user: &User, expected_version: i64) -> Result<()> {
    let rows = conn.execute(
        "UPDATE users SET
            rfid_tag = ?1, name = ?2, nic = ?3, user_type = ?4, status = ?5,
            last_gate_id = ?6, last_booth_id = ?7, is_active = ?8, version = ?9,
            last_sync_at = ?10, updated_at = ?11, updated_by = ?12, is_deleted = ?13
         WHERE id = ?14 AND version = ?15",
        params![
            user.rfid_tag,
            user.name,
            user.nic,
            user.user_type,
            user.status,
            user.last_gate_id,
            user.last_booth_id,
            user.is_active,
            user.version,
            user.last_sync_at,
            user.updated_at,
            user.updated_by,
            user.is_deleted,
            user.id,
            expected_version,
        ],
    )?;

    if rows == 0 {
        return Err(Error::VersionConflict {
            table: "users",
            id: user.id,
            expected: expected_version,
        });
    }
    Ok(())
}

pub(crate) fn insert_log_row(conn: &Connection, log: &AccessLog) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO logs ({LOG_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            log.id,
            log.user_id,
            log.event_type,
            log.gate_id,
            log.booth_id,
            log.device_id,
            log.created_at,
            log.result,
            log.message,
            log.node_id,
            log.synced,
            log.sync_timestamp,
        ],
    )?;
    Ok(())
}

fn parse_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        rfid_tag: row.get(1)?,
        name: row.get(2)?,
        nic: row.get(3)?,
        user_type: row.get(4)?,
        status: row.get(5)?,
        last_gate_id: row.get(6)?,
        last_booth_id: row.get(7)?,
        is_active: row.get(8)?,
        version: row.get(9)?,
        last_sync_at: row.get(10)?,
        node_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        updated_by: row.get(14)?,
        is_deleted: row.get(15)?,
    })
}

fn parse_log(row: &Row<'_>) -> rusqlite::Result<AccessLog> {
    Ok(AccessLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        event_type: row.get(2)?,
        gate_id: row.get(3)?,
        booth_id: row.get(4)?,
        device_id: row.get(5)?,
        created_at: row.get(6)?,
        result: row.get(7)?,
        message: row.get(8)?,
        node_id: row.get(9)?,
        synced: row.get(10)?,
        sync_timestamp: row.get(11)?,
    })
}
