//! The only write path for synchronized tables.
//!
//! Every mutation runs in one transaction that allocates the key (inserts),
//! writes the row with a compare-and-set version bump (updates), and appends
//! the change-queue entry carrying the full row snapshot.

use std::io;
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::queue::enqueue;
use crate::config::{NodeConfig, SyncTable};
use crate::db::{
    insert_log_row, insert_user_row, max_owned_id, update_user_row, Database, LogRepository,
    UserRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    AccessLog, ChangeOperation, NewAccessLog, NewUser, User, UserPatch, UserStatus, UserType,
};
use crate::partition::IdPartitioner;
use crate::util::{normalize_text_option, now_ms};

/// Row counts from a bulk enrolment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub inserted: usize,
    /// Tag already held by another user
    pub duplicates: usize,
    pub invalid: usize,
}

#[derive(Deserialize)]
struct ImportRow {
    #[serde(default)]
    rfid_tag: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    nic: Option<String>,
    #[serde(default)]
    user_type: Option<String>,
}

impl ImportRow {
    fn into_new_user(self) -> Result<NewUser> {
        let user_type = match self.user_type.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label
                .parse::<UserType>()
                .map_err(|error| Error::InvalidInput(error.to_string()))?,
            _ => UserType::Common,
        };
        Ok(NewUser {
            rfid_tag: self.rfid_tag.unwrap_or_default(),
            name: self.name,
            nic: self.nic,
            user_type,
        })
    }
}

#[derive(Clone)]
pub struct ChangeRecorder {
    db: Database,
    config: Arc<NodeConfig>,
    partitioner: IdPartitioner,
}

impl ChangeRecorder {
    pub fn new(db: Database, config: Arc<NodeConfig>) -> Result<Self> {
        let partitioner = IdPartitioner::new(config.ordinal, config.node_count)?;
        Ok(Self {
            db,
            config,
            partitioner,
        })
    }

    /// Run several recorded writes in one transaction.
    pub fn record<T>(&self, f: impl FnOnce(&RecordingTx<'_>) -> Result<T>) -> Result<T> {
        self.db.write(|tx| f(&self.scope(tx)))
    }

    /// Recording handle over a transaction the caller already holds.
    pub(crate) fn scope<'a>(&'a self, conn: &'a Connection) -> RecordingTx<'a> {
        RecordingTx {
            conn,
            config: &self.config,
            partitioner: self.partitioner,
            now: now_ms(),
        }
    }

    pub fn create_user(&self, new_user: NewUser) -> Result<User> {
        self.record(|tx| tx.create_user(new_user))
    }

    pub fn update_user(&self, id: i64, patch: &UserPatch) -> Result<User> {
        self.record(|tx| tx.update_user(id, patch))
    }

    pub fn delete_user(&self, id: i64) -> Result<User> {
        self.record(|tx| tx.delete_user(id))
    }

    pub fn append_log(&self, new_log: NewAccessLog) -> Result<AccessLog> {
        self.record(|tx| tx.append_log(new_log))
    }

    /// Enrol holders from CSV with `rfid_tag,name,nic,user_type` columns.
    ///
    /// Every row is its own recorded write. Rows whose tag is taken or that
    /// fail validation are counted and skipped; a storage error stops the
    /// import with the earlier rows kept.
    pub fn import_users(&self, input: impl io::Read) -> Result<ImportSummary> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(input);
        let has_tag_column = reader
            .headers()
            .map_err(|error| Error::InvalidInput(format!("unreadable CSV header: {error}")))?
            .iter()
            .any(|column| column == "rfid_tag");
        if !has_tag_column {
            return Err(Error::InvalidInput("CSV has no rfid_tag column".to_string()));
        }

        let mut summary = ImportSummary::default();
        for (index, row) in reader.deserialize::<ImportRow>().enumerate() {
            let line = index + 2;
            let created = row
                .map_err(|error| Error::InvalidInput(error.to_string()))
                .and_then(ImportRow::into_new_user)
                .and_then(|new_user| self.create_user(new_user));
            match created {
                Ok(_) => summary.inserted += 1,
                Err(Error::Duplicate(reason)) => {
                    tracing::debug!(line, %reason, "Skipped duplicate enrolment");
                    summary.duplicates += 1;
                }
                Err(Error::InvalidInput(reason)) => {
                    tracing::warn!(line, %reason, "Skipped invalid enrolment row");
                    summary.invalid += 1;
                }
                Err(error) => return Err(error),
            }
        }

        tracing::info!(
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            invalid = summary.invalid,
            "Imported users"
        );
        Ok(summary)
    }
}

/// Handle to an open recording transaction.
pub struct RecordingTx<'a> {
    conn: &'a Connection,
    config: &'a NodeConfig,
    partitioner: IdPartitioner,
    now: i64,
}

impl RecordingTx<'_> {
    pub(crate) const fn conn(&self) -> &Connection {
        self.conn
    }

    pub const fn now(&self) -> i64 {
        self.now
    }

    pub fn users(&self) -> UserRepository<'_> {
        UserRepository::new(self.conn)
    }

    pub fn logs(&self) -> LogRepository<'_> {
        LogRepository::new(self.conn)
    }

    pub fn create_user(&self, new_user: NewUser) -> Result<User> {
        let new_user = new_user.normalized()?;
        if let Some(holder) = self.users().find_by_tag(&new_user.rfid_tag)? {
            return Err(Error::Duplicate(format!(
                "RFID tag '{}' is already assigned to user {}",
                new_user.rfid_tag, holder.id
            )));
        }

        let id = self.partitioner.next_id(max_owned_id(
            self.conn,
            SyncTable::Users,
            &self.partitioner,
        )?);
        let ordinal = self.config.ordinal;
        let user = User {
            id,
            rfid_tag: new_user.rfid_tag,
            name: new_user.name,
            nic: new_user.nic,
            user_type: new_user.user_type,
            status: UserStatus::Idle,
            last_gate_id: None,
            last_booth_id: None,
            is_active: true,
            version: 1,
            last_sync_at: Some(self.now),
            node_id: ordinal,
            created_at: self.now,
            updated_at: self.now,
            updated_by: ordinal,
            is_deleted: false,
        };
        insert_user_row(self.conn, &user)?;
        self.enqueue_user(&user, ChangeOperation::Insert, None)?;
        Ok(user)
    }

    pub fn update_user(&self, id: i64, patch: &UserPatch) -> Result<User> {
        if patch.is_empty() {
            return Err(Error::InvalidInput("user update has no fields".to_string()));
        }
        let current = self.live_user(id)?;
        let mut next = current.clone();
        patch.apply_to(&mut next);
        self.commit_user(&current, next, ChangeOperation::Update)
    }

    /// Soft delete; the tombstone replicates like any other update.
    pub fn delete_user(&self, id: i64) -> Result<User> {
        let current = self.live_user(id)?;
        let mut next = current.clone();
        next.is_deleted = true;
        self.commit_user(&current, next, ChangeOperation::Delete)
    }

    /// Tombstone a duplicate enrolment and move it off its credential so the
    /// surviving row can hold the tag.
    pub(crate) fn retire_user(&self, id: i64) -> Result<User> {
        let current = self.live_user(id)?;
        let mut next = current.clone();
        next.rfid_tag = retired_tag(&current);
        next.is_deleted = true;
        self.commit_user(&current, next, ChangeOperation::Delete)
    }

    /// Replace the replicated content of a user with `content` as a new
    /// local write. Used when an operator accepts a remote version.
    pub(crate) fn overwrite_user(&self, id: i64, content: &User) -> Result<User> {
        let current = self
            .users()
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        let mut next = current.clone();
        next.take_content(content);
        let operation = if next.is_deleted {
            ChangeOperation::Delete
        } else {
            ChangeOperation::Update
        };
        self.commit_user(&current, next, operation)
    }

    pub fn append_log(&self, new_log: NewAccessLog) -> Result<AccessLog> {
        let id = self.partitioner.next_id(max_owned_id(
            self.conn,
            SyncTable::Logs,
            &self.partitioner,
        )?);
        let log = AccessLog {
            id,
            user_id: new_log.user_id,
            event_type: new_log.event_type,
            gate_id: new_log.gate_id,
            booth_id: new_log.booth_id,
            device_id: new_log.device_id,
            created_at: self.now,
            result: new_log.result,
            message: normalize_text_option(new_log.message),
            node_id: self.config.ordinal,
            synced: false,
            sync_timestamp: None,
        };
        insert_log_row(self.conn, &log)?;

        if self.config.syncs(SyncTable::Logs) {
            let payload = serde_json::to_value(&log)?;
            let change_id = enqueue(
                self.conn,
                SyncTable::Logs,
                log.id,
                ChangeOperation::Insert,
                None,
                &payload,
                self.now,
            )?;
            tracing::debug!(log_id = log.id, change_id, "Recorded access log");
        }
        Ok(log)
    }

    fn live_user(&self, id: i64) -> Result<User> {
        self.users()
            .get(id)?
            .filter(|user| !user.is_deleted)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    /// Stamp `next` as this node's write over `current` and persist it.
    fn commit_user(&self, current: &User, mut next: User, operation: ChangeOperation) -> Result<User> {
        next.version = current.version + 1;
        next.last_sync_at = Some(self.now);
        // a local write always orders after the content it replaces
        next.updated_at = self.now.max(current.updated_at.max(next.updated_at) + 1);
        next.updated_by = self.config.ordinal;

        update_user_row(self.conn, &next, current.version)?;
        self.enqueue_user(&next, operation, Some(current.version))?;
        Ok(next)
    }

    fn enqueue_user(
        &self,
        user: &User,
        operation: ChangeOperation,
        base_version: Option<i64>,
    ) -> Result<()> {
        if !self.config.syncs(SyncTable::Users) {
            return Ok(());
        }
        let payload = serde_json::to_value(user)?;
        let change_id = enqueue(
            self.conn,
            SyncTable::Users,
            user.id,
            operation,
            base_version,
            &payload,
            self.now,
        )?;
        tracing::debug!(
            user_id = user.id,
            version = user.version,
            change_id,
            operation = %operation,
            "Recorded user change"
        );
        Ok(())
    }
}

/// Tag a retired duplicate is parked under; unique per row id.
pub(crate) fn retired_tag(user: &User) -> String {
    format!("{}#merged-{}", user.rfid_tag, user.id)
}
