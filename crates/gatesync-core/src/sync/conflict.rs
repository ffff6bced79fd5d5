//! Applying remote changes, and detecting and settling conflicts.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::queue::has_unacked_change;
use super::recorder::ChangeRecorder;
use crate::config::{ConflictPolicy, NodeConfig, SyncTable};
use crate::db::{insert_log_row, insert_user_row, update_user_row, Database, LogRepository, UserRepository};
use crate::error::{Error, Result};
use crate::models::{
    AccessLog, ChangeEnvelope, ChangeOperation, ConflictKind, ConflictWinner, ParseEnumError,
    SyncConflict, User,
};
use crate::util::now_ms;

const CONFLICT_COLUMNS: &str = "id, table_name, record_id, kind, origin_node, payload, \
     local_payload, winner, resolved, created_at, resolved_at";

/// What happened to one incoming change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already processed; nothing changed
    Duplicate,
    Conflicted {
        conflict_id: i64,
        resolved: bool,
    },
    /// Failed validation; acknowledged and skipped
    Rejected(String),
}

impl ApplyOutcome {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Conflicted { .. } => "conflicted",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Operator decision on an open conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepLocal,
    AcceptRemote,
}

impl FromStr for ConflictResolution {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_local" | "local" => Ok(Self::KeepLocal),
            "accept_remote" | "remote" => Ok(Self::AcceptRemote),
            _ => Err(ParseEnumError::new("conflict resolution", s)),
        }
    }
}

struct NewConflict<'a> {
    table: SyncTable,
    record_id: i64,
    kind: ConflictKind,
    envelope: &'a ChangeEnvelope,
    local_payload: Option<serde_json::Value>,
    winner: Option<ConflictWinner>,
    resolved: bool,
}

#[derive(Clone)]
pub struct ConflictResolver {
    db: Database,
    config: Arc<NodeConfig>,
    recorder: ChangeRecorder,
}

impl ConflictResolver {
    pub const fn new(db: Database, config: Arc<NodeConfig>, recorder: ChangeRecorder) -> Self {
        Self {
            db,
            config,
            recorder,
        }
    }

    /// Apply one change received from `origin`.
    ///
    /// The row write, any conflict record and the ledger entry commit
    /// together. Storage errors are returned and leave nothing behind, so the
    /// change is retried on the next delivery.
    pub fn apply_remote(&self, origin: u32, envelope: &ChangeEnvelope) -> Result<ApplyOutcome> {
        if let Some(reason) = self.envelope_problem(origin, envelope) {
            tracing::warn!(
                origin,
                change_id = envelope.change_id,
                %reason,
                "Rejected incoming change"
            );
            return Ok(ApplyOutcome::Rejected(reason));
        }

        let now = now_ms();
        let outcome = self.db.write(|tx| {
            if already_applied(tx, origin, envelope.change_id)? {
                return Ok(ApplyOutcome::Duplicate);
            }
            let outcome = match envelope.table {
                SyncTable::Users => self.apply_user(tx, origin, envelope, now)?,
                SyncTable::Logs => apply_log(tx, origin, envelope, now)?,
            };
            tx.execute(
                "INSERT INTO applied_changes (origin_node, change_id, table_name, record_id, outcome, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    origin,
                    envelope.change_id,
                    envelope.table,
                    envelope.record_id,
                    outcome.label(),
                    now
                ],
            )?;
            Ok(outcome)
        })?;

        match &outcome {
            ApplyOutcome::Conflicted {
                conflict_id,
                resolved,
            } => tracing::info!(
                origin,
                table = %envelope.table,
                record_id = envelope.record_id,
                conflict_id,
                resolved,
                "Conflict detected"
            ),
            ApplyOutcome::Rejected(reason) => tracing::warn!(
                origin,
                change_id = envelope.change_id,
                %reason,
                "Rejected incoming change"
            ),
            ApplyOutcome::Applied | ApplyOutcome::Duplicate => tracing::debug!(
                origin,
                table = %envelope.table,
                change_id = envelope.change_id,
                outcome = outcome.label(),
                "Processed incoming change"
            ),
        }
        Ok(outcome)
    }

    fn envelope_problem(&self, origin: u32, envelope: &ChangeEnvelope) -> Option<String> {
        if envelope.origin_node != origin {
            return Some(format!(
                "change {} claims origin {} but was sent by node {origin}",
                envelope.change_id, envelope.origin_node
            ));
        }
        if origin == self.config.ordinal {
            return Some(format!("change {} originated on this node", envelope.change_id));
        }
        if !self.config.syncs(envelope.table) {
            return Some(format!("table {} is not synchronized here", envelope.table));
        }
        None
    }

    fn apply_user(
        &self,
        conn: &Connection,
        origin: u32,
        envelope: &ChangeEnvelope,
        now: i64,
    ) -> Result<ApplyOutcome> {
        let incoming: User = match serde_json::from_value(envelope.payload.clone()) {
            Ok(user) => user,
            Err(error) => return Ok(ApplyOutcome::Rejected(format!("malformed user payload: {error}"))),
        };
        if incoming.id != envelope.record_id {
            return Ok(ApplyOutcome::Rejected(format!(
                "payload id {} does not match record {}",
                incoming.id, envelope.record_id
            )));
        }
        if incoming.updated_by != origin {
            return Ok(ApplyOutcome::Rejected(format!(
                "write stamp names node {} but the change came from node {origin}",
                incoming.updated_by
            )));
        }
        if incoming.rfid_tag.trim().is_empty() {
            return Ok(ApplyOutcome::Rejected("payload has an empty RFID tag".to_string()));
        }

        let users = UserRepository::new(conn);
        match (envelope.operation, users.get(incoming.id)?) {
            (ChangeOperation::Insert, Some(_)) => Ok(ApplyOutcome::Duplicate),
            // an update for a row we never saw carries the full snapshot
            (_, None) => self.insert_remote_user(conn, incoming, envelope, now),
            (ChangeOperation::Update | ChangeOperation::Delete, Some(local)) => {
                self.update_remote_user(conn, origin, local, incoming, envelope, now)
            }
        }
    }

    fn update_remote_user(
        &self,
        conn: &Connection,
        origin: u32,
        local: User,
        incoming: User,
        envelope: &ChangeEnvelope,
        now: i64,
    ) -> Result<ApplyOutcome> {
        if local.stamp() == incoming.stamp() && incoming.version <= local.version {
            return Ok(ApplyOutcome::Duplicate);
        }

        if incoming.rfid_tag != local.rfid_tag {
            if let Some(holder) = UserRepository::new(conn).find_by_tag(&incoming.rfid_tag)? {
                let conflict_id = insert_conflict(
                    conn,
                    &NewConflict {
                        table: SyncTable::Users,
                        record_id: local.id,
                        kind: ConflictKind::InsertDuplicate,
                        envelope,
                        local_payload: Some(serde_json::to_value(&holder)?),
                        winner: None,
                        resolved: false,
                    },
                    now,
                )?;
                return Ok(ApplyOutcome::Conflicted {
                    conflict_id,
                    resolved: false,
                });
            }
        }

        // equal version counts can hide different histories, so a fast-forward
        // must also move the write stamp forward
        let descends = envelope.base_version == Some(local.version)
            && incoming.stamp() > local.stamp()
            && !has_unacked_change(conn, SyncTable::Users, local.id, origin)?;

        let mut next = local.clone();
        next.version = local.version + 1;
        next.last_sync_at = Some(now);

        if descends {
            next.take_content(&incoming);
            update_user_row(conn, &next, local.version)?;
            return Ok(ApplyOutcome::Applied);
        }

        let (winner, resolved) = match self.config.conflict_policy {
            ConflictPolicy::LastWriterWins => {
                let winner = if incoming.stamp() > local.stamp() {
                    ConflictWinner::Remote
                } else {
                    ConflictWinner::Local
                };
                (Some(winner), true)
            }
            ConflictPolicy::Manual => (None, false),
        };
        if winner == Some(ConflictWinner::Remote) {
            next.take_content(&incoming);
        }
        update_user_row(conn, &next, local.version)?;

        let conflict_id = insert_conflict(
            conn,
            &NewConflict {
                table: SyncTable::Users,
                record_id: local.id,
                kind: ConflictKind::UpdateConflict,
                envelope,
                local_payload: Some(serde_json::to_value(&local)?),
                winner,
                resolved,
            },
            now,
        )?;
        Ok(ApplyOutcome::Conflicted {
            conflict_id,
            resolved,
        })
    }

    fn insert_remote_user(
        &self,
        conn: &Connection,
        incoming: User,
        envelope: &ChangeEnvelope,
        now: i64,
    ) -> Result<ApplyOutcome> {
        if let Some(holder) = UserRepository::new(conn).find_by_tag(&incoming.rfid_tag)? {
            // the same person enrolled on two nodes: keep the earlier enrolment
            // everywhere and retire the other one as a recorded write
            let mergeable =
                !holder.is_deleted && !incoming.is_deleted && holder.same_identity(&incoming);
            let winner = match (mergeable, incoming.outranks_enrolment(&holder)) {
                (false, _) => None,
                (true, true) => Some(ConflictWinner::Remote),
                (true, false) => Some(ConflictWinner::Local),
            };
            let local_payload = serde_json::to_value(&holder)?;

            if winner == Some(ConflictWinner::Remote) {
                let retired = self.recorder.scope(conn).retire_user(holder.id)?;
                tracing::info!(
                    kept = incoming.id,
                    retired = retired.id,
                    "Merged duplicate enrolment"
                );
                insert_snapshot(conn, incoming, now)?;
            }

            let conflict_id = insert_conflict(
                conn,
                &NewConflict {
                    table: SyncTable::Users,
                    record_id: envelope.record_id,
                    kind: ConflictKind::InsertDuplicate,
                    envelope,
                    local_payload: Some(local_payload),
                    winner,
                    resolved: mergeable,
                },
                now,
            )?;
            return Ok(ApplyOutcome::Conflicted {
                conflict_id,
                resolved: mergeable,
            });
        }

        insert_snapshot(conn, incoming, now)?;
        Ok(ApplyOutcome::Applied)
    }

    /// Forget ledger entries older than the queue retention window.
    ///
    /// Senders drop acknowledged entries after the same window, so a pruned
    /// change cannot come back through a queue; a late copy still lands on
    /// the row checks as a duplicate.
    pub fn prune_ledger(&self, now: i64) -> Result<usize> {
        let retention = i64::try_from(self.config.queue_retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention);
        let removed = self.db.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM applied_changes WHERE applied_at < ?1",
                params![cutoff],
            )?)
        })?;
        if removed > 0 {
            tracing::debug!(removed, "Pruned applied-change ledger");
        }
        Ok(removed)
    }

    pub fn list_conflicts(&self, unresolved_only: bool, limit: usize) -> Result<Vec<SyncConflict>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                 WHERE (?1 = 0 OR resolved = 0)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let conflicts = stmt
                .query_map(params![unresolved_only, limit as i64], parse_conflict)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(conflicts)
        })
    }

    pub fn get_conflict(&self, id: i64) -> Result<Option<SyncConflict>> {
        self.db.read(|conn| get_conflict(conn, id))
    }

    /// Settle an open conflict.
    ///
    /// `AcceptRemote` writes the incoming content as a new local change, so
    /// it reaches every peer like any other write.
    pub fn resolve_conflict(&self, id: i64, resolution: ConflictResolution) -> Result<SyncConflict> {
        let conflict = self
            .get_conflict(id)?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        if conflict.resolved {
            return Err(Error::InvalidInput(format!("conflict {id} is already resolved")));
        }

        match resolution {
            ConflictResolution::KeepLocal => {
                self.db
                    .write(|tx| mark_resolved(tx, id, ConflictWinner::Local, now_ms()))?;
            }
            ConflictResolution::AcceptRemote => {
                if conflict.kind == ConflictKind::InsertDuplicate || conflict.table != SyncTable::Users {
                    return Err(Error::InvalidInput(format!(
                        "conflict {id} is an {} on {}; only user update conflicts can accept the remote version",
                        conflict.kind, conflict.table
                    )));
                }
                let envelope: ChangeEnvelope = serde_json::from_value(conflict.payload.clone())?;
                let remote: User = serde_json::from_value(envelope.payload)?;
                self.recorder.record(|scope| {
                    scope.overwrite_user(conflict.record_id, &remote)?;
                    mark_resolved(scope.conn(), id, ConflictWinner::Remote, scope.now())
                })?;
            }
        }

        tracing::info!(conflict_id = id, ?resolution, "Conflict resolved by operator");
        self.get_conflict(id)?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))
    }
}

fn already_applied(conn: &Connection, origin: u32, change_id: i64) -> Result<bool> {
    let found = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM applied_changes WHERE origin_node = ?1 AND change_id = ?2)",
        params![origin, change_id],
        |row| row.get(0),
    )?;
    Ok(found)
}

fn insert_snapshot(conn: &Connection, mut row: User, now: i64) -> Result<()> {
    row.version = row.version.max(1);
    row.last_sync_at = Some(now);
    insert_user_row(conn, &row)
}

fn apply_log(
    conn: &Connection,
    origin: u32,
    envelope: &ChangeEnvelope,
    now: i64,
) -> Result<ApplyOutcome> {
    if envelope.operation != ChangeOperation::Insert {
        return Ok(ApplyOutcome::Rejected(format!(
            "logs are append-only, got {}",
            envelope.operation
        )));
    }
    let incoming: AccessLog = match serde_json::from_value(envelope.payload.clone()) {
        Ok(log) => log,
        Err(error) => return Ok(ApplyOutcome::Rejected(format!("malformed log payload: {error}"))),
    };
    if incoming.id != envelope.record_id {
        return Ok(ApplyOutcome::Rejected(format!(
            "payload id {} does not match record {}",
            incoming.id, envelope.record_id
        )));
    }
    if incoming.node_id != origin {
        return Ok(ApplyOutcome::Rejected(format!(
            "log {} was recorded by node {} but sent by node {origin}",
            incoming.id, incoming.node_id
        )));
    }

    match LogRepository::new(conn).get(incoming.id)? {
        Some(local) if local.same_content(&incoming) => Ok(ApplyOutcome::Duplicate),
        Some(local) => {
            let conflict_id = insert_conflict(
                conn,
                &NewConflict {
                    table: SyncTable::Logs,
                    record_id: incoming.id,
                    kind: ConflictKind::InsertDuplicate,
                    envelope,
                    local_payload: Some(serde_json::to_value(&local)?),
                    winner: None,
                    resolved: false,
                },
                now,
            )?;
            Ok(ApplyOutcome::Conflicted {
                conflict_id,
                resolved: false,
            })
        }
        None => {
            let mut row = incoming;
            row.synced = true;
            row.sync_timestamp = Some(now);
            insert_log_row(conn, &row)?;
            Ok(ApplyOutcome::Applied)
        }
    }
}

fn insert_conflict(conn: &Connection, conflict: &NewConflict<'_>, now: i64) -> Result<i64> {
    let payload = serde_json::to_value(conflict.envelope)?;
    conn.execute(
        "INSERT INTO sync_conflicts
            (table_name, record_id, kind, origin_node, payload, local_payload, winner, resolved, created_at, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            conflict.table,
            conflict.record_id,
            conflict.kind,
            conflict.envelope.origin_node,
            payload,
            conflict.local_payload,
            conflict.winner,
            conflict.resolved,
            now,
            conflict.resolved.then_some(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn mark_resolved(conn: &Connection, id: i64, winner: ConflictWinner, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE sync_conflicts SET resolved = 1, winner = ?1, resolved_at = ?2
         WHERE id = ?3 AND resolved = 0",
        params![winner, now, id],
    )?;
    Ok(())
}

fn get_conflict(conn: &Connection, id: i64) -> Result<Option<SyncConflict>> {
    let conflict = conn
        .query_row(
            &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?1"),
            params![id],
            parse_conflict,
        )
        .optional()?;
    Ok(conflict)
}

fn parse_conflict(row: &Row<'_>) -> rusqlite::Result<SyncConflict> {
    Ok(SyncConflict {
        id: row.get(0)?,
        table: row.get(1)?,
        record_id: row.get(2)?,
        kind: row.get(3)?,
        origin_node: row.get(4)?,
        payload: row.get(5)?,
        local_payload: row.get(6)?,
        winner: row.get(7)?,
        resolved: row.get(8)?,
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
    })
}
