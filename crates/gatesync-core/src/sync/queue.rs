//! Outbound change queue and per-peer acknowledgements

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::{NodeConfig, SyncTable};
use crate::db::Database;
use crate::error::Result;
use crate::models::{ChangeEntry, ChangeOperation};
use crate::util::now_ms;

const ENTRY_COLUMNS: &str =
    "id, table_name, record_id, operation, base_version, payload, created_at, synced";

/// Append an entry; must run inside the transaction of the triggering write.
pub(crate) fn enqueue(
    conn: &Connection,
    table: SyncTable,
    record_id: i64,
    operation: ChangeOperation,
    base_version: Option<i64>,
    payload: &serde_json::Value,
    created_at: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO change_queue (table_name, record_id, operation, base_version, payload, created_at, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![table, record_id, operation, base_version, payload, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Whether this node changed `record_id` in a way `peer` has not acknowledged yet.
pub(crate) fn has_unacked_change(
    conn: &Connection,
    table: SyncTable,
    record_id: i64,
    peer: u32,
) -> Result<bool> {
    let pending = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM change_queue c
            WHERE c.table_name = ?1 AND c.record_id = ?2 AND c.synced = 0
              AND NOT EXISTS (
                SELECT 1 FROM change_acks a WHERE a.change_id = c.id AND a.peer_id = ?3
              )
         )",
        params![table, record_id, peer],
        |row| row.get(0),
    )?;
    Ok(pending)
}

/// Local changes waiting for peers.
#[derive(Clone)]
pub struct ChangeQueue {
    db: Database,
    config: Arc<NodeConfig>,
}

impl ChangeQueue {
    pub const fn new(db: Database, config: Arc<NodeConfig>) -> Self {
        Self { db, config }
    }

    pub fn get(&self, id: i64) -> Result<Option<ChangeEntry>> {
        self.db.read(|conn| {
            let entry = conn
                .query_row(
                    &format!("SELECT {ENTRY_COLUMNS} FROM change_queue WHERE id = ?1"),
                    params![id],
                    parse_entry,
                )
                .optional()?;
            Ok(entry)
        })
    }

    /// Entries of `table` that `peer` has not acknowledged, oldest first.
    pub fn pending_for_peer(
        &self,
        table: SyncTable,
        peer: u32,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM change_queue c
                 WHERE c.table_name = ?1 AND c.synced = 0
                   AND NOT EXISTS (
                     SELECT 1 FROM change_acks a WHERE a.change_id = c.id AND a.peer_id = ?2
                   )
                 ORDER BY c.id ASC
                 LIMIT ?3"
            ))?;
            let entries = stmt
                .query_map(params![table, peer, limit as i64], parse_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Entries of `table` with id greater than `since`, for a peer's pull.
    pub fn changes_since(
        &self,
        table: SyncTable,
        since: i64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM change_queue
                 WHERE table_name = ?1 AND id > ?2
                 ORDER BY id ASC
                 LIMIT ?3"
            ))?;
            let entries = stmt
                .query_map(params![table, since, limit as i64], parse_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    /// Record that `peer` holds the given entries. Unknown ids are ignored.
    pub fn record_acks(&self, peer: u32, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = now_ms();
        self.db.write(|tx| {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO change_acks (change_id, peer_id, acked_at)
                 SELECT id, ?2, ?3 FROM change_queue WHERE id = ?1",
            )?;
            let mut inserted = 0;
            for id in ids {
                inserted += stmt.execute(params![id, peer, now])?;
            }
            Ok(inserted)
        })
    }

    /// Acknowledge every entry of `table` up to `cursor` for `peer`.
    ///
    /// A peer's pull cursor is the highest of our change ids it has processed,
    /// so everything at or below it is on the peer.
    pub fn ack_through(&self, table: SyncTable, peer: u32, cursor: i64) -> Result<usize> {
        if cursor <= 0 {
            return Ok(0);
        }
        let now = now_ms();
        self.db.write(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO change_acks (change_id, peer_id, acked_at)
                 SELECT id, ?1, ?2 FROM change_queue
                 WHERE table_name = ?3 AND id <= ?4 AND synced = 0",
                params![peer, now, table, cursor],
            )?;
            Ok(inserted)
        })
    }

    /// Mark entries acknowledged by every configured peer as synced, and
    /// stamp the log rows they carried.
    pub fn finalize(&self, table: SyncTable) -> Result<usize> {
        let peers = self.config.peer_ordinals();
        let now = now_ms();
        self.db.write(|tx| {
            let marked = if peers.is_empty() {
                tx.execute(
                    "UPDATE change_queue SET synced = 1 WHERE synced = 0 AND table_name = ?1",
                    params![table],
                )?
            } else {
                let peer_list = peers
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                tx.execute(
                    &format!(
                        "UPDATE change_queue SET synced = 1
                         WHERE synced = 0 AND table_name = ?1
                           AND (SELECT COUNT(*) FROM change_acks a
                                WHERE a.change_id = change_queue.id
                                  AND a.peer_id IN ({peer_list})) = ?2"
                    ),
                    params![table, peers.len() as i64],
                )?
            };

            if marked > 0 && table == SyncTable::Logs {
                tx.execute(
                    "UPDATE logs SET synced = 1, sync_timestamp = ?1
                     WHERE synced = 0
                       AND id IN (SELECT record_id FROM change_queue
                                  WHERE table_name = 'logs' AND synced = 1)",
                    params![now],
                )?;
            }
            Ok(marked)
        })
    }

    /// Drop synced entries created before the retention window.
    pub fn prune(&self, now: i64) -> Result<usize> {
        let retention = i64::try_from(self.config.queue_retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention);
        let removed = self.db.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM change_queue WHERE synced = 1 AND created_at < ?1",
                params![cutoff],
            )?)
        })?;
        if removed > 0 {
            tracing::debug!(removed, "Pruned synced change-queue entries");
        }
        Ok(removed)
    }

    pub fn pending_count(&self, table: SyncTable) -> Result<i64> {
        self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM change_queue WHERE table_name = ?1 AND synced = 0",
                params![table],
                |row| row.get(0),
            )?)
        })
    }
}

fn parse_entry(row: &Row<'_>) -> rusqlite::Result<ChangeEntry> {
    Ok(ChangeEntry {
        id: row.get(0)?,
        table: row.get(1)?,
        record_id: row.get(2)?,
        operation: row.get(3)?,
        base_version: row.get(4)?,
        payload: row.get(5)?,
        created_at: row.get(6)?,
        synced: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::PeerConfig;

    fn queue(peers: &[u32]) -> ChangeQueue {
        let peers = peers
            .iter()
            .map(|ordinal| PeerConfig {
                ordinal: *ordinal,
                url: format!("http://node-{ordinal}:8080"),
            })
            .collect();
        let config = NodeConfig::new(1, 3).unwrap().with_peers(peers);
        ChangeQueue::new(Database::open_in_memory().unwrap(), Arc::new(config))
    }

    fn push_entry(queue: &ChangeQueue, table: SyncTable, record_id: i64, created_at: i64) -> i64 {
        queue
            .db
            .write(|tx| {
                enqueue(
                    tx,
                    table,
                    record_id,
                    ChangeOperation::Insert,
                    None,
                    &json!({ "id": record_id }),
                    created_at,
                )
            })
            .unwrap()
    }

    #[test]
    fn pending_excludes_entries_acked_by_that_peer() {
        let queue = queue(&[2, 3]);
        let first = push_entry(&queue, SyncTable::Users, 1, 10);
        let second = push_entry(&queue, SyncTable::Users, 4, 20);

        queue.record_acks(2, &[first]).unwrap();

        let for_two: Vec<i64> = queue
            .pending_for_peer(SyncTable::Users, 2, 10)
            .unwrap()
            .iter()
            .map(|entry| entry.id)
            .collect();
        let for_three = queue.pending_for_peer(SyncTable::Users, 3, 10).unwrap();
        assert_eq!(for_two, vec![second]);
        assert_eq!(for_three.len(), 2);
    }

    #[test]
    fn finalize_requires_every_peer() {
        let queue = queue(&[2, 3]);
        let id = push_entry(&queue, SyncTable::Users, 1, 10);

        queue.record_acks(2, &[id]).unwrap();
        assert_eq!(queue.finalize(SyncTable::Users).unwrap(), 0);
        assert_eq!(queue.pending_count(SyncTable::Users).unwrap(), 1);

        queue.record_acks(3, &[id]).unwrap();
        assert_eq!(queue.finalize(SyncTable::Users).unwrap(), 1);
        assert!(queue.get(id).unwrap().unwrap().synced);
    }

    #[test]
    fn ack_through_only_covers_the_table_and_cursor() {
        let queue = queue(&[2]);
        let user_a = push_entry(&queue, SyncTable::Users, 1, 10);
        let log = push_entry(&queue, SyncTable::Logs, 1, 11);
        let user_b = push_entry(&queue, SyncTable::Users, 4, 12);

        assert_eq!(queue.ack_through(SyncTable::Users, 2, user_a).unwrap(), 1);
        queue.finalize(SyncTable::Users).unwrap();
        queue.finalize(SyncTable::Logs).unwrap();

        assert!(queue.get(user_a).unwrap().unwrap().synced);
        assert!(!queue.get(log).unwrap().unwrap().synced);
        assert!(!queue.get(user_b).unwrap().unwrap().synced);
    }

    #[test]
    fn record_acks_ignores_unknown_ids() {
        let queue = queue(&[2]);
        let id = push_entry(&queue, SyncTable::Users, 1, 10);
        assert_eq!(queue.record_acks(2, &[id, 999]).unwrap(), 1);
        assert_eq!(queue.record_acks(2, &[id]).unwrap(), 0);
    }

    #[test]
    fn changes_since_pages_in_id_order() {
        let queue = queue(&[2]);
        let ids: Vec<i64> = (0..5)
            .map(|n| push_entry(&queue, SyncTable::Logs, n * 3 + 1, 100 - n))
            .collect();

        let page = queue.changes_since(SyncTable::Logs, ids[1], 2).unwrap();
        assert_eq!(
            page.iter().map(|entry| entry.id).collect::<Vec<_>>(),
            vec![ids[2], ids[3]]
        );
    }

    #[test]
    fn unacked_change_detection_is_per_peer() {
        let queue = queue(&[2, 3]);
        let id = push_entry(&queue, SyncTable::Users, 7, 10);
        queue.record_acks(2, &[id]).unwrap();

        let (two, three) = queue
            .db
            .read(|conn| {
                Ok((
                    has_unacked_change(conn, SyncTable::Users, 7, 2)?,
                    has_unacked_change(conn, SyncTable::Users, 7, 3)?,
                ))
            })
            .unwrap();
        assert!(!two);
        assert!(three);
    }

    #[test]
    fn prune_keeps_unsynced_and_recent_entries() {
        let queue = queue(&[2]);
        let day_ms = 24 * 60 * 60 * 1_000;
        let old_acked = push_entry(&queue, SyncTable::Users, 1, 0);
        let old_pending = push_entry(&queue, SyncTable::Users, 4, 0);
        let recent = push_entry(&queue, SyncTable::Users, 7, 8 * day_ms);
        queue.record_acks(2, &[old_acked, recent]).unwrap();
        queue.finalize(SyncTable::Users).unwrap();

        assert_eq!(queue.prune(8 * day_ms).unwrap(), 1);
        assert!(queue.get(old_acked).unwrap().is_none());
        assert!(queue.get(old_pending).unwrap().is_some());
        assert!(queue.get(recent).unwrap().is_some());
    }
}
