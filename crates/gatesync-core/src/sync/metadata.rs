//! Per (peer, table) sync progress

use rusqlite::{params, OptionalExtension, Row};

use crate::config::SyncTable;
use crate::db::Database;
use crate::error::Result;
use crate::models::{SyncMetadata, SyncOutcome, SyncStatus, SyncStatusRow};
use crate::util::{compact_text, now_ms};

const METADATA_COLUMNS: &str = "node_id, table_name, last_sync_at, last_attempt_at, status, \
     error_message, pull_cursor, last_received_at";

const INTERRUPTED_MESSAGE: &str = "interrupted before completion";
const NEVER_SYNCED_MESSAGE: &str = "no sync cycle run against this peer yet";

#[derive(Clone)]
pub struct SyncMetadataStore {
    db: Database,
}

impl SyncMetadataStore {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn status(&self, peer: u32, table: SyncTable) -> Result<Option<SyncMetadata>> {
        self.db.read(|conn| {
            let metadata = conn
                .query_row(
                    &format!(
                        "SELECT {METADATA_COLUMNS} FROM sync_metadata
                         WHERE node_id = ?1 AND table_name = ?2"
                    ),
                    params![peer, table],
                    parse_metadata,
                )
                .optional()?;
            Ok(metadata)
        })
    }

    /// Every row, ordered by peer then table.
    pub fn list_status(&self) -> Result<Vec<SyncStatusRow>> {
        let now = now_ms();
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {METADATA_COLUMNS} FROM sync_metadata ORDER BY node_id, table_name"
            ))?;
            let rows = stmt
                .query_map([], parse_metadata)?
                .map(|row| row.map(|metadata| SyncStatusRow::new(metadata, now)))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn mark_in_progress(&self, peer: u32, table: SyncTable) -> Result<()> {
        let now = now_ms();
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO sync_metadata (node_id, table_name, last_attempt_at, status, error_message)
                 VALUES (?1, ?2, ?3, ?4, NULL)
                 ON CONFLICT(node_id, table_name) DO UPDATE SET
                    last_attempt_at = excluded.last_attempt_at,
                    status = excluded.status,
                    error_message = NULL",
                params![peer, table, now, SyncStatus::InProgress],
            )?;
            Ok(())
        })
    }

    /// Upsert the outcome of a cycle. Success clears any previous error.
    pub fn record_attempt(&self, peer: u32, table: SyncTable, outcome: &SyncOutcome) -> Result<()> {
        let now = now_ms();
        self.db.write(|tx| {
            match outcome {
                SyncOutcome::Success => tx.execute(
                    "INSERT INTO sync_metadata (node_id, table_name, last_sync_at, last_attempt_at, status, error_message)
                     VALUES (?1, ?2, ?3, ?3, ?4, NULL)
                     ON CONFLICT(node_id, table_name) DO UPDATE SET
                        last_sync_at = excluded.last_sync_at,
                        last_attempt_at = excluded.last_attempt_at,
                        status = excluded.status,
                        error_message = NULL",
                    params![peer, table, now, SyncStatus::Success],
                )?,
                SyncOutcome::Failed(message) => tx.execute(
                    "INSERT INTO sync_metadata (node_id, table_name, last_attempt_at, status, error_message)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(node_id, table_name) DO UPDATE SET
                        last_attempt_at = excluded.last_attempt_at,
                        status = excluded.status,
                        error_message = excluded.error_message",
                    params![peer, table, now, SyncStatus::Failed, compact_text(message)],
                )?,
            };
            Ok(())
        })
    }

    pub fn pull_cursor(&self, peer: u32, table: SyncTable) -> Result<i64> {
        self.db.read(|conn| {
            let cursor = conn
                .query_row(
                    "SELECT pull_cursor FROM sync_metadata WHERE node_id = ?1 AND table_name = ?2",
                    params![peer, table],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(cursor.unwrap_or(0))
        })
    }

    /// Advance the cursor; it never moves backwards.
    pub fn set_pull_cursor(&self, peer: u32, table: SyncTable, cursor: i64) -> Result<()> {
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO sync_metadata (node_id, table_name, status, pull_cursor)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(node_id, table_name) DO UPDATE SET
                    pull_cursor = MAX(pull_cursor, excluded.pull_cursor)",
                params![peer, table, SyncStatus::InProgress, cursor],
            )?;
            Ok(())
        })
    }

    /// Stamp an inbound push from `peer`. A pair this node has never synced
    /// itself starts out `FAILED` until its first cycle completes.
    pub fn record_received(&self, peer: u32, table: SyncTable) -> Result<()> {
        let now = now_ms();
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO sync_metadata (node_id, table_name, status, error_message, last_received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(node_id, table_name) DO UPDATE SET
                    last_received_at = excluded.last_received_at",
                params![peer, table, SyncStatus::Failed, NEVER_SYNCED_MESSAGE, now],
            )?;
            Ok(())
        })
    }

    /// Turn rows left `IN_PROGRESS` by a previous process into `FAILED`.
    pub fn reset_interrupted(&self) -> Result<usize> {
        let reset = self.db.write(|tx| {
            Ok(tx.execute(
                "UPDATE sync_metadata SET status = ?1, error_message = ?2 WHERE status = ?3",
                params![SyncStatus::Failed, INTERRUPTED_MESSAGE, SyncStatus::InProgress],
            )?)
        })?;
        if reset > 0 {
            tracing::warn!(reset, "Marked interrupted sync cycles as failed");
        }
        Ok(reset)
    }
}

fn parse_metadata(row: &Row<'_>) -> rusqlite::Result<SyncMetadata> {
    Ok(SyncMetadata {
        node_id: row.get(0)?,
        table: row.get(1)?,
        last_sync_at: row.get(2)?,
        last_attempt_at: row.get(3)?,
        status: row.get(4)?,
        error_message: row.get(5)?,
        pull_cursor: row.get(6)?,
        last_received_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> SyncMetadataStore {
        SyncMetadataStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn success_failure_success_keeps_one_row_and_clears_error() {
        let store = store();

        store
            .record_attempt(2, SyncTable::Users, &SyncOutcome::Success)
            .unwrap();
        let first = store.status(2, SyncTable::Users).unwrap().unwrap();
        assert_eq!(first.status, SyncStatus::Success);
        assert_eq!(first.error_message, None);

        store
            .record_attempt(
                2,
                SyncTable::Users,
                &SyncOutcome::Failed("peer 2 unreachable".to_string()),
            )
            .unwrap();
        let failed = store.status(2, SyncTable::Users).unwrap().unwrap();
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("peer 2 unreachable"));
        assert_eq!(failed.last_sync_at, first.last_sync_at);

        store
            .record_attempt(2, SyncTable::Users, &SyncOutcome::Success)
            .unwrap();
        let recovered = store.status(2, SyncTable::Users).unwrap().unwrap();
        assert_eq!(recovered.status, SyncStatus::Success);
        assert_eq!(recovered.error_message, None);
        assert_eq!(store.list_status().unwrap().len(), 1);
    }

    #[test]
    fn pull_cursor_defaults_to_zero_and_never_regresses() {
        let store = store();
        assert_eq!(store.pull_cursor(3, SyncTable::Logs).unwrap(), 0);

        store.set_pull_cursor(3, SyncTable::Logs, 12).unwrap();
        store.set_pull_cursor(3, SyncTable::Logs, 7).unwrap();
        assert_eq!(store.pull_cursor(3, SyncTable::Logs).unwrap(), 12);
    }

    #[test]
    fn reset_interrupted_marks_in_progress_rows_failed() {
        let store = store();
        store.mark_in_progress(2, SyncTable::Users).unwrap();
        store
            .record_attempt(2, SyncTable::Logs, &SyncOutcome::Success)
            .unwrap();

        assert_eq!(store.reset_interrupted().unwrap(), 1);
        let users = store.status(2, SyncTable::Users).unwrap().unwrap();
        assert_eq!(users.status, SyncStatus::Failed);
        assert_eq!(users.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        let logs = store.status(2, SyncTable::Logs).unwrap().unwrap();
        assert_eq!(logs.status, SyncStatus::Success);
    }

    #[test]
    fn inbound_push_only_touches_last_received() {
        let store = store();
        store
            .record_attempt(2, SyncTable::Users, &SyncOutcome::Failed("timeout".to_string()))
            .unwrap();
        store.record_received(2, SyncTable::Users).unwrap();

        let row = store.status(2, SyncTable::Users).unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Failed);
        assert!(row.last_received_at.is_some());

        store.record_received(3, SyncTable::Users).unwrap();
        let fresh = store.status(3, SyncTable::Users).unwrap().unwrap();
        assert_eq!(fresh.status, SyncStatus::Failed);
        assert_eq!(fresh.error_message.as_deref(), Some(NEVER_SYNCED_MESSAGE));
        assert_eq!(fresh.last_sync_at, None);
        assert!(fresh.last_received_at.is_some());

        store
            .record_attempt(3, SyncTable::Users, &SyncOutcome::Success)
            .unwrap();
        let synced = store.status(3, SyncTable::Users).unwrap().unwrap();
        assert_eq!(synced.status, SyncStatus::Success);
        assert_eq!(synced.error_message, None);
    }
}
