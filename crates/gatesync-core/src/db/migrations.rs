//! Database migrations

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate(conn, 1, V1_ACCESS_TABLES)?;
    }
    if version < 2 {
        migrate(conn, 2, V2_SYNC_TABLES)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

fn migrate(conn: &mut Connection, version: i32, statements: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(statements)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: replicated access-control tables
const V1_ACCESS_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        rfid_tag TEXT NOT NULL UNIQUE,
        name TEXT,
        nic TEXT,
        user_type TEXT NOT NULL DEFAULT 'Common',
        status TEXT NOT NULL DEFAULT 'IDLE',
        last_gate_id INTEGER,
        last_booth_id INTEGER,
        is_active INTEGER NOT NULL DEFAULT 1,
        version INTEGER NOT NULL DEFAULT 1,
        last_sync_at INTEGER,
        node_id INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        updated_by INTEGER NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_users_node ON users(node_id);
    CREATE INDEX IF NOT EXISTS idx_users_created ON users(created_at DESC);

    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY,
        user_id INTEGER,
        event_type TEXT NOT NULL,
        gate_id INTEGER NOT NULL,
        booth_id INTEGER NOT NULL,
        device_id INTEGER,
        created_at INTEGER NOT NULL,
        result TEXT NOT NULL,
        message TEXT,
        node_id INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        sync_timestamp INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_logs_created ON logs(created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user_id);
    CREATE INDEX IF NOT EXISTS idx_logs_synced ON logs(synced);
";

/// Version 2: change queue, acknowledgements, metadata and conflicts
const V2_SYNC_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS node_identity (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        ordinal INTEGER NOT NULL,
        node_count INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS change_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        record_id INTEGER NOT NULL,
        operation TEXT NOT NULL,
        base_version INTEGER,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_change_queue_pending ON change_queue(table_name, synced, id);
    CREATE INDEX IF NOT EXISTS idx_change_queue_record ON change_queue(table_name, record_id);

    CREATE TABLE IF NOT EXISTS change_acks (
        change_id INTEGER NOT NULL REFERENCES change_queue(id) ON DELETE CASCADE,
        peer_id INTEGER NOT NULL,
        acked_at INTEGER NOT NULL,
        PRIMARY KEY (change_id, peer_id)
    );

    CREATE TABLE IF NOT EXISTS applied_changes (
        origin_node INTEGER NOT NULL,
        change_id INTEGER NOT NULL,
        table_name TEXT NOT NULL,
        record_id INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        applied_at INTEGER NOT NULL,
        PRIMARY KEY (origin_node, change_id)
    );

    CREATE TABLE IF NOT EXISTS sync_metadata (
        node_id INTEGER NOT NULL,
        table_name TEXT NOT NULL,
        last_sync_at INTEGER,
        last_attempt_at INTEGER,
        status TEXT NOT NULL,
        error_message TEXT,
        pull_cursor INTEGER NOT NULL DEFAULT 0,
        last_received_at INTEGER,
        PRIMARY KEY (node_id, table_name)
    );

    CREATE TABLE IF NOT EXISTS sync_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        record_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        origin_node INTEGER NOT NULL,
        payload TEXT NOT NULL,
        local_payload TEXT,
        winner TEXT,
        resolved INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        resolved_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_open ON sync_conflicts(resolved, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record ON sync_conflicts(table_name, record_id);
";
