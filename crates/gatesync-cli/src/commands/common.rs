use std::env;
use std::path::Path;

use chrono::DateTime;
use gatesync_core::models::{AccessLog, SyncConflict, SyncStatusRow, User};
use gatesync_core::{GateNode, NodeConfig};

use crate::error::CliError;

/// Node configuration from the environment, with the CLI's database override.
pub fn load_config(db_path: Option<&Path>) -> Result<NodeConfig, CliError> {
    let mut config = NodeConfig::from_env()?;
    if let Some(path) = db_path {
        config.db_path = path.to_path_buf();
    }
    Ok(config)
}

/// Attach to the node's database; the daemon may be running.
pub fn open_node(db_path: Option<&Path>) -> Result<GateNode, CliError> {
    let config = load_config(db_path)?;
    Ok(GateNode::attach(config)?)
}

/// Base URL of the running node's API: `--node-url`, then
/// `GATESYNC_NODE_URL`, then the configured bind address.
pub fn resolve_node_url(explicit: Option<String>, db_path: Option<&Path>) -> Result<String, CliError> {
    let configured = explicit
        .or_else(|| env::var("GATESYNC_NODE_URL").ok())
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty());
    match configured {
        Some(url) => Ok(url),
        None => Ok(format!("http://{}", load_config(db_path)?.bind_addr)),
    }
}

/// Look a user up by numeric id, falling back to the RFID tag.
pub fn find_user(node: &GateNode, key: &str) -> Result<User, CliError> {
    let key = key.trim();
    let by_id = match key.parse::<i64>() {
        Ok(id) => node.user(id)?,
        Err(_) => None,
    };
    match by_id {
        Some(user) => Ok(user),
        None => node
            .user_by_tag(key)?
            .ok_or_else(|| CliError::UserNotFound(key.to_string())),
    }
}

pub fn format_timestamp(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms).map_or_else(
        || ms.to_string(),
        |time| time.format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

fn format_optional_timestamp(ms: Option<i64>) -> String {
    ms.map_or_else(|| "never".to_string(), format_timestamp)
}

pub fn format_status_lines(rows: &[SyncStatusRow]) -> Vec<String> {
    rows.iter()
        .map(|row| {
            let meta = &row.metadata;
            let age = row
                .minutes_since_sync
                .map_or_else(String::new, |minutes| format!(" ({minutes}m ago)"));
            let mut line = format!(
                "peer {} {:<5} {:<11} last sync {}{age}, cursor {}",
                meta.node_id,
                meta.table.as_str(),
                meta.status.as_str(),
                format_optional_timestamp(meta.last_sync_at),
                meta.pull_cursor,
            );
            if let Some(error) = &meta.error_message {
                line.push_str(&format!("\n    error: {error}"));
            }
            line
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let state = if conflict.resolved {
                let winner = conflict.winner.map_or("decided", |winner| winner.as_str());
                format!("resolved ({winner})")
            } else {
                "OPEN".to_string()
            };
            format!(
                "#{} {} {} record {} from node {} at {} [{state}]",
                conflict.id,
                conflict.kind.as_str(),
                conflict.table.as_str(),
                conflict.record_id,
                conflict.origin_node,
                format_timestamp(conflict.created_at),
            )
        })
        .collect()
}

pub fn format_user_lines(users: &[User]) -> Vec<String> {
    users
        .iter()
        .map(|user| {
            format!(
                "{} {} {} {} {} v{}{}",
                user.id,
                user.rfid_tag,
                user.name.as_deref().unwrap_or("-"),
                user.user_type.as_str(),
                user.status.as_str(),
                user.version,
                if user.is_active { "" } else { " (inactive)" },
            )
        })
        .collect()
}

pub fn format_log_lines(logs: &[AccessLog]) -> Vec<String> {
    logs.iter()
        .map(|log| {
            let user = log
                .user_id
                .map_or_else(|| "-".to_string(), |id| id.to_string());
            format!(
                "{} {} {} gate {} booth {} user {user} node {}{}",
                format_timestamp(log.created_at),
                log.event_type.as_str(),
                log.result.as_str(),
                log.gate_id,
                log.booth_id,
                log.node_id,
                log.message
                    .as_deref()
                    .map_or_else(String::new, |message| format!(": {message}")),
            )
        })
        .collect()
}
