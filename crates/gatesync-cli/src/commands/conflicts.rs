use std::path::Path;

use gatesync_core::sync::ConflictResolution;

use crate::commands::common::{format_conflict_lines, open_node};
use crate::error::CliError;

pub fn run_conflicts_list(
    include_resolved: bool,
    limit: usize,
    as_json: bool,
    db_path: Option<&Path>,
) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let conflicts = node.resolver().list_conflicts(!include_resolved, limit)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_conflicts_resolve(
    id: i64,
    resolution: ConflictResolution,
    db_path: Option<&Path>,
) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let conflict = node.resolver().resolve_conflict(id, resolution)?;
    for line in format_conflict_lines(std::slice::from_ref(&conflict)) {
        println!("{line}");
    }
    Ok(())
}
