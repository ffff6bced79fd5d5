use std::path::Path;

use crate::commands::common::{format_status_lines, open_node};
use crate::error::CliError;

pub fn run_status(as_json: bool, db_path: Option<&Path>) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let rows = node.metadata().list_status()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let config = node.config();
    println!(
        "node {} of {}, {} peer(s)",
        config.ordinal,
        config.node_count,
        config.peers.len()
    );
    for table in &config.sync_tables {
        println!("{table}: {} change(s) pending", node.queue().pending_count(*table)?);
    }
    if rows.is_empty() {
        println!("No sync cycles recorded yet.");
    }
    for line in format_status_lines(&rows) {
        println!("{line}");
    }
    Ok(())
}
