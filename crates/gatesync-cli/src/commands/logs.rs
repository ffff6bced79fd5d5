use std::path::Path;

use crate::commands::common::{format_log_lines, open_node};
use crate::error::CliError;

pub fn run_logs(limit: usize, as_json: bool, db_path: Option<&Path>) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let logs = node.logs(limit, 0)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&logs)?);
    } else {
        for line in format_log_lines(&logs) {
            println!("{line}");
        }
    }
    Ok(())
}
