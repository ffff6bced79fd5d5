use std::path::Path;

use gatesync_core::access::ScanRequest;

use crate::commands::common::open_node;
use crate::error::CliError;

pub fn run_scan(
    rfid_tag: &str,
    booth_id: i64,
    device_id: Option<i64>,
    db_path: Option<&Path>,
) -> Result<(), CliError> {
    let node = open_node(db_path)?;
    let access = node.access().ok_or(CliError::NoGate)?;
    let response = access.process_scan(&ScanRequest {
        rfid_tag: rfid_tag.to_string(),
        gate_id: None,
        booth_id,
        device_id,
    })?;
    println!("{} {}", response.result.as_str(), response.message);
    Ok(())
}
