use std::path::Path;
use std::time::Duration;

use gatesync_core::sync::{parse_api_error, PeerSyncReport};

use crate::commands::common::resolve_node_url;
use crate::error::CliError;

const TRIGGER_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn run_sync_trigger(
    peer: Option<u32>,
    node_url: Option<String>,
    db_path: Option<&Path>,
) -> Result<(), CliError> {
    let base_url = resolve_node_url(node_url, db_path)?;
    let reports = request_trigger(&base_url, peer).await?;

    if reports.is_empty() {
        println!("No peers configured.");
    }
    for line in format_report_lines(&reports) {
        println!("{line}");
    }
    Ok(())
}

async fn request_trigger(base_url: &str, peer: Option<u32>) -> Result<Vec<PeerSyncReport>, CliError> {
    let client = reqwest::Client::builder()
        .timeout(TRIGGER_TIMEOUT)
        .build()
        .map_err(|error| CliError::Node(format!("failed to build HTTP client: {error}")))?;

    let mut request = client.post(format!("{base_url}/v1/sync/trigger"));
    if let Some(peer) = peer {
        request = request.query(&[("peer", peer)]);
    }
    let response = request
        .send()
        .await
        .map_err(|error| CliError::Node(format!("{base_url} unreachable: {error}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CliError::Node(parse_api_error(status, &body)));
    }
    response
        .json::<Vec<PeerSyncReport>>()
        .await
        .map_err(|error| CliError::Node(format!("unreadable trigger response: {error}")))
}

pub fn format_report_lines(reports: &[PeerSyncReport]) -> Vec<String> {
    reports
        .iter()
        .flat_map(|report| {
            report.tables.iter().map(move |table| match &table.error {
                Some(error) => format!("peer {} {}: FAILED {error}", report.peer, table.table),
                None => format!(
                    "peer {} {}: pulled {} (applied {}, conflicts {}), pushed {} (acked {})",
                    report.peer,
                    table.table,
                    table.pulled,
                    table.applied,
                    table.conflicts,
                    table.pushed,
                    table.acked,
                ),
            })
        })
        .collect()
}
