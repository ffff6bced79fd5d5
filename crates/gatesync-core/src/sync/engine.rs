//! Pull-apply-push cycles against every peer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use super::conflict::ApplyOutcome;
use super::metadata::SyncMetadataStore;
use super::transport::{PeerTransport, PullRequest, PushRequest};
use crate::config::{ConfigError, PeerConfig, SyncTable};
use crate::error::{Error, Result};
use crate::models::{ChangeEnvelope, SyncOutcome};
use crate::node::GateNode;
use crate::util::now_ms;

/// Counters for one (peer, table) cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSyncReport {
    pub table: SyncTable,
    pub pulled: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub conflicts: usize,
    pub rejected: usize,
    pub pushed: usize,
    pub acked: usize,
    pub error: Option<String>,
}

impl TableSyncReport {
    const fn new(table: SyncTable) -> Self {
        Self {
            table,
            pulled: 0,
            applied: 0,
            duplicates: 0,
            conflicts: 0,
            rejected: 0,
            pushed: 0,
            acked: 0,
            error: None,
        }
    }

    const fn moved_anything(&self) -> bool {
        self.pulled > 0 || self.pushed > 0
    }

    fn count(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Duplicate => self.duplicates += 1,
            ApplyOutcome::Conflicted { .. } => self.conflicts += 1,
            ApplyOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSyncReport {
    pub peer: u32,
    pub tables: Vec<TableSyncReport>,
}

impl PeerSyncReport {
    pub fn is_success(&self) -> bool {
        self.tables.iter().all(|table| table.error.is_none())
    }
}

/// Marks a cycle `FAILED` if it is dropped before recording its outcome.
struct InProgressGuard {
    metadata: SyncMetadataStore,
    peer: u32,
    table: SyncTable,
    armed: bool,
}

impl InProgressGuard {
    const fn new(metadata: SyncMetadataStore, peer: u32, table: SyncTable) -> Self {
        Self {
            metadata,
            peer,
            table,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let outcome = SyncOutcome::Failed("sync cycle cancelled".to_string());
        if let Err(error) = self.metadata.record_attempt(self.peer, self.table, &outcome) {
            tracing::error!(
                peer = self.peer,
                table = %self.table,
                "Failed to record cancelled sync cycle: {error}"
            );
        }
    }
}

pub struct SyncEngine<T> {
    node: GateNode,
    transport: T,
    peer_locks: HashMap<u32, Mutex<()>>,
}

impl<T: PeerTransport + 'static> SyncEngine<T> {
    pub fn new(node: GateNode, transport: T) -> Self {
        let peer_locks = node
            .config()
            .peer_ordinals()
            .into_iter()
            .map(|ordinal| (ordinal, Mutex::new(())))
            .collect();
        Self {
            node,
            transport,
            peer_locks,
        }
    }

    pub const fn node(&self) -> &GateNode {
        &self.node
    }

    /// Check every reachable peer's identity against ours.
    ///
    /// A peer claiming our ordinal, another cluster size, or an ordinal other
    /// than the one configured for it is fatal. Unreachable peers are skipped.
    pub async fn bootstrap(&self) -> Result<()> {
        let config = self.node.config();
        for peer in &config.peers {
            let info = match self.transport.node_info(peer).await {
                Ok(info) => info,
                Err(error) => {
                    tracing::warn!(
                        peer = peer.ordinal,
                        url = %peer.url,
                        "Peer unreachable during bootstrap: {error}"
                    );
                    continue;
                }
            };

            if info.ordinal == config.ordinal {
                return Err(ConfigError::Invalid(format!(
                    "peer at {} also claims ordinal {}",
                    peer.url, info.ordinal
                ))
                .into());
            }
            if info.ordinal != peer.ordinal {
                return Err(ConfigError::Invalid(format!(
                    "peer at {} reports ordinal {} but is configured as {}",
                    peer.url, info.ordinal, peer.ordinal
                ))
                .into());
            }
            if info.node_count != config.node_count {
                return Err(ConfigError::Invalid(format!(
                    "peer {} runs a {}-node cluster, this node expects {}",
                    peer.ordinal, info.node_count, config.node_count
                ))
                .into());
            }
            tracing::info!(peer = peer.ordinal, url = %peer.url, "Peer identity confirmed");
        }
        Ok(())
    }

    /// One cycle against `peer` for every participating table.
    ///
    /// Waits if a cycle against the same peer is already running.
    pub async fn run_cycle(&self, peer: u32) -> Result<PeerSyncReport> {
        let config = self.node.config();
        let (Some(peer_config), Some(lock)) = (config.peer(peer), self.peer_locks.get(&peer)) else {
            return Err(Error::NotFound(format!("peer {peer}")));
        };
        let _running = lock.lock().await;

        let mut tables = Vec::with_capacity(config.sync_tables.len());
        for table in &config.sync_tables {
            tables.push(self.sync_table(peer_config, *table).await);
        }
        Ok(PeerSyncReport { peer, tables })
    }

    /// Cycles against every peer, concurrently.
    pub async fn run_all(self: &Arc<Self>) -> Vec<PeerSyncReport> {
        let mut tasks = JoinSet::new();
        for peer in self.node.config().peer_ordinals() {
            let engine = Arc::clone(self);
            tasks.spawn(async move { engine.run_cycle(peer).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(error)) => tracing::warn!("Sync cycle could not start: {error}"),
                Err(error) => tracing::error!("Sync task failed: {error}"),
            }
        }
        reports.sort_by_key(|report| report.peer);

        self.housekeeping();
        reports
    }

    /// Out-of-schedule cycle for one peer, or all of them.
    pub async fn trigger(self: &Arc<Self>, peer: Option<u32>) -> Result<Vec<PeerSyncReport>> {
        match peer {
            Some(peer) => {
                let report = self.run_cycle(peer).await?;
                self.housekeeping();
                Ok(vec![report])
            }
            None => Ok(self.run_all().await),
        }
    }

    /// Run cycles every `sync_interval` until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()> + Send) {
        let mut interval = tokio::time::interval(self.node.config().sync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            interval_secs = self.node.config().sync_interval.as_secs(),
            peers = self.peer_locks.len(),
            "Sync scheduler started"
        );
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                () = &mut shutdown => break,
                reports = self.run_all() => {
                    let failed = reports.iter().filter(|report| !report.is_success()).count();
                    if failed > 0 {
                        tracing::debug!(failed, total = reports.len(), "Sync round finished with failures");
                    }
                }
            }
        }
        tracing::info!("Sync scheduler stopped");
    }

    async fn sync_table(&self, peer: &PeerConfig, table: SyncTable) -> TableSyncReport {
        let metadata = self.node.metadata();
        let mut report = TableSyncReport::new(table);

        if let Err(error) = metadata.mark_in_progress(peer.ordinal, table) {
            tracing::error!(peer = peer.ordinal, table = %table, "Cannot start sync cycle: {error}");
            report.error = Some(error.to_string());
            return report;
        }
        let mut guard = InProgressGuard::new(metadata.clone(), peer.ordinal, table);

        // a failed pull does not keep our own changes from going out
        let pulled = self.pull_table(peer, table, &mut report).await;
        let pushed = self.push_table(peer, table, &mut report).await;

        let outcome = match (pulled, pushed) {
            (Ok(()), Ok(())) => SyncOutcome::Success,
            (Err(error), Ok(())) => SyncOutcome::Failed(format!("pull: {error}")),
            (Ok(()), Err(error)) => SyncOutcome::Failed(format!("push: {error}")),
            (Err(pull), Err(push)) => SyncOutcome::Failed(format!("pull: {pull}; push: {push}")),
        };

        match metadata.record_attempt(peer.ordinal, table, &outcome) {
            Ok(()) => guard.disarm(),
            Err(error) => {
                tracing::error!(peer = peer.ordinal, table = %table, "Failed to record sync outcome: {error}");
            }
        }

        match outcome {
            SyncOutcome::Success if report.moved_anything() => tracing::info!(
                peer = peer.ordinal,
                table = %table,
                pulled = report.pulled,
                applied = report.applied,
                conflicts = report.conflicts,
                pushed = report.pushed,
                acked = report.acked,
                "Sync cycle complete"
            ),
            SyncOutcome::Success => {
                tracing::debug!(peer = peer.ordinal, table = %table, "Sync cycle complete, nothing to do");
            }
            SyncOutcome::Failed(message) => {
                tracing::warn!(peer = peer.ordinal, table = %table, "Sync cycle failed: {message}");
                report.error = Some(message);
            }
        }
        report
    }

    async fn pull_table(
        &self,
        peer: &PeerConfig,
        table: SyncTable,
        report: &mut TableSyncReport,
    ) -> Result<()> {
        let config = self.node.config();
        let metadata = self.node.metadata();
        let mut cursor = metadata.pull_cursor(peer.ordinal, table)?;

        loop {
            let request = PullRequest {
                table,
                since: cursor,
                requester: config.ordinal,
                limit: config.batch_size,
            };
            let response = self.transport.pull(peer, &request).await?;
            if response.origin != peer.ordinal {
                return Err(Error::Transport(format!(
                    "peer at {} answered as node {}",
                    peer.url, response.origin
                )));
            }
            if response.entries.is_empty() {
                return Ok(());
            }
            let has_more = response.has_more;

            let mut entries = response.entries;
            entries.sort_by_key(|entry| (entry.created_at, entry.change_id));
            report.pulled += entries.len();

            let (next_cursor, failure) = self.apply_batch(peer.ordinal, table, &entries, cursor, report);
            if next_cursor > cursor {
                metadata.set_pull_cursor(peer.ordinal, table, next_cursor)?;
                cursor = next_cursor;
            }
            if let Some(error) = failure {
                return Err(error);
            }
            if !has_more {
                return Ok(());
            }
        }
    }

    /// Apply `entries` in order and work out the new cursor.
    ///
    /// On a storage failure the cursor stops below the first change that was
    /// not applied; anything past it that did apply is a ledger hit next time.
    fn apply_batch(
        &self,
        peer: u32,
        table: SyncTable,
        entries: &[ChangeEnvelope],
        cursor: i64,
        report: &mut TableSyncReport,
    ) -> (i64, Option<Error>) {
        for (index, envelope) in entries.iter().enumerate() {
            let result = if envelope.table == table {
                self.node.resolver().apply_remote(peer, envelope)
            } else {
                Ok(ApplyOutcome::Rejected(format!(
                    "change {} is for {}, expected {table}",
                    envelope.change_id, envelope.table
                )))
            };

            match result {
                Ok(outcome) => report.count(&outcome),
                Err(error) => {
                    tracing::error!(
                        peer,
                        table = %table,
                        change_id = envelope.change_id,
                        "Failed to apply pulled change: {error}"
                    );
                    let first_unapplied = entries[index..]
                        .iter()
                        .map(|entry| entry.change_id)
                        .min()
                        .unwrap_or(cursor + 1);
                    return ((first_unapplied - 1).max(cursor), Some(error));
                }
            }
        }

        let highest = entries
            .iter()
            .map(|entry| entry.change_id)
            .max()
            .unwrap_or(cursor);
        (highest.max(cursor), None)
    }

    async fn push_table(
        &self,
        peer: &PeerConfig,
        table: SyncTable,
        report: &mut TableSyncReport,
    ) -> Result<()> {
        let config = self.node.config();
        let queue = self.node.queue();

        loop {
            let pending = queue.pending_for_peer(table, peer.ordinal, config.batch_size)?;
            if pending.is_empty() {
                break;
            }
            let sent: Vec<i64> = pending.iter().map(|entry| entry.id).collect();
            let request = PushRequest {
                origin: config.ordinal,
                table,
                pull_cursor: self.node.metadata().pull_cursor(peer.ordinal, table)?,
                entries: pending
                    .iter()
                    .map(|entry| entry.to_envelope(config.ordinal))
                    .collect(),
            };

            let response = self.transport.push(peer, &request).await?;
            let acked: Vec<i64> = response
                .acked
                .into_iter()
                .filter(|id| sent.contains(id))
                .collect();
            queue.record_acks(peer.ordinal, &acked)?;
            report.pushed += sent.len();
            report.acked += acked.len();

            if acked.len() < sent.len() {
                queue.finalize(table)?;
                return Err(Error::Transport(format!(
                    "peer {} left {} of {} changes unacknowledged",
                    peer.ordinal,
                    sent.len() - acked.len(),
                    sent.len()
                )));
            }
        }

        queue.finalize(table)?;
        Ok(())
    }

    /// Finalize acknowledged entries and prune old ones.
    fn housekeeping(&self) {
        let queue = self.node.queue();
        for table in &self.node.config().sync_tables {
            if let Err(error) = queue.finalize(*table) {
                tracing::warn!(table = %table, "Failed to finalize change queue: {error}");
            }
        }
        let now = now_ms();
        if let Err(error) = queue.prune(now) {
            tracing::warn!("Failed to prune change queue: {error}");
        }
        if let Err(error) = self.node.resolver().prune_ledger(now) {
            tracing::warn!("Failed to prune applied-change ledger: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::NodeConfig;
    use crate::db::Database;
    use crate::models::SyncStatus;
    use crate::sync::{NodeInfo, PullResponse, PushResponse};

    /// A peer that accepts connections and never answers.
    struct Stalled;

    impl PeerTransport for Stalled {
        async fn node_info(&self, _peer: &PeerConfig) -> Result<NodeInfo> {
            std::future::pending().await
        }

        async fn pull(&self, _peer: &PeerConfig, _request: &PullRequest) -> Result<PullResponse> {
            std::future::pending().await
        }

        async fn push(&self, _peer: &PeerConfig, _request: &PushRequest) -> Result<PushResponse> {
            std::future::pending().await
        }
    }

    #[test]
    fn dropped_guard_marks_cycle_failed() {
        let metadata = SyncMetadataStore::new(Database::open_in_memory().unwrap());
        metadata.mark_in_progress(2, SyncTable::Users).unwrap();
        drop(InProgressGuard::new(metadata.clone(), 2, SyncTable::Users));

        let row = metadata.status(2, SyncTable::Users).unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("sync cycle cancelled"));
    }

    #[test]
    fn disarmed_guard_keeps_recorded_outcome() {
        let metadata = SyncMetadataStore::new(Database::open_in_memory().unwrap());
        metadata.mark_in_progress(2, SyncTable::Logs).unwrap();
        let mut guard = InProgressGuard::new(metadata.clone(), 2, SyncTable::Logs);
        metadata
            .record_attempt(2, SyncTable::Logs, &SyncOutcome::Success)
            .unwrap();
        guard.disarm();
        drop(guard);

        let row = metadata.status(2, SyncTable::Logs).unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn aborted_cycle_is_left_failed_not_in_progress() {
        let config = NodeConfig::new(1, 2).unwrap().with_peers(vec![PeerConfig {
            ordinal: 2,
            url: "http://node-2:8080".to_string(),
        }]);
        let engine = Arc::new(SyncEngine::new(
            GateNode::open_in_memory(config).unwrap(),
            Stalled,
        ));

        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.trigger(Some(2)).await }
        });

        let metadata = engine.node().metadata().clone();
        for _ in 0..200 {
            let status = metadata.status(2, SyncTable::Users).unwrap();
            if status.is_some_and(|row| row.status == SyncStatus::InProgress) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let row = metadata.status(2, SyncTable::Users).unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("sync cycle cancelled"));
    }

    #[test]
    fn report_counts_each_outcome() {
        let mut report = TableSyncReport::new(SyncTable::Users);
        report.count(&ApplyOutcome::Applied);
        report.count(&ApplyOutcome::Duplicate);
        report.count(&ApplyOutcome::Conflicted {
            conflict_id: 1,
            resolved: true,
        });
        report.count(&ApplyOutcome::Rejected("bad".to_string()));
        assert_eq!(
            (report.applied, report.duplicates, report.conflicts, report.rejected),
            (1, 1, 1, 1)
        );
        assert!(!report.moved_anything());
    }
}
