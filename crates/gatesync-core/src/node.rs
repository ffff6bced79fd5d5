//! A gate node: its configuration, store and sync components.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use crate::access::AccessController;
use crate::config::{ConfigError, NodeConfig, SyncTable};
use crate::db::{Database, LogRepository, UserRepository};
use crate::error::{Error, Result};
use crate::models::{AccessLog, User};
use crate::partition::IdPartitioner;
use crate::sync::{
    ApplyOutcome, ChangeQueue, ChangeRecorder, ConflictResolver, NodeInfo, PullRequest,
    PullResponse, PushRequest, PushResponse, SyncMetadataStore,
};
use crate::util::now_ms;

/// Everything one node needs, cheap to clone.
#[derive(Clone)]
pub struct GateNode {
    config: Arc<NodeConfig>,
    db: Database,
    partitioner: IdPartitioner,
    recorder: ChangeRecorder,
    resolver: ConflictResolver,
    queue: ChangeQueue,
    metadata: SyncMetadataStore,
}

impl GateNode {
    /// Open the node's database at `config.db_path`.
    ///
    /// Cycles left `IN_PROGRESS` by a previous run are marked `FAILED`.
    pub fn open(config: NodeConfig) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        let node = Self::with_database(config, db)?;
        node.metadata.reset_interrupted()?;
        Ok(node)
    }

    /// Open the database of a node that may be running in another process.
    ///
    /// Unlike [`GateNode::open`], in-progress cycles are left alone.
    pub fn attach(config: NodeConfig) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        Self::with_database(config, db)
    }

    pub fn open_in_memory(config: NodeConfig) -> Result<Self> {
        Self::with_database(config, Database::open_in_memory()?)
    }

    fn with_database(config: NodeConfig, db: Database) -> Result<Self> {
        config.validate()?;
        let partitioner = IdPartitioner::new(config.ordinal, config.node_count)?;
        check_identity(&db, &partitioner)?;

        let config = Arc::new(config);
        let recorder = ChangeRecorder::new(db.clone(), Arc::clone(&config))?;
        let resolver = ConflictResolver::new(db.clone(), Arc::clone(&config), recorder.clone());
        let queue = ChangeQueue::new(db.clone(), Arc::clone(&config));
        let metadata = SyncMetadataStore::new(db.clone());

        tracing::info!(
            ordinal = config.ordinal,
            node_count = config.node_count,
            peers = config.peers.len(),
            "Gate node ready"
        );
        Ok(Self {
            config,
            db,
            partitioner,
            recorder,
            resolver,
            queue,
            metadata,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub const fn partitioner(&self) -> &IdPartitioner {
        &self.partitioner
    }

    pub const fn recorder(&self) -> &ChangeRecorder {
        &self.recorder
    }

    pub const fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub const fn queue(&self) -> &ChangeQueue {
        &self.queue
    }

    pub const fn metadata(&self) -> &SyncMetadataStore {
        &self.metadata
    }

    /// Access decisions for this node's gate, if it is mounted at one.
    pub fn access(&self) -> Option<AccessController> {
        self.config
            .gate
            .map(|gate| AccessController::new(self.recorder.clone(), gate))
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            ordinal: self.config.ordinal,
            node_count: self.config.node_count,
            tables: self.config.sync_tables.clone(),
        }
    }

    pub fn user(&self, id: i64) -> Result<Option<User>> {
        self.db.read(|conn| UserRepository::new(conn).get(id))
    }

    pub fn user_by_tag(&self, rfid_tag: &str) -> Result<Option<User>> {
        self.db
            .read(|conn| UserRepository::new(conn).find_by_tag(rfid_tag))
    }

    pub fn users(&self, limit: usize, offset: usize) -> Result<Vec<User>> {
        self.db
            .read(|conn| UserRepository::new(conn).list(limit, offset))
    }

    pub fn log(&self, id: i64) -> Result<Option<AccessLog>> {
        self.db.read(|conn| LogRepository::new(conn).get(id))
    }

    pub fn logs(&self, limit: usize, offset: usize) -> Result<Vec<AccessLog>> {
        self.db
            .read(|conn| LogRepository::new(conn).list(limit, offset))
    }

    /// Answer a peer's pull.
    pub fn serve_pull(&self, request: &PullRequest) -> Result<PullResponse> {
        self.check_table(request.table)?;
        let limit = request.limit.clamp(1, self.config.batch_size);

        if self.config.peer(request.requester).is_some() {
            if self.queue.ack_through(request.table, request.requester, request.since)? > 0 {
                self.queue.finalize(request.table)?;
            }
        } else {
            tracing::warn!(
                requester = request.requester,
                "Pull from a node that is not a configured peer"
            );
        }

        let mut entries = self
            .queue
            .changes_since(request.table, request.since, limit + 1)?;
        let has_more = entries.len() > limit;
        entries.truncate(limit);

        let origin = self.config.ordinal;
        Ok(PullResponse {
            origin,
            entries: entries
                .iter()
                .map(|entry| entry.to_envelope(origin))
                .collect(),
            has_more,
        })
    }

    /// Apply a peer's push.
    ///
    /// Entries are applied in order; the first storage failure stops the
    /// batch, and everything from there on stays unacknowledged.
    pub fn serve_push(&self, request: &PushRequest) -> Result<PushResponse> {
        self.check_table(request.table)?;
        if self.config.peer(request.origin).is_none() {
            return Err(Error::InvalidInput(format!(
                "node {} is not a configured peer",
                request.origin
            )));
        }

        if self
            .queue
            .ack_through(request.table, request.origin, request.pull_cursor)?
            > 0
        {
            self.queue.finalize(request.table)?;
        }

        let mut response = PushResponse::default();
        for envelope in &request.entries {
            match self.resolver.apply_remote(request.origin, envelope) {
                Ok(outcome) => {
                    match outcome {
                        ApplyOutcome::Applied => response.applied += 1,
                        ApplyOutcome::Duplicate => response.duplicates += 1,
                        ApplyOutcome::Conflicted { .. } => response.conflicts += 1,
                        ApplyOutcome::Rejected(_) => response.rejected += 1,
                    }
                    response.acked.push(envelope.change_id);
                }
                Err(error) => {
                    tracing::error!(
                        origin = request.origin,
                        change_id = envelope.change_id,
                        "Failed to apply pushed change: {error}"
                    );
                    break;
                }
            }
        }

        self.metadata.record_received(request.origin, request.table)?;
        Ok(response)
    }

    fn check_table(&self, table: SyncTable) -> Result<()> {
        if self.config.syncs(table) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "table {table} is not synchronized by node {}",
                self.config.ordinal
            )))
        }
    }
}

/// Pin the database to the identity it was first opened with.
fn check_identity(db: &Database, partitioner: &IdPartitioner) -> Result<()> {
    db.write(|tx| {
        let stored: Option<(u32, u32)> = tx
            .query_row(
                "SELECT ordinal, node_count FROM node_identity WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match stored {
            Some((ordinal, node_count))
                if ordinal == partitioner.ordinal() && node_count == partitioner.node_count() =>
            {
                Ok(())
            }
            Some((ordinal, node_count)) => Err(ConfigError::Invalid(format!(
                "database belongs to node {ordinal} of {node_count}, not node {} of {}",
                partitioner.ordinal(),
                partitioner.node_count()
            ))
            .into()),
            None => {
                tx.execute(
                    "INSERT INTO node_identity (id, ordinal, node_count, created_at)
                     VALUES (1, ?1, ?2, ?3)",
                    params![partitioner.ordinal(), partitioner.node_count(), now_ms()],
                )?;
                Ok(())
            }
        }
    })
}
