//! Multi-node synchronization.
//!
//! Local writes go through the [`ChangeRecorder`], which appends a
//! change-queue entry in the same transaction. The [`SyncEngine`] ships queued
//! entries to every peer and pulls theirs; incoming changes are applied by the
//! [`ConflictResolver`], and each (peer, table) pair's progress is kept by the
//! [`SyncMetadataStore`].

mod conflict;
mod engine;
mod metadata;
mod queue;
mod recorder;
mod transport;

#[cfg(test)]
mod tests;

pub use conflict::{ApplyOutcome, ConflictResolution, ConflictResolver};
pub use engine::{PeerSyncReport, SyncEngine, TableSyncReport};
pub use metadata::SyncMetadataStore;
pub use queue::ChangeQueue;
pub use recorder::{ChangeRecorder, ImportSummary, RecordingTx};
pub use transport::{
    parse_api_error, HttpTransport, NodeInfo, PeerTransport, PullRequest, PullResponse,
    PushRequest, PushResponse,
};
