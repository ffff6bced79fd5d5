//! Error types for gatesync-core

use thiserror::Error;

/// Result type alias using gatesync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in gatesync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Storage-level failure that is not a `SQLite` error (e.g. poisoned lock)
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unique key already taken (e.g. an RFID tag)
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Version compare-and-set lost against a concurrent writer
    #[error("Version conflict on {table} record {id}: expected version {expected}")]
    VersionConflict {
        table: &'static str,
        id: i64,
        expected: i64,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Peer transport failure (timeout, unreachable, bad response)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    /// Transient failures are retried on the next sync cycle.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::VersionConflict { .. })
    }
}
