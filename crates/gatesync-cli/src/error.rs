use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] gatesync_core::Error),
    #[error(transparent)]
    Config(#[from] gatesync_core::ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Node request failed: {0}")]
    Node(String),
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Nothing to update; pass at least one field")]
    EmptyUpdate,
    #[error("This node has no gate configured. Set GATESYNC_GATE_ID and GATESYNC_GATE_KIND.")]
    NoGate,
}
