//! gatesync-core - Core library for gatesync
//!
//! This crate contains the models, storage layer, identity partitioning and
//! the multi-node sync engine shared by the node daemon and the operator CLI.

pub mod access;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod node;
pub mod partition;
pub mod sync;
pub mod util;

pub use config::{ConfigError, NodeConfig};
pub use error::{Error, Result};
pub use node::GateNode;
