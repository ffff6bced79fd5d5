//! Node configuration.
//!
//! Every component receives the node it runs as through `NodeConfig`; there is
//! no ambient "current node" state. Values come from `GATESYNC_*` environment
//! variables (see `NodeConfig::from_env`) or are built programmatically.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::GateKind;
use crate::partition::MAX_NODES;
use crate::util::is_http_url;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_DB_PATH: &str = "gatesync.db";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;
const DEFAULT_PEER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BATCH_SIZE: usize = 200;
const DEFAULT_QUEUE_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A table that takes part in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTable {
    Users,
    Logs,
}

impl SyncTable {
    pub const ALL: [Self; 2] = [Self::Users, Self::Logs];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTable {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "users" => Ok(Self::Users),
            "logs" => Ok(Self::Logs),
            other => Err(ConfigError::Invalid(format!("unknown sync table '{other}'"))),
        }
    }
}

/// How an `UPDATE_CONFLICT` is settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Later `updated_at` wins; equal timestamps go to the lower ordinal.
    #[default]
    LastWriterWins,
    /// Keep local content and leave the conflict open for an operator.
    Manual,
}

impl FromStr for ConflictPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lww" | "last_writer_wins" => Ok(Self::LastWriterWins),
            "manual" => Ok(Self::Manual),
            other => Err(ConfigError::Invalid(format!(
                "GATESYNC_CONFLICT_POLICY must be 'lww' or 'manual', got '{other}'"
            ))),
        }
    }
}

/// A peer node and the base URL of its HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub ordinal: u32,
    pub url: String,
}

impl FromStr for PeerConfig {
    type Err = ConfigError;

    /// Parses `ordinal@http://host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ordinal, url) = s.trim().split_once('@').ok_or_else(|| {
            ConfigError::Invalid(format!("peer '{s}' must look like 'ordinal@http://host:port'"))
        })?;
        let ordinal = ordinal
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::Invalid(format!("peer '{s}' has a non-numeric ordinal")))?;
        let url = url.trim().trim_end_matches('/').to_string();
        if !is_http_url(&url) {
            return Err(ConfigError::Invalid(format!(
                "peer '{s}' URL must start with http:// or https://"
            )));
        }
        Ok(Self { ordinal, url })
    }
}

/// Gate this node is mounted at, used by access decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub gate_id: i64,
    pub kind: GateKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub ordinal: u32,
    pub node_count: u32,
    pub peers: Vec<PeerConfig>,
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub sync_interval: Duration,
    pub sync_tables: Vec<SyncTable>,
    pub peer_timeout: Duration,
    pub batch_size: usize,
    pub conflict_policy: ConflictPolicy,
    pub queue_retention: Duration,
    pub gate: Option<GateConfig>,
}

impl NodeConfig {
    /// Build a config with defaults for everything but the node identity.
    pub fn new(ordinal: u32, node_count: u32) -> Result<Self, ConfigError> {
        let config = Self {
            ordinal,
            node_count,
            peers: Vec::new(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            sync_tables: SyncTable::ALL.to_vec(),
            peer_timeout: Duration::from_secs(DEFAULT_PEER_TIMEOUT_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            conflict_policy: ConflictPolicy::default(),
            queue_retention: Duration::from_secs(DEFAULT_QUEUE_RETENTION_SECS),
            gate: None,
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_peers(mut self, peers: Vec<PeerConfig>) -> Self {
        self.peers = peers;
        self
    }

    #[must_use]
    pub const fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let ordinal = parse_required::<u32>(&lookup, "GATESYNC_NODE_ORDINAL")?;
        let node_count = parse_required::<u32>(&lookup, "GATESYNC_NODE_COUNT")?;

        let peers = optional_trimmed(&lookup, "GATESYNC_PEERS")
            .map(|raw| {
                raw.split(',')
                    .filter(|item| !item.trim().is_empty())
                    .map(str::parse::<PeerConfig>)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let sync_interval_secs = parse_in_range(
            &lookup,
            "GATESYNC_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
            1..=3_600,
        )?;
        let peer_timeout_secs = parse_in_range(
            &lookup,
            "GATESYNC_PEER_TIMEOUT_SECS",
            DEFAULT_PEER_TIMEOUT_SECS,
            1..=300,
        )?;
        let batch_size = parse_in_range(
            &lookup,
            "GATESYNC_BATCH_SIZE",
            DEFAULT_BATCH_SIZE as u64,
            1..=10_000,
        )?;
        let queue_retention_secs = parse_in_range(
            &lookup,
            "GATESYNC_QUEUE_RETENTION_SECS",
            DEFAULT_QUEUE_RETENTION_SECS,
            60..=365 * 24 * 60 * 60,
        )?;

        let sync_tables = match optional_trimmed(&lookup, "GATESYNC_SYNC_TABLES") {
            Some(raw) => raw
                .split(',')
                .filter(|item| !item.trim().is_empty())
                .map(str::parse::<SyncTable>)
                .collect::<Result<Vec<_>, _>>()?,
            None => SyncTable::ALL.to_vec(),
        };

        let conflict_policy = optional_trimmed(&lookup, "GATESYNC_CONFLICT_POLICY")
            .map(|raw| raw.parse::<ConflictPolicy>())
            .transpose()?
            .unwrap_or_default();

        let gate = match optional_trimmed(&lookup, "GATESYNC_GATE_ID") {
            Some(raw_id) => {
                let gate_id = raw_id.parse::<i64>().map_err(|_| {
                    ConfigError::Invalid("GATESYNC_GATE_ID must be an integer".to_string())
                })?;
                let kind = required_trimmed(&lookup, "GATESYNC_GATE_KIND")?
                    .parse::<GateKind>()
                    .map_err(|error| ConfigError::Invalid(error.to_string()))?;
                Some(GateConfig { gate_id, kind })
            }
            None => None,
        };

        let config = Self {
            ordinal,
            node_count,
            peers,
            bind_addr: value_or_default(&lookup, "GATESYNC_BIND_ADDR", DEFAULT_BIND_ADDR),
            db_path: PathBuf::from(value_or_default(
                &lookup,
                "GATESYNC_DB_PATH",
                DEFAULT_DB_PATH,
            )),
            sync_interval: Duration::from_secs(sync_interval_secs),
            sync_tables,
            peer_timeout: Duration::from_secs(peer_timeout_secs),
            batch_size: usize::try_from(batch_size).unwrap_or(DEFAULT_BATCH_SIZE),
            conflict_policy,
            queue_retention: Duration::from_secs(queue_retention_secs),
            gate,
        };
        config.validate()?;
        Ok(config)
    }

    /// Static checks on the node identity and peer list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count == 0 || self.node_count > MAX_NODES {
            return Err(ConfigError::Invalid(format!(
                "node count must be in [1, {MAX_NODES}], got {}",
                self.node_count
            )));
        }
        if self.ordinal == 0 || self.ordinal > self.node_count {
            return Err(ConfigError::Invalid(format!(
                "node ordinal must be in [1, {}], got {}",
                self.node_count, self.ordinal
            )));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.ordinal == self.ordinal {
                return Err(ConfigError::Invalid(format!(
                    "peer {} claims this node's own ordinal",
                    peer.url
                )));
            }
            if peer.ordinal == 0 || peer.ordinal > self.node_count {
                return Err(ConfigError::Invalid(format!(
                    "peer ordinal {} is outside [1, {}]",
                    peer.ordinal, self.node_count
                )));
            }
            if !seen.insert(peer.ordinal) {
                return Err(ConfigError::Invalid(format!(
                    "peer ordinal {} is listed more than once",
                    peer.ordinal
                )));
            }
        }

        if self.sync_tables.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one table must be synchronized".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn syncs(&self, table: SyncTable) -> bool {
        self.sync_tables.contains(&table)
    }

    pub fn peer(&self, ordinal: u32) -> Option<&PeerConfig> {
        self.peers.iter().find(|peer| peer.ordinal == ordinal)
    }

    pub fn peer_ordinals(&self) -> Vec<u32> {
        self.peers.iter().map(|peer| peer.ordinal).collect()
    }
}

fn parse_required<T: FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<T, ConfigError> {
    required_trimmed(lookup, name)?
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(format!("{name} must be a positive integer")))
}

fn parse_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn from_map(map: &HashMap<&str, &str>) -> Result<NodeConfig, ConfigError> {
        NodeConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_node_identity() {
        let map = HashMap::new();
        let err = from_map(&map).unwrap_err();
        assert_eq!(err, ConfigError::MissingVar("GATESYNC_NODE_ORDINAL"));
    }

    #[test]
    fn config_parses_peers_and_defaults() {
        let mut map = HashMap::new();
        map.insert("GATESYNC_NODE_ORDINAL", "1");
        map.insert("GATESYNC_NODE_COUNT", "3");
        map.insert(
            "GATESYNC_PEERS",
            "2@http://10.0.0.2:8080/, 3@http://10.0.0.3:8080",
        );

        let config = from_map(&map).unwrap();
        assert_eq!(
            config.peers,
            vec![
                PeerConfig {
                    ordinal: 2,
                    url: "http://10.0.0.2:8080".to_string()
                },
                PeerConfig {
                    ordinal: 3,
                    url: "http://10.0.0.3:8080".to_string()
                },
            ]
        );
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        assert_eq!(config.sync_tables, vec![SyncTable::Users, SyncTable::Logs]);
        assert_eq!(config.conflict_policy, ConflictPolicy::LastWriterWins);
        assert!(config.gate.is_none());
    }

    #[test]
    fn config_rejects_ordinal_outside_node_count() {
        let mut map = HashMap::new();
        map.insert("GATESYNC_NODE_ORDINAL", "3");
        map.insert("GATESYNC_NODE_COUNT", "2");
        let err = from_map(&map).unwrap_err();
        assert!(err.to_string().contains("ordinal"));
    }

    #[test]
    fn config_rejects_peer_with_own_ordinal() {
        let mut map = HashMap::new();
        map.insert("GATESYNC_NODE_ORDINAL", "1");
        map.insert("GATESYNC_NODE_COUNT", "2");
        map.insert("GATESYNC_PEERS", "1@http://10.0.0.2:8080");
        let err = from_map(&map).unwrap_err();
        assert!(err.to_string().contains("own ordinal"));
    }

    #[test]
    fn config_parses_table_subset_and_policy() {
        let mut map = HashMap::new();
        map.insert("GATESYNC_NODE_ORDINAL", "2");
        map.insert("GATESYNC_NODE_COUNT", "2");
        map.insert("GATESYNC_SYNC_TABLES", "logs");
        map.insert("GATESYNC_CONFLICT_POLICY", "manual");
        map.insert("GATESYNC_GATE_ID", "4");
        map.insert("GATESYNC_GATE_KIND", "VIP");

        let config = from_map(&map).unwrap();
        assert!(config.syncs(SyncTable::Logs));
        assert!(!config.syncs(SyncTable::Users));
        assert_eq!(config.conflict_policy, ConflictPolicy::Manual);
        assert_eq!(
            config.gate,
            Some(GateConfig {
                gate_id: 4,
                kind: GateKind::Vip
            })
        );
    }

    #[test]
    fn config_rejects_out_of_range_interval() {
        let mut map = HashMap::new();
        map.insert("GATESYNC_NODE_ORDINAL", "1");
        map.insert("GATESYNC_NODE_COUNT", "2");
        map.insert("GATESYNC_SYNC_INTERVAL_SECS", "0");
        let err = from_map(&map).unwrap_err();
        assert!(err.to_string().contains("GATESYNC_SYNC_INTERVAL_SECS"));
    }

    #[test]
    fn peer_parse_requires_scheme() {
        assert!("2@10.0.0.2:8080".parse::<PeerConfig>().is_err());
        assert!("two@http://10.0.0.2:8080".parse::<PeerConfig>().is_err());
    }
}
