//! Node configuration
//!
//! `NodeConfig` is what operators write (TOML). `RaftConfig` is the timing
//! subset the protocol engine runs with.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::log::NodeId;

/// Configuration for protocol timing parameters
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by leader (default: 150ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms)
    pub election_timeout_max: Duration,
    /// Number of applied log entries before triggering automatic snapshot (default: 1000)
    /// Set to 0 to disable automatic snapshots
    pub snapshot_threshold: u64,
    /// Upper bound on entries carried by one AppendEntries (default: 64)
    pub max_entries_per_append: usize,
    /// Per-RPC timeout used by network transports (default: 250ms).
    /// Must not exceed `election_timeout_max`, after which a request is presumed lost
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            snapshot_threshold: 1000,
            max_entries_per_append: 64,
            rpc_timeout: Duration::from_millis(250),
        }
    }
}

impl RaftConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Set to 0 to disable automatic snapshots
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_max_entries_per_append(mut self, max: usize) -> Self {
        self.max_entries_per_append = max;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms.max(min_ms));
        Duration::from_millis(timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A cluster member other than this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// On-disk node configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub peers: Vec<PeerConfig>,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub snapshot_threshold: u64,
    pub max_entries_per_append: usize,
    pub rpc_timeout_ms: u64,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let raft = RaftConfig::default();
        NodeConfig {
            node_id: 1,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7001)),
            data_dir: PathBuf::from("data"),
            peers: Vec::new(),
            heartbeat_interval_ms: raft.heartbeat_interval.as_millis() as u64,
            election_timeout_min_ms: raft.election_timeout_min.as_millis() as u64,
            election_timeout_max_ms: raft.election_timeout_max.as_millis() as u64,
            snapshot_threshold: raft.snapshot_threshold,
            max_entries_per_append: raft.max_entries_per_append,
            rpc_timeout_ms: raft.rpc_timeout.as_millis() as u64,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == self.node_id {
                return Err(ConfigError::Invalid(format!(
                    "node {} lists itself as a peer",
                    self.node_id
                )));
            }
            if !seen.insert(peer.id) {
                return Err(ConfigError::Invalid(format!("duplicate peer id {}", peer.id)));
            }
        }
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConfigError::Invalid(format!(
                "election_timeout_min_ms ({}) must be below election_timeout_max_ms ({})",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_ms ({}) must be positive and below election_timeout_min_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::Invalid("max_entries_per_append must be positive".to_string()));
        }
        if self.rpc_timeout_ms == 0 || self.rpc_timeout_ms > self.election_timeout_max_ms {
            return Err(ConfigError::Invalid(format!(
                "rpc_timeout_ms ({}) must be positive and at most election_timeout_max_ms ({})",
                self.rpc_timeout_ms, self.election_timeout_max_ms
            )));
        }
        Ok(())
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(self.heartbeat_interval_ms))
            .with_election_timeout(
                Duration::from_millis(self.election_timeout_min_ms),
                Duration::from_millis(self.election_timeout_max_ms),
            )
            .with_snapshot_threshold(self.snapshot_threshold)
            .with_max_entries_per_append(self.max_entries_per_append)
            .with_rpc_timeout(Duration::from_millis(self.rpc_timeout_ms))
    }
}
