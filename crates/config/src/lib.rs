//! Configuration schema and loaders for dkvs nodes.
//!
//! Node settings come from an optional YAML file with per-field
//! defaults; cluster membership comes from a plain-text file of
//! `<name> <host>:<port>` lines. Validation enforces the quorum
//! invariant `W + R > N` before the node is allowed to start.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod cluster;

pub use cluster::{node_id_for_name, parse_cluster_file, parse_cluster_str, PeerEntry};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique id of this node; must match an entry in the cluster file.
    #[serde(default = "default_node_id")]
    pub node_id: u32,

    /// TCP listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Cluster membership file.
    #[serde(default = "default_cluster_conf")]
    pub cluster_conf: PathBuf,

    /// Replication factor (N).
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,

    /// Write quorum (W).
    #[serde(default = "default_write_quorum")]
    pub write_quorum: u32,

    /// Read quorum (R).
    #[serde(default = "default_read_quorum")]
    pub read_quorum: u32,

    /// Virtual nodes per physical node.
    #[serde(default = "default_vnodes")]
    pub vnodes: u32,

    /// WAL directory.
    #[serde(default = "default_wal_dir")]
    pub wal_dir: PathBuf,

    /// Snapshot directory.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Hinted-handoff spool directory.
    #[serde(default = "default_hints_dir")]
    pub hints_dir: PathBuf,

    /// Local write attempts between snapshots.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// Max milliseconds between WAL fsyncs (0 disables the timer).
    #[serde(default = "default_fsync_interval_ms")]
    pub fsync_interval_ms: u32,

    /// WAL appends per forced fsync (0 disables op batching).
    #[serde(default = "default_fsync_batch_ops")]
    pub fsync_batch_ops: u32,

    /// Tokio worker threads.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: u32,

    /// Peer heartbeat period.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,

    /// Heartbeat misses tolerated before a peer is considered down,
    /// expressed as a timeout.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u32,

    /// Optional Prometheus scrape port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        // Round-trip through an empty mapping so defaults live in one place.
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

fn default_node_id() -> u32 {
    1
}
fn default_port() -> u16 {
    7001
}
fn default_cluster_conf() -> PathBuf {
    PathBuf::from("cluster.conf")
}
fn default_replication_factor() -> u32 {
    3
}
fn default_write_quorum() -> u32 {
    2
}
fn default_read_quorum() -> u32 {
    2
}
fn default_vnodes() -> u32 {
    128
}
fn default_wal_dir() -> PathBuf {
    PathBuf::from("./data/wal/")
}
fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./data/snapshots/")
}
fn default_hints_dir() -> PathBuf {
    PathBuf::from("./data/hints/")
}
fn default_snapshot_interval() -> u64 {
    100_000
}
fn default_fsync_interval_ms() -> u32 {
    10
}
fn default_fsync_batch_ops() -> u32 {
    100
}
fn default_worker_threads() -> u32 {
    4
}
fn default_heartbeat_interval_ms() -> u32 {
    1000
}
fn default_heartbeat_timeout_ms() -> u32 {
    5000
}

impl NodeConfig {
    /// Check internal consistency. The quorum invariant `W + R > N` is
    /// what makes reads observe the latest successful write; violating
    /// it is a startup error, not a runtime degradation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replication_factor == 0 {
            return Err(ConfigError::Invalid("replication_factor must be > 0".into()));
        }
        if self.write_quorum == 0 || self.write_quorum > self.replication_factor {
            return Err(ConfigError::Invalid(format!(
                "write_quorum ({}) must be in 1..=N ({})",
                self.write_quorum, self.replication_factor
            )));
        }
        if self.read_quorum == 0 || self.read_quorum > self.replication_factor {
            return Err(ConfigError::Invalid(format!(
                "read_quorum ({}) must be in 1..=N ({})",
                self.read_quorum, self.replication_factor
            )));
        }
        if self.write_quorum + self.read_quorum <= self.replication_factor {
            return Err(ConfigError::Invalid(format!(
                "quorum invariant violated: W({}) + R({}) must be > N({})",
                self.write_quorum, self.read_quorum, self.replication_factor
            )));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be > 0".into()));
        }
        Ok(())
    }
}

/// Load and validate a [`NodeConfig`] from a YAML file.
pub fn load_from_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load and validate a [`NodeConfig`] from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
