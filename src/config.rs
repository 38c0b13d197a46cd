//! Configuration loading and types for a bleepraft node.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Each subsection governs a different part of the
//! system: node identity, peer transport, consensus timing, persistence,
//! the admin API, and logging.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Node identity and peer transport settings.
    #[serde(default)]
    pub node: NodeConfig,

    /// Consensus timing and batching settings.
    #[serde(default)]
    pub raft: RaftConfig,

    /// Persistence settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Admin API settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity and peer transport listener.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this node within the cluster.
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Bind address for the peer transport (host:port).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            listen_addr: default_listen_addr(),
        }
    }
}

/// Consensus timing and batching.
#[derive(Debug, Clone, Deserialize)]
pub struct RaftConfig {
    /// Base election timeout in milliseconds (candidate loop).
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Base follower timeout in milliseconds. A follower that hears nothing
    /// for this long (plus the random offset) becomes a candidate.
    #[serde(default = "default_follower_timeout_ms")]
    pub follower_timeout_ms: u64,

    /// Interval between leader replication rounds in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Upper bound on the random timer offset, as a ratio of the base
    /// timeout. A timer armed with base `t` fires in `[t, t*(1+ratio)]`.
    #[serde(default = "default_timer_random_ratio")]
    pub timer_random_ratio: f64,

    /// Trigger a snapshot once this many entries have been applied past the
    /// newest snapshot.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Maximum entries shipped in one AppendEntries batch.
    #[serde(default = "default_max_append_batch")]
    pub max_append_batch: u64,

    /// Per-call transport deadline in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Whether a node starting with an empty log appends a configuration
    /// holding only itself. Disable on nodes meant to join an existing
    /// cluster; they wait as blank followers until the leader contacts them.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: default_election_timeout_ms(),
            follower_timeout_ms: default_follower_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            timer_random_ratio: default_timer_random_ratio(),
            snapshot_threshold: default_snapshot_threshold(),
            max_append_batch: default_max_append_batch(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            bootstrap: default_bootstrap(),
        }
    }
}

impl RaftConfig {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn follower_timeout(&self) -> Duration {
        Duration::from_millis(self.follower_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Engine for the log and stable stores: `sqlite` or `memory`.
    #[serde(default = "default_storage_engine")]
    pub engine: String,

    /// Directory holding the SQLite database and snapshot files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: default_storage_engine(),
            data_dir: default_data_dir(),
        }
    }
}

/// Admin API settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiConfig {
    /// Bind address for the admin HTTP surface. Disabled when unset.
    pub listen_addr: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// -- Defaults -----------------------------------------------------------------

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:9101".to_string()
}

fn default_election_timeout_ms() -> u64 {
    1000
}

fn default_follower_timeout_ms() -> u64 {
    1500
}

fn default_heartbeat_interval_ms() -> u64 {
    100
}

fn default_timer_random_ratio() -> f64 {
    0.5
}

fn default_snapshot_threshold() -> u64 {
    2048
}

fn default_max_append_batch() -> u64 {
    64
}

fn default_rpc_timeout_ms() -> u64 {
    1000
}

fn default_bootstrap() -> bool {
    true
}

fn default_storage_engine() -> String {
    "sqlite".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// -- Loader -------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: Config = serde_yaml::from_str("node:\n  id: s1\n").unwrap();
        assert_eq!(config.node.id, "s1");
        assert_eq!(config.raft.heartbeat_interval_ms, 100);
        assert_eq!(config.storage.engine, "sqlite");
        assert!(config.api.listen_addr.is_none());
    }

    #[test]
    fn timing_accessors_convert_to_durations() {
        let raft = RaftConfig::default();
        assert_eq!(raft.follower_timeout(), Duration::from_millis(1500));
        assert_eq!(raft.heartbeat_interval(), Duration::from_millis(100));
    }
}
