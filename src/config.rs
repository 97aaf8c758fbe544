//! Configuration management for the metastore
//!
//! Configuration is layered: compiled-in defaults, then an optional TOML file,
//! then `METASTORE_*` environment variables. Every section tolerates missing
//! keys so a file only needs to name what it changes.
//!
//! # Examples
//!
//! ```rust,no_run
//! use profile_metastore::config::{Config, ConfigBuilder, SnapshotCompression};
//! use std::time::Duration;
//!
//! let config = ConfigBuilder::new()
//!     .node_id(1)
//!     .peers(vec![1, 2, 3])
//!     .raft_dir("./data-metastore/raft")
//!     .fsm_data_dir("./data-metastore/data")
//!     .snapshot_compression(SnapshotCompression::Zstd)
//!     .job_lease(Duration::from_secs(15))
//!     .build()
//!     .expect("Failed to build config");
//!
//! // Loading from file (requires metastore.toml to exist)
//! // let config = Config::from_file("metastore.toml").expect("Failed to load config");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Result alias for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration field value
    #[error("Invalid configuration: {field}: {message}")]
    Invalid {
        /// The field that has invalid configuration
        field: String,
        /// Description of what makes it invalid
        message: String,
    },

    /// Required configuration field is missing
    #[error("Missing required field: {field}")]
    Missing {
        /// The name of the missing field
        field: String,
    },

    /// IO error occurred while reading/writing configuration
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::de::Error),

    /// Environment variable processing error
    #[error("Environment variable error: {0}")]
    Environment(String),
}

/// Complete configuration for a metastore node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and membership
    pub node: NodeConfig,

    /// Raft consensus and read-index settings
    pub raft: RaftConfig,

    /// State machine storage and snapshot settings
    pub fsm: FsmConfig,

    /// Compaction planner settings
    pub compaction: CompactionConfig,

    /// Block index settings
    pub index: IndexConfig,

    /// Retention policy
    pub retention: RetentionConfig,

    /// Logging and observability
    pub observability: ObservabilityConfig,
}

/// Identity and membership of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node identifier (required, non-zero)
    pub id: Option<u64>,

    /// Voter ids of the initial cluster, including this node.
    /// Empty means a single-node cluster made of `id`.
    pub peers: Vec<u64>,

    /// Campaign for leadership immediately on start
    pub bootstrap: bool,

    /// Directory holding the replicated log
    pub raft_dir: PathBuf,
}

/// Consensus timing and log retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Interval between logical clock ticks
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Ticks without a heartbeat before a follower campaigns
    pub election_tick: usize,

    /// Ticks between leader heartbeats
    pub heartbeat_tick: usize,

    /// Upper bound for proposals and read-index catch-up waits
    #[serde(with = "humantime_serde")]
    pub apply_timeout: Duration,

    /// Polling interval used while waiting for an index to be reached
    #[serde(with = "humantime_serde")]
    pub log_index_check_interval: Duration,

    /// Maximum tolerated distance between the applied and target index
    /// before a read fails fast; 0 disables the check
    pub read_index_max_distance: u64,

    /// Log entries kept behind a snapshot for slow followers
    pub trailing_logs: u64,

    /// Applied entries since the last snapshot that trigger a new one
    pub snapshot_threshold: u64,

    /// Maximum time between snapshots when there are new entries
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,

    /// Settle time before leadership transitions are reported
    #[serde(with = "humantime_serde")]
    pub leader_observer_debounce: Duration,

    /// Maximum number of inflight append messages per peer
    pub max_inflight_msgs: usize,

    /// Maximum size of a single append message in bytes
    pub max_size_per_msg: u64,

    /// Whether to enable pre-vote to prevent disruptions
    pub pre_vote: bool,

    /// Step down when a quorum is no longer reachable
    pub check_quorum: bool,
}

/// Snapshot compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotCompression {
    /// Raw database pages
    None,

    /// Streaming zstd
    #[default]
    Zstd,
}

/// State machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsmConfig {
    /// Directory holding the state machine database
    pub data_dir: PathBuf,

    /// Compression applied when persisting snapshots
    pub snapshot_compression: SnapshotCompression,

    /// Snapshot write rate limit in MB/s; 0 means unlimited
    pub snapshot_rate_limit: u32,

    /// Compact the received database before swapping it in
    pub snapshot_compact_on_restore: bool,

    /// How long a proposer's tracing context is kept for the apply path
    #[serde(with = "humantime_serde")]
    pub context_ttl: Duration,
}

/// Compaction planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Blocks per compaction job
    pub batch_size: usize,

    /// Blocks at or above this level are not compacted further
    pub max_level: u32,

    /// Lease granted to a worker on assignment or renewal
    #[serde(with = "humantime_serde")]
    pub job_lease: Duration,

    /// Failed attempts after which a job is cancelled
    pub max_failures: u32,

    /// Seal under-sized batches that have not grown for this long; 0 disables
    #[serde(with = "humantime_serde")]
    pub max_batch_age: Duration,
}

/// Block index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Width of the time window a partition covers
    #[serde(with = "humantime_serde")]
    pub partition_duration: Duration,
}

/// Per-tenant retention override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionOverride {
    /// Retention period for the tenant
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Run the retention cleaner on the leader
    pub enabled: bool,

    /// Default retention period
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Interval between cleanup passes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Tenant specific periods
    pub tenant_overrides: HashMap<String, RetentionOverride>,
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            peers: Vec::new(),
            bootstrap: false,
            raft_dir: PathBuf::from("./data-metastore/raft"),
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 2,
            apply_timeout: Duration::from_secs(5),
            log_index_check_interval: Duration::from_millis(14),
            read_index_max_distance: 10 << 10,
            trailing_logs: 18 << 10,
            snapshot_threshold: 8 << 10,
            snapshot_interval: Duration::from_secs(180),
            leader_observer_debounce: Duration::from_millis(50),
            max_inflight_msgs: 256,
            max_size_per_msg: 1024 * 1024, // 1MB
            pre_vote: true,
            check_quorum: true,
        }
    }
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data-metastore/data"),
            snapshot_compression: SnapshotCompression::default(),
            snapshot_rate_limit: 15,
            snapshot_compact_on_restore: false,
            context_ttl: Duration::from_secs(10),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_level: 3,
            job_lease: Duration::from_secs(15),
            max_failures: 3,
            max_batch_age: Duration::ZERO,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            partition_duration: Duration::from_secs(6 * 3600),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: Duration::from_secs(31 * 24 * 3600),
            interval: Duration::from_secs(60),
            tenant_overrides: HashMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Read a TOML file, then apply `METASTORE_*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Defaults plus `METASTORE_*` overrides
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `METASTORE_*` variables
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        // Node configuration
        if let Ok(id) = std::env::var("METASTORE_NODE_ID") {
            self.node.id = Some(parse_env("node ID", &id)?);
        }

        if let Ok(peers) = std::env::var("METASTORE_PEERS") {
            self.node.peers = peers
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(|p| parse_env("peer ID", p.trim()))
                .collect::<ConfigResult<Vec<u64>>>()?;
        }

        if let Ok(dir) = std::env::var("METASTORE_RAFT_DIR") {
            self.node.raft_dir = PathBuf::from(dir);
        }

        // State machine configuration
        if let Ok(dir) = std::env::var("METASTORE_FSM_DATA_DIR") {
            self.fsm.data_dir = PathBuf::from(dir);
        }

        if let Ok(compression) = std::env::var("METASTORE_SNAPSHOT_COMPRESSION") {
            self.fsm.snapshot_compression = compression.parse()?;
        }

        if let Ok(limit) = std::env::var("METASTORE_SNAPSHOT_RATE_LIMIT") {
            self.fsm.snapshot_rate_limit = parse_env("snapshot rate limit", &limit)?;
        }

        // Raft configuration
        if let Ok(timeout) = std::env::var("METASTORE_APPLY_TIMEOUT") {
            self.raft.apply_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                ConfigError::Environment(format!("Invalid apply timeout: {}", e))
            })?;
        }

        // Compaction configuration
        if let Ok(lease) = std::env::var("METASTORE_JOB_LEASE") {
            self.compaction.job_lease = humantime::parse_duration(&lease)
                .map_err(|e| ConfigError::Environment(format!("Invalid job lease: {}", e)))?;
        }

        if let Ok(size) = std::env::var("METASTORE_BATCH_SIZE") {
            self.compaction.batch_size = parse_env("batch size", &size)?;
        }

        // Observability configuration
        if let Ok(level) = std::env::var("METASTORE_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = std::env::var("METASTORE_LOG_FORMAT") {
            self.observability.logging.format = format;
        }

        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        let id = match self.node.id {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    field: "node.id".to_string(),
                    message: "Node ID 0 is reserved".to_string(),
                })
            }
            Some(id) => id,
            None => {
                return Err(ConfigError::Missing {
                    field: "node.id".to_string(),
                })
            }
        };

        let mut seen_peers = HashSet::new();
        for peer in &self.node.peers {
            if *peer == 0 || !seen_peers.insert(*peer) {
                return Err(ConfigError::Invalid {
                    field: "node.peers".to_string(),
                    message: format!("Invalid or duplicate peer ID: {}", peer),
                });
            }
        }
        if !self.node.peers.is_empty() && !seen_peers.contains(&id) {
            return Err(ConfigError::Invalid {
                field: "node.peers".to_string(),
                message: format!("Peers must include the local node {}", id),
            });
        }

        if self.node.raft_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "node.raft_dir".to_string(),
                message: "Raft directory cannot be empty".to_string(),
            });
        }

        if self.fsm.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "fsm.data_dir".to_string(),
                message: "Data directory cannot be empty".to_string(),
            });
        }

        // Validate Raft timing constraints
        if self.raft.heartbeat_tick == 0 || self.raft.heartbeat_tick >= self.raft.election_tick {
            return Err(ConfigError::Invalid {
                field: "raft.heartbeat_tick".to_string(),
                message: "Heartbeat tick must be non-zero and less than election tick"
                    .to_string(),
            });
        }

        if self.raft.tick_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "raft.tick_interval".to_string(),
                message: "Tick interval must be positive".to_string(),
            });
        }

        if self.raft.log_index_check_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "raft.log_index_check_interval".to_string(),
                message: "Polling interval must be positive".to_string(),
            });
        }

        if self.compaction.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "compaction.batch_size".to_string(),
                message: "Batch size must be at least 1".to_string(),
            });
        }

        if self.compaction.job_lease.is_zero() {
            return Err(ConfigError::Invalid {
                field: "compaction.job_lease".to_string(),
                message: "Job lease must be positive".to_string(),
            });
        }

        if self.index.partition_duration.as_millis() == 0 {
            return Err(ConfigError::Invalid {
                field: "index.partition_duration".to_string(),
                message: "Partition duration must be at least one millisecond".to_string(),
            });
        }

        if self.retention.enabled && self.retention.interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "retention.interval".to_string(),
                message: "Cleanup interval must be positive".to_string(),
            });
        }

        match self.observability.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Invalid {
                    field: "observability.logging.level".to_string(),
                    message: format!("Invalid log level: {}", self.observability.logging.level),
                });
            }
        }

        match self.observability.logging.format.as_str() {
            "json" | "pretty" | "compact" => {}
            _ => {
                return Err(ConfigError::Invalid {
                    field: "observability.logging.format".to_string(),
                    message: format!(
                        "Invalid log format: {}",
                        self.observability.logging.format
                    ),
                });
            }
        }

        Ok(())
    }

    /// The node id; only valid on a validated configuration
    pub fn node_id(&self) -> u64 {
        self.node.id.unwrap_or_default()
    }

    /// Initial voters, falling back to a single-node cluster
    pub fn voters(&self) -> Vec<u64> {
        if self.node.peers.is_empty() {
            vec![self.node_id()]
        } else {
            self.node.peers.clone()
        }
    }

    /// Write the configuration as pretty TOML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Environment(format!("Serialization failed: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn parse_env<T>(what: &str, value: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::Environment(format!("Invalid {}: {}", what, e)))
}

/// Fluent builder over [`Config`]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Builder seeded with [`Config::default`]
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the node ID (required)
    pub fn node_id(mut self, id: u64) -> Self {
        self.config.node.id = Some(id);
        self
    }

    /// Set the initial voters
    pub fn peers(mut self, peers: Vec<u64>) -> Self {
        self.config.node.peers = peers;
        self
    }

    /// Campaign immediately on start
    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.config.node.bootstrap = bootstrap;
        self
    }

    /// Set the replicated log directory
    pub fn raft_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.node.raft_dir = dir.into();
        self
    }

    /// Set the state machine data directory
    pub fn fsm_data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.fsm.data_dir = dir.into();
        self
    }

    /// Set the logical clock tick interval
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.raft.tick_interval = interval;
        self
    }

    /// Set election and heartbeat ticks
    pub fn ticks(mut self, election_tick: usize, heartbeat_tick: usize) -> Self {
        self.config.raft.election_tick = election_tick;
        self.config.raft.heartbeat_tick = heartbeat_tick;
        self
    }

    /// Set the apply timeout
    pub fn apply_timeout(mut self, timeout: Duration) -> Self {
        self.config.raft.apply_timeout = timeout;
        self
    }

    /// Configure read-index catch-up polling
    pub fn read_index(mut self, check_interval: Duration, max_distance: u64) -> Self {
        self.config.raft.log_index_check_interval = check_interval;
        self.config.raft.read_index_max_distance = max_distance;
        self
    }

    /// Configure log snapshotting
    pub fn snapshots(mut self, threshold: u64, trailing_logs: u64) -> Self {
        self.config.raft.snapshot_threshold = threshold;
        self.config.raft.trailing_logs = trailing_logs;
        self
    }

    /// Set the leader observer debounce
    pub fn leader_observer_debounce(mut self, debounce: Duration) -> Self {
        self.config.raft.leader_observer_debounce = debounce;
        self
    }

    /// Set snapshot compression
    pub fn snapshot_compression(mut self, compression: SnapshotCompression) -> Self {
        self.config.fsm.snapshot_compression = compression;
        self
    }

    /// Set the snapshot rate limit in MB/s
    pub fn snapshot_rate_limit(mut self, mb_per_sec: u32) -> Self {
        self.config.fsm.snapshot_rate_limit = mb_per_sec;
        self
    }

    /// Compact the database on restore
    pub fn snapshot_compact_on_restore(mut self, enabled: bool) -> Self {
        self.config.fsm.snapshot_compact_on_restore = enabled;
        self
    }

    /// Set the compaction batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.compaction.batch_size = size;
        self
    }

    /// Set the compaction job lease
    pub fn job_lease(mut self, lease: Duration) -> Self {
        self.config.compaction.job_lease = lease;
        self
    }

    /// Set the retention period and toggle the cleaner
    pub fn retention(mut self, enabled: bool, period: Duration) -> Self {
        self.config.retention.enabled = enabled;
        self.config.retention.period = period;
        self
    }

    /// Set log level
    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.observability.logging.level = level.into();
        self
    }

    /// Set log format
    pub fn log_format<S: Into<String>>(mut self, format: S) -> Self {
        self.config.observability.logging.format = format.into();
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<Config> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without running [`Config::validate`]
    pub fn build_unchecked(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for SnapshotCompression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(SnapshotCompression::None),
            "zstd" => Ok(SnapshotCompression::Zstd),
            _ => Err(ConfigError::Invalid {
                field: "fsm.snapshot_compression".to_string(),
                message: format!("Invalid snapshot compression: {}", s),
            }),
        }
    }
}
