//! Core types and data structures for the metastore
//!
//! Node identity and status, the read index certified by a leader, and the
//! block metadata model the index and the compaction planner operate on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a Raft node
pub type NodeId = u64;

/// Node role in the Raft cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NodeRole {
    /// Follower node
    #[default]
    Follower,
    /// Candidate node (during election)
    Candidate,
    /// Pre-candidate node (pre-vote phase)
    PreCandidate,
    /// Leader node
    Leader,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "follower"),
            NodeRole::Candidate => write!(f, "candidate"),
            NodeRole::PreCandidate => write!(f, "pre-candidate"),
            NodeRole::Leader => write!(f, "leader"),
        }
    }
}

impl From<raft::StateRole> for NodeRole {
    fn from(role: raft::StateRole) -> Self {
        match role {
            raft::StateRole::Leader => NodeRole::Leader,
            raft::StateRole::Candidate => NodeRole::Candidate,
            raft::StateRole::PreCandidate => NodeRole::PreCandidate,
            raft::StateRole::Follower => NodeRole::Follower,
        }
    }
}

/// Leadership snapshot published by the node on every state change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LeaderState {
    /// Role of the local node
    pub role: NodeRole,
    /// Current term
    pub term: u64,
    /// Known leader, if any
    pub leader_id: Option<NodeId>,
}

impl LeaderState {
    /// Check if the local node is the leader
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}

/// Point-in-time lower bound for a consistent read
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReadIndex {
    /// Commit index certified by the leader
    pub commit_index: u64,
    /// Term in which leadership was confirmed
    pub term: u64,
}

/// Compaction queue counters reported by node introspection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CompactionStats {
    /// Blocks staged for compaction
    pub queued_blocks: usize,
    /// Jobs waiting for a worker
    pub pending_jobs: usize,
    /// Jobs leased to a worker
    pub in_progress_jobs: usize,
    /// Jobs that exceeded the failure budget
    pub cancelled_jobs: usize,
}

/// Operational view of a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    /// The node ID
    pub server_id: NodeId,
    /// Current role in the cluster
    pub role: NodeRole,
    /// Current term
    pub term: u64,
    /// Current leader ID (if known)
    pub leader_id: Option<NodeId>,
    /// Last log index
    pub last_log_index: u64,
    /// Committed log index
    pub commit_index: u64,
    /// Applied log index
    pub applied_index: u64,
    /// Voters of the current configuration
    pub peers: Vec<NodeId>,
    /// Compaction queue counters
    pub compaction: CompactionStats,
}

impl NodeInfo {
    /// Check if this node is the leader
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node {} [{}] term={} leader={:?} log={}/{}/{} peers={}",
            self.server_id,
            self.role,
            self.term,
            self.leader_id,
            self.last_log_index,
            self.commit_index,
            self.applied_index,
            self.peers.len()
        )
    }
}

/// A labelled profile series set stored in a block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dataset {
    /// Dataset (service) name
    pub name: String,
    /// Sorted label pairs
    pub labels: Vec<(String, String)>,
}

/// Metadata of an immutable block in object storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockMeta {
    /// Globally unique block identifier
    pub id: String,
    /// Owning tenant; empty for shared multi-tenant blocks
    pub tenant: String,
    /// Ingestion shard
    pub shard: u32,
    /// Number of compaction passes the data went through
    pub compaction_level: u32,
    /// Earliest sample timestamp, unix millis
    pub min_time: i64,
    /// Latest sample timestamp, unix millis
    pub max_time: i64,
    /// Block size in bytes
    pub size: u64,
    /// Datasets contained in the block
    pub datasets: Vec<Dataset>,
}

impl BlockMeta {
    /// Reject metadata the index cannot place
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::MetastoreError;

        if self.id.is_empty() {
            return Err(MetastoreError::validation("block.id", "must not be empty"));
        }
        if self.max_time < self.min_time {
            return Err(MetastoreError::validation(
                "block.max_time",
                format!("{} precedes min_time {}", self.max_time, self.min_time),
            ));
        }
        Ok(())
    }

    /// Check whether the block overlaps `[start, end]`
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.min_time <= end && self.max_time >= start
    }
}

/// Label comparison operator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MatchOp {
    /// Label value equals
    Equal,
    /// Label value differs, or the label is absent
    NotEqual,
}

/// A single label matcher, `name op "value"`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelMatcher {
    /// Label name; `__service_name__` also matches the dataset name
    pub name: String,
    /// Comparison operator
    pub op: MatchOp,
    /// Expected value
    pub value: String,
}

impl LabelMatcher {
    /// Matcher requiring `name == value`
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
        }
    }

    /// Matcher requiring `name != value`
    pub fn ne(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::NotEqual,
            value: value.into(),
        }
    }

    /// Evaluate the matcher against a dataset
    pub fn matches(&self, dataset: &Dataset) -> bool {
        let actual = if self.name == SERVICE_NAME_LABEL {
            Some(dataset.name.as_str())
        } else {
            dataset
                .labels
                .iter()
                .find(|(k, _)| *k == self.name)
                .map(|(_, v)| v.as_str())
        };
        match self.op {
            MatchOp::Equal => actual == Some(self.value.as_str()),
            MatchOp::NotEqual => actual != Some(self.value.as_str()),
        }
    }
}

/// Reserved label addressing the dataset name
pub const SERVICE_NAME_LABEL: &str = "__service_name__";

/// Query over the block index
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MetadataQuery {
    /// Tenants to search; must not be empty
    pub tenants: Vec<String>,
    /// Inclusive lower bound, unix millis
    pub start_time: i64,
    /// Inclusive upper bound, unix millis
    pub end_time: i64,
    /// All matchers must hold for at least one dataset of the block
    pub matchers: Vec<LabelMatcher>,
    /// Label names to project in label queries
    pub label_names: Vec<String>,
}

impl MetadataQuery {
    /// Reject malformed queries
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::MetastoreError;

        if self.tenants.is_empty() {
            return Err(MetastoreError::validation("query.tenants", "at least one tenant is required"));
        }
        if self.end_time < self.start_time {
            return Err(MetastoreError::validation(
                "query.end_time",
                format!("{} precedes start_time {}", self.end_time, self.start_time),
            ));
        }
        Ok(())
    }

    /// Whether a dataset satisfies every matcher
    pub fn matches(&self, dataset: &Dataset) -> bool {
        self.matchers.iter().all(|m| m.matches(dataset))
    }
}

/// Lookup of specific blocks by id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlockQuery {
    /// Tenant of the blocks
    pub tenant: String,
    /// Shard of the blocks
    pub shard: u32,
    /// Block identifiers
    pub blocks: Vec<String>,
}

/// One partition shard to drop from the index
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionTombstone {
    /// Partition start, unix millis
    pub partition: i64,
    /// Tenant
    pub tenant: String,
    /// Shard
    pub shard: u32,
}

/// Retention decision proposed by the leader
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Tombstones {
    /// Term the plan was made in
    pub term: u64,
    /// Partition shards to remove
    pub partitions: Vec<PartitionTombstone>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(name: &str, labels: &[(&str, &str)]) -> Dataset {
        Dataset {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_node_role_display() {
        assert_eq!(format!("{}", NodeRole::Leader), "leader");
        assert_eq!(format!("{}", NodeRole::Follower), "follower");
        assert_eq!(NodeRole::from(raft::StateRole::Candidate), NodeRole::Candidate);
        assert_eq!(NodeRole::default(), NodeRole::Follower);
    }

    #[test]
    fn test_label_matchers() {
        let ds = dataset("api", &[("env", "prod"), ("region", "eu")]);

        assert!(LabelMatcher::eq("env", "prod").matches(&ds));
        assert!(!LabelMatcher::eq("env", "dev").matches(&ds));
        assert!(LabelMatcher::ne("env", "dev").matches(&ds));
        assert!(LabelMatcher::ne("missing", "x").matches(&ds));
        assert!(LabelMatcher::eq(SERVICE_NAME_LABEL, "api").matches(&ds));
    }

    #[test]
    fn test_block_validation() {
        let mut block = BlockMeta {
            id: "b1".to_string(),
            tenant: "t".to_string(),
            shard: 1,
            compaction_level: 0,
            min_time: 10,
            max_time: 20,
            size: 100,
            datasets: vec![],
        };
        assert!(block.validate().is_ok());
        assert!(block.overlaps(20, 30));
        assert!(!block.overlaps(21, 30));

        block.max_time = 5;
        assert!(block.validate().is_err());

        block.max_time = 20;
        block.id.clear();
        assert!(block.validate().is_err());
    }

    #[test]
    fn test_query_validation() {
        let query = MetadataQuery::default();
        assert!(query.validate().is_err());

        let query = MetadataQuery {
            tenants: vec!["t".to_string()],
            start_time: 10,
            end_time: 0,
            ..Default::default()
        };
        assert!(query.validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let tombstones = Tombstones {
            term: 3,
            partitions: vec![PartitionTombstone {
                partition: 0,
                tenant: "t".to_string(),
                shard: 2,
            }],
        };

        let json = serde_json::to_string(&tombstones).unwrap();
        let deserialized: Tombstones = serde_json::from_str(&json).unwrap();
        assert_eq!(tombstones, deserialized);

        let bytes = bincode::serialize(&tombstones).unwrap();
        let deserialized: Tombstones = bincode::deserialize(&bytes).unwrap();
        assert_eq!(tombstones, deserialized);
    }
}
