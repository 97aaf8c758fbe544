//! Error handling for the replicated metastore
//!
//! This module defines the error taxonomy shared by the consensus node, the
//! state machine, the consistent read coordinator and the service surface.
//!
//! # Error Categories
//!
//! - **Leadership**: the node is not (or no longer) the leader; the error
//!   carries the last known leader so the caller can redirect.
//! - **Consistency**: the read could not be proven consistent within policy
//!   bounds (replica lag, concurrent restore).
//! - **Validation**: malformed metadata or queries; terminal.
//! - **Storage**: local transactional store failures.
//! - **Consensus**: failures reported by the raft library.
//! - **System**: timeouts, cancellation, I/O, shutdown.
//!
//! Leadership and consistency errors are retryable, typically against a
//! different replica. Storage failures during log application never reach
//! the caller: the apply path aborts the process instead.
//!
//! # Usage Example
//!
//! ```rust
//! use profile_metastore::error::{MetastoreError, Result};
//!
//! fn propose_somewhere() -> Result<()> {
//!     Err(MetastoreError::NotLeader {
//!         operation: "add_block".to_string(),
//!         leader: Some(2),
//!     })
//! }
//!
//! let err = propose_somewhere().unwrap_err();
//! assert!(err.is_retryable());
//! assert_eq!(err.leader_hint(), Some(2));
//! ```

use crate::types::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Error type for metastore operations
#[derive(Error, Debug)]
pub enum MetastoreError {
    // === Leadership ===
    /// The local node is not the leader
    #[error("Not leader for operation '{operation}', current leader: {leader:?}")]
    NotLeader {
        /// The operation that was attempted
        operation: String,
        /// The last known leader, if any
        leader: Option<NodeId>,
    },

    /// The node lost leadership while the operation was in flight
    #[error("Leadership lost during '{operation}', current leader: {leader:?}")]
    LeadershipLost {
        /// The operation that was interrupted
        operation: String,
        /// The last known leader, if any
        leader: Option<NodeId>,
    },

    /// A leadership transfer is in progress and proposals are dropped
    #[error("Leadership transfer in progress, operation '{operation}' dropped")]
    LeadershipTransferInProgress {
        /// The operation that was dropped
        operation: String,
        /// The last known leader, if any
        leader: Option<NodeId>,
    },

    /// The caller planned the operation in a term that is no longer current
    #[error("Term mismatch for '{operation}': expected {expected}, current {current}")]
    TermMismatch {
        /// The operation that was rejected
        operation: String,
        /// Term the caller observed
        expected: u64,
        /// Term the node is in now
        current: u64,
    },

    // === Consistency ===
    /// The local replica is too far behind the leader's commit index
    #[error("Replica has fallen too far behind: applied {applied}, target {target}")]
    LagBehind {
        /// Locally applied index
        applied: u64,
        /// Index the replica had to reach
        target: u64,
    },

    /// The state was rewound (restored from a snapshot) before the read began
    #[error("Read aborted: applied index {applied} is behind commit index {commit_index}")]
    Aborted {
        /// Locally applied index observed inside the read transaction
        applied: u64,
        /// Commit index certified by the leader
        commit_index: u64,
    },

    /// Wrapper for every failure of the consistent read protocol
    #[error("Consistent read failed: {source}")]
    ConsistentRead {
        /// The underlying failure
        #[source]
        source: Box<MetastoreError>,
    },

    // === Validation ===
    /// Invalid request or metadata
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// The field that failed validation
        field: String,
        /// Why it failed
        reason: String,
    },

    /// Block is not present in the index
    #[error("Block {block} not found in tenant '{tenant}' shard {shard}")]
    BlockNotFound {
        /// Tenant of the block
        tenant: String,
        /// Shard of the block
        shard: u32,
        /// Block identifier
        block: String,
    },

    // === Storage ===
    /// Local transactional store operation failed
    #[error("Storage operation '{operation}' failed: {source}")]
    Storage {
        /// The storage operation that failed
        operation: String,
        /// The underlying error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Snapshot capture or restore failed
    #[error("Snapshot {operation} failed: {details}")]
    Snapshot {
        /// The snapshot operation (persist, restore, verify)
        operation: String,
        /// Details about the failure
        details: String,
    },

    /// Serialization of a command, response or record failed
    #[error("Serialization error for {message_type}: {source}")]
    Serialization {
        /// The type being (de)serialized
        message_type: String,
        /// The underlying error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // === Consensus ===
    /// Error from the underlying raft library
    #[error("Raft consensus error in '{operation}': {source}")]
    Consensus {
        /// The operation that triggered the error
        operation: String,
        /// The raft library error
        #[source]
        source: raft::Error,
    },

    /// Transport failure while talking to a peer
    #[error("Transport error talking to node {peer}: {details}")]
    Transport {
        /// The peer that could not be reached
        peer: NodeId,
        /// Details about the failure
        details: String,
    },

    // === System ===
    /// Operation exceeded its deadline
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// How long the operation waited
        duration: Duration,
    },

    /// Operation was cancelled before completion
    #[error("Operation '{operation}' was cancelled")]
    Cancelled {
        /// The operation that was cancelled
        operation: String,
    },

    /// Component has been shut down
    #[error("Service unavailable: {service} - {reason}")]
    ServiceUnavailable {
        /// The service that is unavailable
        service: String,
        /// Why it is unavailable
        reason: String,
    },

    /// I/O failure
    #[error("I/O error during {operation}: {source}")]
    Io {
        /// The operation that encountered the error
        operation: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl MetastoreError {
    /// Check if the caller may retry the operation, possibly on another node
    pub fn is_retryable(&self) -> bool {
        match self {
            MetastoreError::NotLeader { .. }
            | MetastoreError::LeadershipLost { .. }
            | MetastoreError::LeadershipTransferInProgress { .. }
            | MetastoreError::TermMismatch { .. }
            | MetastoreError::LagBehind { .. }
            | MetastoreError::Aborted { .. }
            | MetastoreError::Transport { .. }
            | MetastoreError::Timeout { .. } => true,

            MetastoreError::ConsistentRead { source } => source.is_retryable(),

            _ => false,
        }
    }

    /// Get the error category for logging and monitoring
    pub fn category(&self) -> &'static str {
        match self {
            MetastoreError::NotLeader { .. }
            | MetastoreError::LeadershipLost { .. }
            | MetastoreError::LeadershipTransferInProgress { .. }
            | MetastoreError::TermMismatch { .. } => "leadership",

            MetastoreError::LagBehind { .. }
            | MetastoreError::Aborted { .. }
            | MetastoreError::ConsistentRead { .. } => "consistency",

            MetastoreError::Validation { .. } | MetastoreError::BlockNotFound { .. } => {
                "validation"
            }

            MetastoreError::Storage { .. }
            | MetastoreError::Snapshot { .. }
            | MetastoreError::Serialization { .. } => "storage",

            MetastoreError::Consensus { .. } | MetastoreError::Transport { .. } => "consensus",

            MetastoreError::Timeout { .. }
            | MetastoreError::Cancelled { .. }
            | MetastoreError::ServiceUnavailable { .. }
            | MetastoreError::Io { .. } => "system",
        }
    }

    /// The leader a retry should be directed to, if the error carries one
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            MetastoreError::NotLeader { leader, .. }
            | MetastoreError::LeadershipLost { leader, .. }
            | MetastoreError::LeadershipTransferInProgress { leader, .. } => *leader,
            MetastoreError::ConsistentRead { source } => source.leader_hint(),
            _ => None,
        }
    }

    /// Create a storage error with context
    pub fn storage_error(
        operation: &str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        MetastoreError::Storage {
            operation: operation.to_string(),
            source: Box::new(source),
        }
    }

    /// Create a consensus error with context
    pub fn consensus_error(operation: &str, source: raft::Error) -> Self {
        MetastoreError::Consensus {
            operation: operation.to_string(),
            source,
        }
    }

    /// Create a serialization error with context
    pub fn serialization(
        message_type: &str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        MetastoreError::Serialization {
            message_type: message_type.to_string(),
            source: Box::new(source),
        }
    }

    /// Create a validation error
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        MetastoreError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Wrap an error produced by the consistent read protocol
    pub fn consistent_read(source: MetastoreError) -> Self {
        match source {
            already @ MetastoreError::ConsistentRead { .. } => already,
            other => MetastoreError::ConsistentRead {
                source: Box::new(other),
            },
        }
    }
}

/// Result type alias for metastore operations
pub type Result<T> = std::result::Result<T, MetastoreError>;

impl From<std::io::Error> for MetastoreError {
    fn from(err: std::io::Error) -> Self {
        MetastoreError::Io {
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<raft::Error> for MetastoreError {
    fn from(err: raft::Error) -> Self {
        MetastoreError::Consensus {
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<bincode::Error> for MetastoreError {
    fn from(err: bincode::Error) -> Self {
        MetastoreError::Serialization {
            message_type: "binary".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for MetastoreError {
    fn from(err: serde_json::Error) -> Self {
        MetastoreError::Serialization {
            message_type: "json".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let err = MetastoreError::NotLeader {
            operation: "propose".to_string(),
            leader: Some(2),
        };
        assert_eq!(err.category(), "leadership");
        assert!(err.is_retryable());
        assert_eq!(err.leader_hint(), Some(2));

        let err = MetastoreError::LagBehind {
            applied: 10,
            target: 20_000,
        };
        assert_eq!(err.category(), "consistency");
        assert!(err.is_retryable());

        let err = MetastoreError::validation("block.id", "empty");
        assert_eq!(err.category(), "validation");
        assert!(!err.is_retryable());

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = MetastoreError::storage_error("commit", io_err);
        assert_eq!(err.category(), "storage");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_consistent_read_wrapping() {
        let inner = MetastoreError::LeadershipLost {
            operation: "read_index".to_string(),
            leader: Some(3),
        };
        let err = MetastoreError::consistent_read(inner);
        assert!(err.to_string().starts_with("Consistent read failed"));
        assert!(err.is_retryable());
        assert_eq!(err.leader_hint(), Some(3));

        // Wrapping twice keeps a single layer.
        let err = MetastoreError::consistent_read(err);
        match err {
            MetastoreError::ConsistentRead { source } => {
                assert!(matches!(*source, MetastoreError::LeadershipLost { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = MetastoreError::Aborted {
            applied: 4,
            commit_index: 9,
        };
        let display = err.to_string();
        assert!(display.contains("aborted"));
        assert!(display.contains('4'));
        assert!(display.contains('9'));

        let err = MetastoreError::Timeout {
            operation: "propose".to_string(),
            duration: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("propose"));
        assert_eq!(err.category(), "system");
    }
}
