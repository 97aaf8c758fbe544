//! # profile-metastore
//!
//! Replicated metadata store for a profiling storage backend:
//! - **Raft consensus** (raft-rs) with a read-index protocol for consistent
//!   reads on leaders and followers
//! - **Transactional state machine** on redb, with streamed snapshots and a
//!   tracing bridge from proposer to apply path
//! - **Block index** partitioned by time, tenant and shard, with time-based
//!   retention
//! - **Compaction scheduling**: staged block batches, a job queue with
//!   leases and fencing tokens
//!
//! ## Example
//!
//! ```rust,no_run
//! use profile_metastore::prelude::*;
//! use profile_metastore::raft::LocalTransport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ConfigBuilder::new()
//!         .node_id(1)
//!         .bootstrap(true)
//!         .raft_dir("/tmp/metastore-1/raft")
//!         .fsm_data_dir("/tmp/metastore-1/data")
//!         .job_lease(Duration::from_secs(15))
//!         .build()
//!         .map_err(|e| Error::validation("config", e.to_string()))?;
//!
//!     let transport = LocalTransport::new();
//!     let inbound = transport.connect(1);
//!     let metastore = Metastore::new(config, transport, inbound).await?;
//!     metastore.start().await?;
//!
//!     let info = metastore.node_info().await?;
//!     println!("node {} is {:?}", info.server_id, info.role);
//!
//!     metastore.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

// Core modules
pub mod config;
pub mod error;
pub mod observability;
pub mod types;

// Replication
pub mod fsm;
pub mod raft;
pub mod storage;

// Metastore state
pub mod compaction;
pub mod index;
pub mod service;

// Re-export key types from dependencies
pub use ::raft as raft_lib;
pub use raft_proto;
pub use redb;

// Public API exports
pub use crate::config::{Config, ConfigBuilder, ConfigError, ConfigResult};
pub use crate::error::{MetastoreError as Error, Result};
pub use crate::service::Metastore;
pub use crate::types::{BlockMeta, NodeId};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::compaction::{
        AssignedJob, JobOutcome, JobStatusUpdate, PollCompactionJobsRequest, PollCompactionJobsResponse,
    };
    pub use crate::config::{Config, ConfigBuilder, ConfigError, ConfigResult};
    pub use crate::error::{MetastoreError as Error, Result};
    pub use crate::service::Metastore;
    pub use crate::types::{
        BlockMeta, BlockQuery, Dataset, LabelMatcher, MetadataQuery, NodeId, NodeInfo, NodeRole,
        PartitionTombstone, ReadIndex, Tombstones,
    };
}
