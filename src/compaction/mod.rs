//! Compaction planning
//!
//! New blocks are staged in a [`BlockQueue`] per compaction level. Full (or
//! aged) batches become [`CompactionJob`]s in the [`JobQueue`], which workers
//! lease through the `PollCompactionJobs` command. Everything here runs in
//! the apply path, so every decision is derived from the log entry alone.

pub mod block_queue;
pub mod compactor;
pub mod job_queue;

pub use block_queue::{BlockQueue, QueuedBlock, TenantShard};
pub use compactor::Compactor;
pub use job_queue::{CompactionJob, JobQueue, JobStatus};

use crate::types::BlockMeta;
use serde::{Deserialize, Serialize};

/// What a worker reports about a job it holds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobOutcome {
    /// Still running; renews the lease
    InProgress,
    /// Done; the outputs replace the source blocks in the index
    Success {
        /// Blocks produced by the job
        compacted: Vec<BlockMeta>,
    },
    /// Gave up; the job is retried until it runs out of attempts
    Failure,
}

/// Status report for a single job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusUpdate {
    /// Job name
    pub name: String,
    /// Fencing token received on assignment
    pub token: u64,
    /// Reported outcome
    pub outcome: JobOutcome,
}

/// Payload of the `PollCompactionJobs` command
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollCompactionJobsRequest {
    /// Reports on jobs the worker holds
    pub updates: Vec<JobStatusUpdate>,
    /// Number of new jobs the worker can take
    pub capacity: usize,
}

/// A job leased to a worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignedJob {
    /// Job name
    pub name: String,
    /// Tenant of the source blocks
    pub tenant: String,
    /// Shard of the source blocks
    pub shard: u32,
    /// Compaction level of the source blocks
    pub level: u32,
    /// Fencing token to present with every update
    pub token: u64,
    /// Lease deadline, unix millis
    pub lease_expires_at: i64,
    /// Source blocks still present in the index
    pub blocks: Vec<BlockMeta>,
}

/// Response of the `PollCompactionJobs` command
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollCompactionJobsResponse {
    /// Newly leased jobs
    pub assigned: Vec<AssignedJob>,
    /// Updates refused because the worker no longer owns the job
    pub rejected: Vec<String>,
}
