//! Replicated command envelope
//!
//! Every log entry proposed by the metastore carries a [`RaftLogEntry`]. The
//! consensus layer treats it as opaque bytes; the state machine decodes it
//! and dispatches on [`CommandType`].

use crate::error::{MetastoreError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Tag selecting the handler a command is dispatched to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandType {
    /// Register a freshly ingested block
    AddBlock,
    /// Register a block recovered from the dead-letter queue
    AddRecoveredBlock,
    /// Drop index partitions selected by the retention policy
    TruncateIndex,
    /// Apply worker status updates and lease compaction jobs
    PollCompactionJobs,
}

impl CommandType {
    /// Stable name used in logs and spans
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::AddBlock => "add_block",
            CommandType::AddRecoveredBlock => "add_recovered_block",
            CommandType::TruncateIndex => "truncate_index",
            CommandType::PollCompactionJobs => "poll_compaction_jobs",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit replicated through the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftLogEntry {
    /// Handler selector
    pub command: CommandType,
    /// bincode-encoded request
    pub payload: Vec<u8>,
    /// Unix millis stamped by the proposer; the only clock handlers may use
    pub appended_at: i64,
}

impl RaftLogEntry {
    /// Wrap a request, stamping the current wall clock
    pub fn new<T: Serialize>(command: CommandType, request: &T) -> Result<Self> {
        Ok(Self {
            command,
            payload: bincode::serialize(request)
                .map_err(|e| MetastoreError::serialization(command.as_str(), e))?,
            appended_at: unix_millis(),
        })
    }

    /// Encode for the log
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MetastoreError::serialization("RaftLogEntry", e))
    }

    /// Decode from the log
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| MetastoreError::serialization("RaftLogEntry", e))
    }

    /// Decode the request carried by the entry
    pub fn request<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.payload)
            .map_err(|e| MetastoreError::serialization(self.command.as_str(), e))
    }
}

/// Wall clock in unix milliseconds
pub fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
