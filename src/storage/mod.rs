//! Storage for the replicated log
//!
//! The replicated log lives in its own redb file, separate from the state
//! machine database, so log compaction never contends with command
//! application for the single writer slot.

pub mod codec;
pub mod log_store;

pub use log_store::RaftStorage;
