//! Consensus layer
//!
//! ## Components
//!
//! - [`node`]: [`RaftNode`], the raft-rs driver. Proposes commands, certifies
//!   read indexes, publishes leadership, snapshots and compacts the log.
//! - [`messages`]: the [`RaftLogEntry`] envelope replicated through the log.
//! - [`read`]: [`StateReader`], the read-index protocol for leader and
//!   follower reads.
//! - [`observer`]: [`LeaderActivity`], for components that run only on the
//!   leader.
//! - [`transport`]: the [`Transport`] seam and the in-process
//!   [`LocalTransport`].
//!
//! ## Write path
//!
//! ```text
//! propose -> RawNode::propose -> replicate -> commit
//!         -> Fsm::apply (every replica) -> handler response -> proposer
//! ```
//!
//! ## Read path
//!
//! ```text
//! leader:   wait for own-term commit -> RawNode::read_index -> quorum ack
//! follower: ReadIndex RPC to the leader
//! both:     wait applied >= commit index -> read transaction -> re-check
//! ```

pub mod messages;
pub mod node;
pub mod observer;
pub mod read;
pub mod transport;

pub use messages::{CommandType, RaftLogEntry};
pub use node::{wait_for_leader, RaftNode};
pub use observer::LeaderActivity;
pub use read::{Leader, ReplicaState, StateReader};
pub use transport::{Inbound, LocalTransport, Transport};
