//! Peer transport
//!
//! The node needs two things from the network: best-effort delivery of raft
//! messages and the `ReadIndex` RPC a follower sends to the leader before
//! serving a consistent read. [`LocalTransport`] implements both in-process,
//! with per-node isolation for partition tests.

use crate::error::{MetastoreError, Result};
use crate::types::{NodeId, ReadIndex};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use raft::prelude::Message;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Traffic delivered to a node by its transport
#[derive(Debug)]
pub enum Inbound {
    /// Raft protocol message
    Raft(Message),
    /// Follower asking the local node, as leader, for a read index
    ReadIndex(oneshot::Sender<Result<ReadIndex>>),
}

/// Receiving half handed to a node on registration
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

/// Network seam used by [`crate::raft::RaftNode`]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver a raft message to `message.to`; failures are dropped
    fn send(&self, message: Message);

    /// Ask `leader` for its current read index on behalf of `from`
    async fn read_index(&self, from: NodeId, leader: NodeId) -> Result<ReadIndex>;
}

/// In-process transport connecting nodes through channels
#[derive(Debug, Default)]
pub struct LocalTransport {
    nodes: DashMap<NodeId, mpsc::UnboundedSender<Inbound>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LocalTransport {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `node_id` and return its inbound queue
    pub fn connect(&self, node_id: NodeId) -> InboundReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(node_id, tx);
        rx
    }

    /// Detach `node_id`; traffic to it is dropped from now on
    pub fn disconnect(&self, node_id: NodeId) {
        self.nodes.remove(&node_id);
    }

    /// Cut `node_id` off from every peer
    pub fn isolate(&self, node_id: NodeId) {
        debug!(node_id, "Isolating node");
        self.isolated.write().insert(node_id);
    }

    /// Undo [`LocalTransport::isolate`]
    pub fn heal(&self, node_id: NodeId) {
        debug!(node_id, "Healing node");
        self.isolated.write().remove(&node_id);
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        let isolated = self.isolated.read();
        !isolated.contains(&from) && !isolated.contains(&to)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn send(&self, message: Message) {
        let (from, to) = (message.from, message.to);
        if !self.reachable(from, to) {
            trace!(from, to, "Dropping message across partition");
            return;
        }
        if let Some(peer) = self.nodes.get(&to) {
            let _ = peer.send(Inbound::Raft(message));
        }
    }

    async fn read_index(&self, from: NodeId, leader: NodeId) -> Result<ReadIndex> {
        let unavailable = |details: &str| MetastoreError::Transport {
            peer: leader,
            details: details.to_string(),
        };
        if !self.reachable(from, leader) {
            return Err(unavailable("peer unreachable"));
        }
        let (reply, response) = oneshot::channel();
        self.nodes
            .get(&leader)
            .ok_or_else(|| unavailable("unknown peer"))?
            .send(Inbound::ReadIndex(reply))
            .map_err(|_| unavailable("peer is shut down"))?;
        response
            .await
            .map_err(|_| unavailable("peer dropped the request"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: NodeId, to: NodeId) -> Message {
        let mut msg = Message::default();
        msg.from = from;
        msg.to = to;
        msg
    }

    #[tokio::test]
    async fn test_delivery_and_isolation() {
        let transport = LocalTransport::new();
        let mut rx2 = transport.connect(2);
        let _rx1 = transport.connect(1);

        transport.send(message(1, 2));
        assert!(matches!(rx2.try_recv(), Ok(Inbound::Raft(m)) if m.from == 1));

        transport.isolate(2);
        transport.send(message(1, 2));
        assert!(rx2.try_recv().is_err());

        transport.heal(2);
        transport.send(message(1, 2));
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_read_index_rpc() {
        let transport = LocalTransport::new();
        let mut leader = transport.connect(1);
        tokio::spawn(async move {
            while let Some(Inbound::ReadIndex(reply)) = leader.recv().await {
                let _ = reply.send(Ok(ReadIndex {
                    commit_index: 42,
                    term: 3,
                }));
            }
        });

        let read_index = transport.read_index(2, 1).await.unwrap();
        assert_eq!(read_index.commit_index, 42);

        transport.isolate(1);
        let err = transport.read_index(2, 1).await.unwrap_err();
        assert_eq!(err.category(), "consensus");
        assert!(transport.read_index(2, 9).await.is_err());
    }
}
