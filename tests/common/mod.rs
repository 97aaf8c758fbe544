//! In-process cluster harness shared by the integration tests

#![allow(dead_code)]

use profile_metastore::config::ConfigBuilder;
use profile_metastore::raft::{wait_for_leader, LocalTransport, RaftNode};
use profile_metastore::types::{BlockMeta, Dataset};
use profile_metastore::{Config, Metastore, NodeId};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// How long any cluster-wide condition may take
pub const WAIT: Duration = Duration::from_secs(10);

/// Node configuration tuned for fast tests
pub fn node_config(root: &Path, id: NodeId, peers: &[NodeId], tune: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Config {
    let dir = root.join(format!("node-{id}"));
    let builder = ConfigBuilder::new()
        .node_id(id)
        .peers(peers.to_vec())
        .bootstrap(id == peers[0])
        .raft_dir(dir.join("raft"))
        .fsm_data_dir(dir.join("data"))
        .tick_interval(Duration::from_millis(10))
        .leader_observer_debounce(Duration::from_millis(5))
        .retention(false, Duration::ZERO);
    tune(builder).build().expect("valid test config")
}

/// A set of metastore nodes connected through a [`LocalTransport`]
pub struct Cluster {
    pub dir: TempDir,
    pub transport: Arc<LocalTransport>,
    pub nodes: Vec<Arc<Metastore>>,
    peers: Vec<NodeId>,
    tune: fn(ConfigBuilder) -> ConfigBuilder,
}

impl Cluster {
    /// Start `size` nodes with default test settings
    pub async fn start(size: u64) -> Self {
        Self::start_with(size, |b| b).await
    }

    /// Start `size` nodes, adjusting every node's configuration with `tune`
    pub async fn start_with(size: u64, tune: fn(ConfigBuilder) -> ConfigBuilder) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let transport = LocalTransport::new();
        let peers: Vec<NodeId> = (1..=size).collect();
        let mut cluster = Self {
            dir,
            transport,
            nodes: Vec::new(),
            peers,
            tune,
        };
        for id in cluster.peers.clone() {
            let node = cluster.open(id).await;
            cluster.nodes.push(node);
        }
        cluster.leader().await;
        cluster
    }

    async fn open(&self, id: NodeId) -> Arc<Metastore> {
        let config = node_config(self.dir.path(), id, &self.peers, self.tune);
        let inbound = self.transport.connect(id);
        let node = Metastore::new(config, self.transport.clone(), inbound)
            .await
            .expect("open metastore");
        node.start().await.expect("start metastore");
        Arc::new(node)
    }

    fn raft_nodes(&self) -> Vec<Arc<RaftNode>> {
        self.nodes.iter().map(|n| n.node().clone()).collect()
    }

    /// Wait for a leader and return it
    pub async fn leader(&self) -> Arc<Metastore> {
        let leader = wait_for_leader(&self.raft_nodes(), WAIT).await.expect("leader elected");
        self.node(leader.id())
    }

    /// Node by id
    pub fn node(&self, id: NodeId) -> Arc<Metastore> {
        self.nodes
            .iter()
            .find(|n| n.node().id() == id)
            .cloned()
            .expect("known node")
    }

    /// Every node except `id`
    pub fn others(&self, id: NodeId) -> Vec<Arc<Metastore>> {
        self.nodes
            .iter()
            .filter(|n| n.node().id() != id)
            .cloned()
            .collect()
    }

    /// Wait until every listed node has applied `index`
    pub async fn wait_applied(&self, nodes: &[Arc<Metastore>], index: u64) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while nodes.iter().any(|n| n.node().applied_index() < index) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "nodes did not apply index {index}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every node has applied what the leader has
    pub async fn sync(&self) {
        let target = self.leader().await.node().applied_index();
        self.wait_applied(&self.nodes, target).await;
    }

    /// Stop node `id` and start it again from its data directories
    pub async fn restart(&mut self, id: NodeId) {
        let position = self
            .nodes
            .iter()
            .position(|n| n.node().id() == id)
            .expect("known node");
        let node = self.nodes.remove(position);
        node.shutdown().await;
        drop(node);
        self.transport.disconnect(id);
        // Snapshot persistence may still hold the old database briefly
        tokio::time::sleep(Duration::from_millis(100)).await;
        let node = self.open(id).await;
        self.nodes.insert(position, node);
    }

    /// Stop every node
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

/// Level-0 block of `tenant`/`shard` covering `[min_time, min_time + 1s]`
pub fn block(id: &str, tenant: &str, shard: u32, min_time: i64) -> BlockMeta {
    BlockMeta {
        id: id.to_string(),
        tenant: tenant.to_string(),
        shard,
        compaction_level: 0,
        min_time,
        max_time: min_time + 1_000,
        size: 4096,
        datasets: vec![Dataset {
            name: "frontend".to_string(),
            labels: vec![
                ("env".to_string(), "prod".to_string()),
                ("region".to_string(), format!("r{}", shard % 2)),
            ],
        }],
    }
}
