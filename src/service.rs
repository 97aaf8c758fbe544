//! Metastore service
//!
//! [`Metastore`] wires the replicated state together: the state machine with
//! the block index and compaction planner as restorers, the command
//! handlers, the raft node, the consistent reader and the retention cleaner
//! that runs on the leader. Its methods are the RPC surface of a node.

use crate::compaction::{Compactor, PollCompactionJobsRequest, PollCompactionJobsResponse};
use crate::config::Config;
use crate::error::{MetastoreError, Result};
use crate::fsm::{CommandContext, ContextRegistry, Fsm};
use crate::index::retention::RetentionCleaner;
use crate::index::{BlockIndex, TruncateResponse};
use crate::raft::transport::InboundReceiver;
use crate::raft::{CommandType, Leader, RaftNode, StateReader, Transport};
use crate::types::{BlockMeta, BlockQuery, MetadataQuery, NodeInfo, ReadIndex, Tombstones};

use parking_lot::Mutex;
use redb::WriteTransaction;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

fn add_block(
    index: &BlockIndex,
    compactor: &Compactor,
    ctx: &CommandContext,
    tx: &WriteTransaction,
    block: BlockMeta,
) -> Result<bool> {
    if !index.insert_block(tx, &block)? {
        debug!(block = %block.id, index = ctx.index, "Block already indexed");
        return Ok(false);
    }
    compactor.add_blocks(tx, ctx, std::slice::from_ref(&block))?;
    Ok(true)
}

fn register_handlers(fsm: &Fsm, index: &Arc<BlockIndex>, compactor: &Arc<Compactor>) {
    for command in [CommandType::AddBlock, CommandType::AddRecoveredBlock] {
        let (index, compactor) = (index.clone(), compactor.clone());
        fsm.register_handler(command, move |ctx, tx, block: BlockMeta| {
            add_block(&index, &compactor, ctx, tx, block)
        });
    }

    let (idx, planner) = (index.clone(), compactor.clone());
    fsm.register_handler(CommandType::TruncateIndex, move |ctx, tx, plan: Tombstones| {
        if plan.term != ctx.term {
            warn!(
                planned = plan.term,
                current = ctx.term,
                "Ignoring truncation planned in another term"
            );
            return Ok(TruncateResponse {
                accepted: false,
                term: ctx.term,
                removed_blocks: 0,
            });
        }
        let removed = idx.truncate(tx, &plan.partitions)?;
        planner.forget_blocks(tx, &removed)?;
        Ok(TruncateResponse {
            accepted: true,
            term: ctx.term,
            removed_blocks: removed.len(),
        })
    });

    let planner = compactor.clone();
    fsm.register_handler(
        CommandType::PollCompactionJobs,
        move |ctx, tx, request: PollCompactionJobsRequest| planner.poll(tx, ctx, request),
    );
}

/// A metastore node
pub struct Metastore {
    config: Config,
    node: Arc<RaftNode>,
    index: Arc<BlockIndex>,
    compactor: Arc<Compactor>,
    reader: Arc<StateReader<RaftNode, RaftNode>>,
    cleaner: Option<Arc<RetentionCleaner>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Metastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metastore")
            .field("node", &self.node)
            .field("blocks", &self.index.block_count())
            .finish()
    }
}

impl Metastore {
    /// Open the local state and create the node; nothing runs until
    /// [`Metastore::start`]
    pub async fn new(config: Config, transport: Arc<dyn Transport>, inbound: InboundReceiver) -> Result<Self> {
        let contexts = Arc::new(ContextRegistry::new());
        let fsm = Arc::new(Fsm::open(config.fsm.clone(), contexts)?);

        let index = Arc::new(BlockIndex::new(config.index.partition_duration));
        let compactor = Arc::new(Compactor::new(&config.compaction, index.clone()));
        fsm.register_restorer(index.clone());
        fsm.register_restorer(compactor.clone());
        register_handlers(&fsm, &index, &compactor);
        fsm.init()?;

        let node = Arc::new(RaftNode::new(config.clone(), fsm, transport, inbound).await?);
        let reader = Arc::new(StateReader::new(
            node.clone(),
            node.clone(),
            config.raft.log_index_check_interval,
            config.raft.read_index_max_distance,
        ));
        let cleaner = config.retention.enabled.then(|| {
            Arc::new(RetentionCleaner::new(
                node.clone(),
                reader.clone(),
                index.clone(),
                &config.retention,
                config.raft.apply_timeout,
            ))
        });

        Ok(Self {
            config,
            node,
            index,
            compactor,
            reader,
            cleaner,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the raft node and the background tasks
    #[instrument(skip(self), fields(node_id = self.node.id()))]
    pub async fn start(&self) -> Result<()> {
        self.node.start().await?;
        let mut tasks = self.tasks.lock();
        tasks.push(
            self.node
                .fsm()
                .contexts()
                .spawn_sweeper(self.config.fsm.context_ttl),
        );
        if let Some(cleaner) = &self.cleaner {
            tasks.push(self.node.run_on_leader(cleaner.clone()));
        }
        info!(blocks = self.index.block_count(), "Metastore started");
        Ok(())
    }

    /// Stop background work, then the node and the state machine
    #[instrument(skip(self), fields(node_id = self.node.id()))]
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Some(cleaner) = &self.cleaner {
            crate::raft::LeaderActivity::stop(cleaner.as_ref());
        }
        self.node.shutdown().await;
        self.node.fsm().shutdown();
        info!("Metastore stopped");
    }

    /// The raft node
    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    /// The block index
    pub fn index(&self) -> &Arc<BlockIndex> {
        &self.index
    }

    /// The compaction planner
    pub fn compactor(&self) -> &Arc<Compactor> {
        &self.compactor
    }

    /// The retention cleaner, if retention is enabled
    pub fn retention(&self) -> Option<&Arc<RetentionCleaner>> {
        self.cleaner.as_ref()
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.raft.apply_timeout
    }

    async fn propose<Req, Resp>(&self, command: CommandType, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self.node.propose(command, request).await?;
        bincode::deserialize(&response).map_err(|e| MetastoreError::serialization(command.as_str(), e))
    }

    /// Register a new block.
    ///
    /// Returns `Ok(())` for blocks that are already present: the local
    /// replica is checked first, then the apply path decides.
    #[instrument(skip(self, block), fields(block = %block.id, tenant = %block.tenant, shard = block.shard))]
    pub async fn add_block(&self, block: BlockMeta) -> Result<()> {
        block.validate()?;
        let known = self
            .node
            .fsm()
            .read(|tx| self.index.find_block(tx, &block.tenant, block.shard, &block.id))?;
        if known.is_some() {
            debug!("Block already added");
            return Ok(());
        }
        let added: bool = self.propose(CommandType::AddBlock, &block).await?;
        debug!(added, "Block proposed");
        Ok(())
    }

    /// Register a block recovered from object storage, skipping the local
    /// duplicate check
    #[instrument(skip(self, block), fields(block = %block.id, tenant = %block.tenant, shard = block.shard))]
    pub async fn add_recovered_block(&self, block: BlockMeta) -> Result<()> {
        block.validate()?;
        let added: bool = self.propose(CommandType::AddRecoveredBlock, &block).await?;
        debug!(added, "Recovered block proposed");
        Ok(())
    }

    /// Drop partition shards. Fails with [`MetastoreError::TermMismatch`] if
    /// `tombstones.term` is not the term the command is applied in.
    #[instrument(skip(self, tombstones), fields(term = tombstones.term, shards = tombstones.partitions.len()))]
    pub async fn truncate_index(&self, tombstones: Tombstones) -> Result<TruncateResponse> {
        let response: TruncateResponse = self.propose(CommandType::TruncateIndex, &tombstones).await?;
        if !response.accepted {
            return Err(MetastoreError::TermMismatch {
                operation: CommandType::TruncateIndex.to_string(),
                expected: tombstones.term,
                current: response.term,
            });
        }
        Ok(response)
    }

    /// Look up blocks by id
    pub async fn get_block_metadata(&self, query: BlockQuery) -> Result<Vec<BlockMeta>> {
        self.reader
            .consistent_read(self.deadline(), |tx, _| self.index.get_blocks(tx, &query))
            .await
    }

    /// Blocks matching a metadata query
    pub async fn query_metadata(&self, query: MetadataQuery) -> Result<Vec<BlockMeta>> {
        query.validate()?;
        self.reader
            .consistent_read(self.deadline(), |tx, _| self.index.query_metadata(tx, &query))
            .await
    }

    /// Distinct label sets of the datasets matching a metadata query
    pub async fn query_metadata_labels(&self, query: MetadataQuery) -> Result<Vec<Vec<(String, String)>>> {
        query.validate()?;
        self.reader
            .consistent_read(self.deadline(), |tx, _| self.index.query_metadata_labels(tx, &query))
            .await
    }

    /// Current read index of the leader, obtained through this node
    pub async fn read_index(&self) -> Result<ReadIndex> {
        Leader::read_index(self.node.as_ref()).await
    }

    /// Report worker progress and lease new compaction jobs
    #[instrument(skip(self, request), fields(updates = request.updates.len(), capacity = request.capacity))]
    pub async fn poll_compaction_jobs(
        &self,
        request: PollCompactionJobsRequest,
    ) -> Result<PollCompactionJobsResponse> {
        self.propose(CommandType::PollCompactionJobs, &request).await
    }

    /// Hand leadership to the most up-to-date peer
    pub async fn transfer_leadership(&self) -> Result<bool> {
        self.node.transfer_leadership().await
    }

    /// Operational view of the node and its compaction queues
    pub async fn node_info(&self) -> Result<NodeInfo> {
        let mut info = self.node.node_info().await?;
        info.compaction = self.compactor.stats();
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::{JobOutcome, JobStatusUpdate};
    use crate::config::ConfigBuilder;
    use crate::raft::{wait_for_leader, LocalTransport};
    use crate::types::{Dataset, LabelMatcher, PartitionTombstone};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn single_node(dir: &TempDir) -> Metastore {
        let config = ConfigBuilder::new()
            .node_id(1)
            .peers(vec![1])
            .bootstrap(true)
            .raft_dir(dir.path().join("raft"))
            .fsm_data_dir(dir.path().join("data"))
            .tick_interval(Duration::from_millis(10))
            .retention(false, Duration::ZERO)
            .build()
            .unwrap();
        let transport = LocalTransport::new();
        let inbound = transport.connect(1);
        let metastore = Metastore::new(config, transport, inbound).await.unwrap();
        metastore.start().await.unwrap();
        wait_for_leader(&[metastore.node().clone()], Duration::from_secs(5))
            .await
            .unwrap();
        metastore
    }

    fn block(id: &str, tenant: &str, shard: u32, min_time: i64) -> BlockMeta {
        BlockMeta {
            id: id.to_string(),
            tenant: tenant.to_string(),
            shard,
            compaction_level: 0,
            min_time,
            max_time: min_time + 1_000,
            size: 512,
            datasets: vec![Dataset {
                name: "checkout".to_string(),
                labels: vec![("env".to_string(), "prod".to_string())],
            }],
        }
    }

    #[tokio::test]
    async fn test_add_and_query() {
        let dir = TempDir::new().unwrap();
        let metastore = single_node(&dir).await;

        metastore.add_block(block("b1", "t1", 1, 1_000)).await.unwrap();
        metastore.add_block(block("b1", "t1", 1, 1_000)).await.unwrap();
        metastore.add_recovered_block(block("b2", "t1", 2, 2_000)).await.unwrap();

        let found = metastore
            .get_block_metadata(BlockQuery {
                tenant: "t1".to_string(),
                shard: 1,
                blocks: vec!["b1".to_string(), "missing".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let query = MetadataQuery {
            tenants: vec!["t1".to_string()],
            start_time: 0,
            end_time: 10_000,
            matchers: vec![LabelMatcher::eq("env", "prod")],
            label_names: vec![],
        };
        let mut ids: Vec<_> = metastore
            .query_metadata(query.clone())
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["b1", "b2"]);

        let labels = metastore.query_metadata_labels(query).await.unwrap();
        assert_eq!(
            labels,
            vec![vec![
                ("__service_name__".to_string(), "checkout".to_string()),
                ("env".to_string(), "prod".to_string()),
            ]]
        );

        let info = metastore.node_info().await.unwrap();
        assert_eq!(info.compaction.queued_blocks, 2);
        metastore.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_block_is_rejected() {
        let dir = TempDir::new().unwrap();
        let metastore = single_node(&dir).await;
        let mut bad = block("b1", "t1", 1, 5_000);
        bad.max_time = 0;
        let err = metastore.add_block(bad).await.unwrap_err();
        assert_eq!(err.category(), "validation");
        metastore.shutdown().await;
    }

    #[tokio::test]
    async fn test_truncate_requires_current_term() {
        let dir = TempDir::new().unwrap();
        let metastore = single_node(&dir).await;
        metastore.add_block(block("b1", "t1", 1, 1_000)).await.unwrap();

        let partition = metastore.index().partition_of(1_000);
        let tombstones = |term| Tombstones {
            term,
            partitions: vec![PartitionTombstone {
                partition,
                tenant: "t1".to_string(),
                shard: 1,
            }],
        };
        let term = metastore.node().leader_state().term;

        let err = metastore.truncate_index(tombstones(term + 1)).await.unwrap_err();
        assert!(matches!(err, MetastoreError::TermMismatch { .. }), "{err}");

        let response = metastore.truncate_index(tombstones(term)).await.unwrap();
        assert_eq!(response.removed_blocks, 1);
        assert_eq!(metastore.index().block_count(), 0);
        assert_eq!(metastore.compactor().stats().queued_blocks, 0);
        metastore.shutdown().await;
    }

    #[tokio::test]
    async fn test_compaction_round_trip() {
        let dir = TempDir::new().unwrap();
        let metastore = single_node(&dir).await;
        for i in 0..10 {
            metastore
                .add_block(block(&format!("b{i}"), "t1", 1, 1_000))
                .await
                .unwrap();
        }

        let polled = metastore
            .poll_compaction_jobs(PollCompactionJobsRequest {
                updates: vec![],
                capacity: 4,
            })
            .await
            .unwrap();
        assert_eq!(polled.assigned.len(), 1);
        let job = &polled.assigned[0];
        assert_eq!(job.blocks.len(), 10);

        let mut output = block("c0", "t1", 1, 1_000);
        output.compaction_level = 1;
        let done = metastore
            .poll_compaction_jobs(PollCompactionJobsRequest {
                updates: vec![JobStatusUpdate {
                    name: job.name.clone(),
                    token: job.token,
                    outcome: JobOutcome::Success {
                        compacted: vec![output],
                    },
                }],
                capacity: 0,
            })
            .await
            .unwrap();
        assert!(done.rejected.is_empty());
        assert_eq!(metastore.index().block_count(), 1);

        let info = metastore.node_info().await.unwrap();
        assert_eq!(info.compaction.queued_blocks, 1);
        assert_eq!(info.compaction.in_progress_jobs, 0);
        metastore.shutdown().await;
    }
}
