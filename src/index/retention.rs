//! Time-based index retention
//!
//! The leader periodically lists the partition shards of the index and drops
//! the ones whose data has outlived the retention period of their tenant. A
//! plan is only valid in the term it was made in: the `TruncateIndex`
//! command carries the term and replicas ignore it if leadership has moved
//! on in the meantime.

use super::{BlockIndex, PartitionShard, TruncateResponse};
use crate::config::RetentionConfig;
use crate::error::{MetastoreError, Result};
use crate::raft::{CommandType, LeaderActivity, RaftNode, StateReader};
use crate::types::{PartitionTombstone, Tombstones};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Upper bound on tombstones in a single truncation
pub const DEFAULT_MAX_TOMBSTONES: usize = 1024;

/// Decides which partition shards are past retention.
///
/// A period of zero keeps the data forever. The anonymous tenant (`""`)
/// holds uncompacted multi-tenant blocks: its shards are only dropped once
/// no named tenant shard is left in the partition.
#[derive(Debug, Clone)]
pub struct TimeBasedRetentionPolicy {
    default_period: Option<i64>,
    overrides: HashMap<String, Option<i64>>,
    partition_duration: i64,
    max_tombstones: usize,
}

fn period_millis(period: Duration) -> Option<i64> {
    let millis = i64::try_from(period.as_millis()).unwrap_or(i64::MAX);
    (millis > 0).then_some(millis)
}

impl TimeBasedRetentionPolicy {
    /// Build the policy from configuration
    pub fn from_config(config: &RetentionConfig, partition_duration: i64) -> Self {
        Self {
            default_period: period_millis(config.period),
            overrides: config
                .tenant_overrides
                .iter()
                .map(|(tenant, o)| (tenant.clone(), period_millis(o.period)))
                .collect(),
            partition_duration,
            max_tombstones: DEFAULT_MAX_TOMBSTONES,
        }
    }

    /// Limit the number of tombstones per plan
    pub fn with_max_tombstones(mut self, max_tombstones: usize) -> Self {
        self.max_tombstones = max_tombstones;
        self
    }

    fn period(&self, tenant: &str) -> Option<i64> {
        match self.overrides.get(tenant) {
            Some(period) => *period,
            None => self.default_period,
        }
    }

    // Latest time before which some tenant's data may be deleted
    fn latest_cutoff(&self, now: i64) -> Option<i64> {
        self.default_period
            .into_iter()
            .chain(self.overrides.values().flatten().copied())
            .map(|period| now.saturating_sub(period))
            .max()
    }

    /// Tombstones for the shards past retention at `now` (unix millis).
    ///
    /// `shards` must be ordered by partition, as listed by
    /// [`BlockIndex::partitions`].
    pub fn create_tombstones(&self, now: i64, shards: &[PartitionShard]) -> Vec<PartitionTombstone> {
        let Some(latest) = self.latest_cutoff(now) else {
            debug!("No retention period defined, skipping");
            return Vec::new();
        };

        let mut tombstones = Vec::new();
        for partition in shards.chunk_by(|a, b| a.partition == b.partition) {
            let start = partition[0].partition;
            let end = start.saturating_add(self.partition_duration);
            if end > latest {
                // Later partitions end later still
                debug!(partition = start, "Partition has not passed retention, stopping");
                break;
            }

            let mut named = false;
            for shard in partition.iter().filter(|s| !s.tenant.is_empty()) {
                named = true;
                let Some(period) = self.period(&shard.tenant) else {
                    continue;
                };
                let cutoff = now.saturating_sub(period);
                if end <= cutoff && shard.range.max_time < cutoff {
                    tombstones.push(shard.tombstone());
                    if tombstones.len() >= self.max_tombstones {
                        return tombstones;
                    }
                }
            }
            if named {
                continue;
            }
            for shard in partition {
                tombstones.push(shard.tombstone());
                if tombstones.len() >= self.max_tombstones {
                    return tombstones;
                }
            }
        }
        tombstones
    }
}

fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

struct Worker {
    node: Arc<RaftNode>,
    reader: Arc<StateReader<RaftNode, RaftNode>>,
    index: Arc<BlockIndex>,
    policy: TimeBasedRetentionPolicy,
    timeout: Duration,
}

impl Worker {
    async fn cleanup(&self) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let now = unix_millis();
        let plan = self
            .reader
            .consistent_read(deadline, |tx, read_index| {
                let shards = self.index.partitions(tx)?;
                Ok(Tombstones {
                    term: read_index.term,
                    partitions: self.policy.create_tombstones(now, &shards),
                })
            })
            .await?;
        if plan.partitions.is_empty() {
            debug!("Nothing to delete");
            return Ok(0);
        }

        let planned = plan.partitions.len();
        let response = self.node.propose(CommandType::TruncateIndex, &plan).await?;
        let response: TruncateResponse = bincode::deserialize(&response)
            .map_err(|e| MetastoreError::serialization("TruncateResponse", e))?;
        if !response.accepted {
            warn!(term = plan.term, "Retention plan rejected, leadership changed");
            return Ok(0);
        }
        info!(
            shards = planned,
            blocks = response.removed_blocks,
            "Removed partition shards past retention"
        );
        Ok(planned)
    }
}

/// Runs retention passes while the node leads the cluster
pub struct RetentionCleaner {
    worker: Arc<Worker>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RetentionCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionCleaner")
            .field("interval", &self.interval)
            .field("running", &self.task.lock().is_some())
            .finish()
    }
}

impl RetentionCleaner {
    /// Create a cleaner; it does nothing until [`LeaderActivity::start`]
    pub fn new(
        node: Arc<RaftNode>,
        reader: Arc<StateReader<RaftNode, RaftNode>>,
        index: Arc<BlockIndex>,
        config: &RetentionConfig,
        timeout: Duration,
    ) -> Self {
        let policy = TimeBasedRetentionPolicy::from_config(config, index.partition_duration());
        Self {
            worker: Arc::new(Worker {
                node,
                reader,
                index,
                policy,
                timeout,
            }),
            interval: config.interval,
            task: Mutex::new(None),
        }
    }

    /// Run a single pass now; returns the number of shards removed
    pub async fn cleanup(&self) -> Result<usize> {
        self.worker.cleanup().await
    }
}

impl LeaderActivity for RetentionCleaner {
    fn start(&self) {
        let worker = self.worker.clone();
        let interval = self.interval;
        let span = tracing::info_span!("retention", node_id = worker.node.id());
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = worker.cleanup().await {
                        warn!(error = %e, "Retention pass failed");
                    }
                }
            }
            .instrument(span),
        );
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for RetentionCleaner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
