//! Compaction planner
//!
//! [`Compactor`] owns the block and job queues and keeps them in step with
//! two tables of the state machine:
//!
//! | Table | Key | Value |
//! |---|---|---|
//! | `compaction_jobs` | job name | [`CompactionJob`] |
//! | `compaction_block_queue` | log index, block id | [`QueuedBlock`] |
//!
//! Only staged blocks are persisted. Every command drains the sealed
//! batches into jobs before it commits, so the block queue is rebuilt on
//! restore by staging the persisted blocks again in key order. Blocks queued
//! by one command are staged in id order, which is also their key order.

use super::block_queue::{BlockQueue, PlannedBatch, QueuedBlock, TenantShard};
use super::job_queue::{CompactionJob, JobQueue, JobStatus};
use super::{AssignedJob, JobOutcome, PollCompactionJobsRequest, PollCompactionJobsResponse};
use crate::config::CompactionConfig;
use crate::error::{MetastoreError, Result};
use crate::fsm::{CommandContext, StateRestorer};
use crate::index::BlockIndex;
use crate::observability::compaction_span;
use crate::types::{BlockMeta, BlockQuery, CompactionStats};

use parking_lot::Mutex;
use redb::{ReadTransaction, ReadableTable, Table, TableDefinition, WriteTransaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use xxhash_rust::xxh64::Xxh64;

const COMPACTION_JOBS: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("compaction_jobs");
const COMPACTION_BLOCK_QUEUE: TableDefinition<'_, &[u8], &[u8]> =
    TableDefinition::new("compaction_block_queue");

type Rows<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn queued_block_key(index: u64, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + id.len());
    key.extend_from_slice(&index.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

/// Job name: level, shard and a hash of the batch contents.
///
/// A retried command producing the same batch maps to the same job.
fn job_name(batch: &PlannedBatch) -> String {
    let mut hasher = Xxh64::new(0);
    hasher.update(batch.key.tenant.as_bytes());
    for block in &batch.blocks {
        hasher.update(&[0]);
        hasher.update(block.id.as_bytes());
    }
    format!("L{}-S{}-{:016x}", batch.level, batch.key.shard, hasher.digest())
}

/// Name for a batch whose hashed name is taken by a different job.
///
/// Derived from the entry index so every replica picks the same one.
fn unique_job_name(jobs: &JobQueue, name: &str, index: u64) -> String {
    let base = format!("{name}-{index}");
    let mut candidate = base.clone();
    let mut attempt = 1u32;
    while jobs.get(&candidate).is_some() {
        candidate = format!("{base}-{attempt}");
        attempt += 1;
    }
    candidate
}

struct Tables<'txn> {
    jobs: Rows<'txn>,
    blocks: Rows<'txn>,
}

impl<'txn> Tables<'txn> {
    fn open(tx: &'txn WriteTransaction) -> Result<Self> {
        let jobs = tx
            .open_table(COMPACTION_JOBS)
            .map_err(|e| MetastoreError::storage_error("open compaction jobs", e))?;
        let blocks = tx
            .open_table(COMPACTION_BLOCK_QUEUE)
            .map_err(|e| MetastoreError::storage_error("open compaction block queue", e))?;
        Ok(Self { jobs, blocks })
    }

    fn put_job(&mut self, job: &CompactionJob) -> Result<()> {
        let value = bincode::serialize(job).map_err(|e| MetastoreError::serialization("CompactionJob", e))?;
        self.jobs
            .insert(job.name.as_bytes(), value.as_slice())
            .map_err(|e| MetastoreError::storage_error("write compaction job", e))?;
        Ok(())
    }

    fn delete_job(&mut self, name: &str) -> Result<()> {
        self.jobs
            .remove(name.as_bytes())
            .map_err(|e| MetastoreError::storage_error("delete compaction job", e))?;
        Ok(())
    }

    fn put_block(&mut self, block: &QueuedBlock) -> Result<()> {
        let value = bincode::serialize(block).map_err(|e| MetastoreError::serialization("QueuedBlock", e))?;
        self.blocks
            .insert(queued_block_key(block.index, &block.id).as_slice(), value.as_slice())
            .map_err(|e| MetastoreError::storage_error("write queued block", e))?;
        Ok(())
    }

    fn delete_block(&mut self, index: u64, id: &str) -> Result<()> {
        self.blocks
            .remove(queued_block_key(index, id).as_slice())
            .map_err(|e| MetastoreError::storage_error("delete queued block", e))?;
        Ok(())
    }
}

#[derive(Debug)]
struct Queues {
    blocks: BlockQueue,
    jobs: JobQueue,
}

/// Compaction planner and scheduler.
///
/// All mutations take the apply transaction and the command context; the
/// in-memory queues change together with the tables they mirror.
#[derive(Debug)]
pub struct Compactor {
    batch_size: usize,
    max_level: u32,
    max_failures: u32,
    max_batch_age: i64,
    lease: i64,
    index: Arc<BlockIndex>,
    queues: Mutex<Queues>,
}

impl Compactor {
    /// Create an empty planner over `index`
    pub fn new(config: &CompactionConfig, index: Arc<BlockIndex>) -> Self {
        let max_batch_age = millis(config.max_batch_age);
        let lease = millis(config.job_lease);
        Self {
            batch_size: config.batch_size,
            max_level: config.max_level,
            max_failures: config.max_failures,
            max_batch_age,
            lease,
            index,
            queues: Mutex::new(Queues {
                blocks: BlockQueue::new(config.batch_size, max_batch_age),
                jobs: JobQueue::new(lease),
            }),
        }
    }

    /// Stage new blocks and turn complete batches into jobs.
    ///
    /// Blocks at `max_level` or above are final and are not staged.
    pub fn add_blocks(&self, tx: &WriteTransaction, ctx: &CommandContext, blocks: &[BlockMeta]) -> Result<()> {
        let mut queues = self.queues.lock();
        let mut tables = Tables::open(tx)?;
        self.stage(&mut queues, &mut tables, ctx, blocks)
    }

    fn stage(
        &self,
        queues: &mut Queues,
        tables: &mut Tables<'_>,
        ctx: &CommandContext,
        blocks: &[BlockMeta],
    ) -> Result<()> {
        for block in blocks {
            if block.compaction_level >= self.max_level {
                trace!(block = %block.id, level = block.compaction_level, "Block is not compacted further");
                continue;
            }
            let queued = QueuedBlock {
                id: block.id.clone(),
                tenant: block.tenant.clone(),
                shard: block.shard,
                level: block.compaction_level,
                index: ctx.index,
                appended_at: ctx.appended_at,
            };
            if queues.blocks.push(&queued) {
                tables.put_block(&queued)?;
            }
        }

        while let Some(batch) = queues.blocks.next_batch() {
            for entry in &batch.blocks {
                tables.delete_block(entry.index, &entry.id)?;
            }
            let mut job = CompactionJob {
                name: job_name(&batch),
                tenant: batch.key.tenant.clone(),
                shard: batch.key.shard,
                level: batch.level,
                status: JobStatus::Initial,
                lease_expires_at: 0,
                token: 0,
                failures: 0,
                blocks: batch.blocks.into_iter().map(|b| b.id).collect(),
                added_at: ctx.appended_at,
            };
            let _span = compaction_span("create_job", &job.tenant, job.shard, job.level).entered();
            if let Some(existing) = queues.jobs.get(&job.name) {
                if existing.tenant == job.tenant && existing.blocks == job.blocks {
                    debug!(job = %job.name, "Compaction job already exists");
                    continue;
                }
                let name = unique_job_name(&queues.jobs, &job.name, ctx.index);
                warn!(job = %job.name, renamed = %name, "Compaction job name collision");
                job.name = name;
            }
            tables.put_job(&job)?;
            debug!(job = %job.name, blocks = job.blocks.len(), "Created compaction job");
            queues.jobs.enqueue(job);
        }
        Ok(())
    }

    /// Drop blocks removed from the index from the staging queue
    pub fn forget_blocks(&self, tx: &WriteTransaction, blocks: &[BlockMeta]) -> Result<()> {
        let mut queues = self.queues.lock();
        let mut tables = Tables::open(tx)?;
        for block in blocks {
            let key = TenantShard::new(block.tenant.clone(), block.shard);
            if let Some(entry) = queues.blocks.remove(block.compaction_level, &key, &block.id) {
                tables.delete_block(entry.index, &entry.id)?;
            }
        }
        Ok(())
    }

    /// Apply worker reports, then lease up to `capacity` jobs.
    ///
    /// The entry index is the fencing token of every job leased by this
    /// command; leases are measured from the entry's timestamp.
    pub fn poll(
        &self,
        tx: &WriteTransaction,
        ctx: &CommandContext,
        request: PollCompactionJobsRequest,
    ) -> Result<PollCompactionJobsResponse> {
        let mut queues = self.queues.lock();
        let mut tables = Tables::open(tx)?;
        let mut response = PollCompactionJobsResponse::default();
        let mut outputs = Vec::new();

        for update in request.updates {
            let name = update.name;
            match update.outcome {
                JobOutcome::InProgress => {
                    if !queues.jobs.update(&name, ctx.appended_at, update.token) {
                        response.rejected.push(name);
                        continue;
                    }
                    if let Some(job) = queues.jobs.get(&name) {
                        tables.put_job(job)?;
                    }
                }
                JobOutcome::Success { compacted } => {
                    if !queues.jobs.is_owner(&name, update.token) {
                        response.rejected.push(name);
                        continue;
                    }
                    if let Some(invalid) = compacted.iter().find_map(|b| b.validate().err()) {
                        warn!(job = %name, error = %invalid, "Rejecting malformed compaction output");
                        response.rejected.push(name);
                        continue;
                    }
                    let Some(job) = queues.jobs.evict(&name, update.token) else {
                        response.rejected.push(name);
                        continue;
                    };
                    tables.delete_job(&job.name)?;
                    self.index
                        .replace_blocks(tx, &job.tenant, job.shard, &compacted, &job.blocks)?;
                    let _span = compaction_span("complete_job", &job.tenant, job.shard, job.level).entered();
                    debug!(job = %job.name, outputs = compacted.len(), "Compaction job completed");
                    outputs.extend(compacted);
                }
                JobOutcome::Failure => match queues.jobs.fail(&name, update.token, self.max_failures) {
                    Some(job) => {
                        let _span = compaction_span("fail_job", &job.tenant, job.shard, job.level).entered();
                        if job.status == JobStatus::Cancelled {
                            warn!(job = %job.name, failures = job.failures, "Compaction job cancelled");
                        } else {
                            debug!(job = %job.name, failures = job.failures, "Compaction job failed, will retry");
                        }
                        tables.put_job(&job)?;
                    }
                    None => response.rejected.push(name),
                },
            }
        }

        outputs.sort_by(|a, b| a.id.cmp(&b.id));
        self.stage(&mut queues, &mut tables, ctx, &outputs)?;

        while response.assigned.len() < request.capacity {
            let Some(job) = queues.jobs.dequeue(ctx.appended_at, ctx.index) else {
                break;
            };
            let query = BlockQuery {
                tenant: job.tenant.clone(),
                shard: job.shard,
                blocks: job.blocks.clone(),
            };
            let blocks = self.index.get_blocks(tx, &query)?;
            if blocks.is_empty() {
                warn!(job = %job.name, "Source blocks are gone, dropping compaction job");
                queues.jobs.evict(&job.name, u64::MAX);
                tables.delete_job(&job.name)?;
                continue;
            }
            tables.put_job(&job)?;
            response.assigned.push(AssignedJob {
                name: job.name,
                tenant: job.tenant,
                shard: job.shard,
                level: job.level,
                token: job.token,
                lease_expires_at: job.lease_expires_at,
                blocks,
            });
        }

        if !response.assigned.is_empty() || !response.rejected.is_empty() {
            debug!(
                assigned = response.assigned.len(),
                rejected = response.rejected.len(),
                token = ctx.index,
                "Polled compaction jobs"
            );
        }
        Ok(response)
    }

    /// Look up a job
    pub fn job(&self, name: &str) -> Option<CompactionJob> {
        self.queues.lock().jobs.get(name).cloned()
    }

    /// All jobs, lowest level first, in priority order
    pub fn jobs(&self) -> Vec<CompactionJob> {
        self.queues.lock().jobs.iter().cloned().collect()
    }

    /// Queue counters
    pub fn stats(&self) -> CompactionStats {
        let queues = self.queues.lock();
        CompactionStats {
            queued_blocks: queues.blocks.len(),
            pending_jobs: queues.jobs.count(JobStatus::Initial),
            in_progress_jobs: queues.jobs.count(JobStatus::InProgress),
            cancelled_jobs: queues.jobs.count(JobStatus::Cancelled),
        }
    }
}

impl StateRestorer for Compactor {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn init(&self, tx: &WriteTransaction) -> Result<()> {
        Tables::open(tx).map(drop)
    }

    fn restore(&self, tx: &ReadTransaction) -> Result<()> {
        let mut jobs = JobQueue::new(self.lease);
        let table = tx
            .open_table(COMPACTION_JOBS)
            .map_err(|e| MetastoreError::storage_error("open compaction jobs", e))?;
        for row in table
            .iter()
            .map_err(|e| MetastoreError::storage_error("scan compaction jobs", e))?
        {
            let (_, value) = row.map_err(|e| MetastoreError::storage_error("read compaction job", e))?;
            let job: CompactionJob = bincode::deserialize(value.value())
                .map_err(|e| MetastoreError::serialization("CompactionJob", e))?;
            jobs.enqueue(job);
        }

        let mut blocks = BlockQueue::new(self.batch_size, self.max_batch_age);
        let table = tx
            .open_table(COMPACTION_BLOCK_QUEUE)
            .map_err(|e| MetastoreError::storage_error("open compaction block queue", e))?;
        for row in table
            .iter()
            .map_err(|e| MetastoreError::storage_error("scan compaction block queue", e))?
        {
            let (_, value) = row.map_err(|e| MetastoreError::storage_error("read queued block", e))?;
            let block: QueuedBlock = bincode::deserialize(value.value())
                .map_err(|e| MetastoreError::serialization("QueuedBlock", e))?;
            blocks.restore(&block);
        }

        info!(jobs = jobs.len(), blocks = blocks.len(), "Compaction queues restored");
        *self.queues.lock() = Queues { blocks, jobs };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::JobStatusUpdate;
    use crate::types::Dataset;
    use pretty_assertions::assert_eq;
    use redb::Database;
    use tempfile::TempDir;

    const LEASE: i64 = 15_000;

    struct Fixture {
        dir: TempDir,
        db: Database,
        index: Arc<BlockIndex>,
        compactor: Compactor,
        config: CompactionConfig,
        next_index: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(CompactionConfig::default())
        }

        fn with_config(config: CompactionConfig) -> Self {
            let dir = TempDir::new().unwrap();
            let db = Database::create(dir.path().join("fsm.db")).unwrap();
            let index = Arc::new(BlockIndex::new(Duration::from_secs(6 * 3600)));
            let compactor = Compactor::new(&config, index.clone());
            let tx = db.begin_write().unwrap();
            index.init(&tx).unwrap();
            compactor.init(&tx).unwrap();
            tx.commit().unwrap();
            Self {
                dir,
                db,
                index,
                compactor,
                config,
                next_index: 1,
            }
        }

        fn apply<T>(&mut self, appended_at: i64, f: impl FnOnce(&Self, &WriteTransaction, &CommandContext) -> T) -> T {
            let ctx = CommandContext {
                index: self.next_index,
                term: 1,
                appended_at,
            };
            self.next_index += 1;
            let tx = self.db.begin_write().unwrap();
            let out = f(self, &tx, &ctx);
            tx.commit().unwrap();
            out
        }

        fn add(&mut self, block: BlockMeta, appended_at: i64) {
            self.apply(appended_at, |f, tx, ctx| {
                if f.index.insert_block(tx, &block).unwrap() {
                    f.compactor.add_blocks(tx, ctx, &[block]).unwrap();
                }
            });
        }

        fn poll(&mut self, appended_at: i64, updates: Vec<JobStatusUpdate>, capacity: usize) -> PollCompactionJobsResponse {
            self.apply(appended_at, |f, tx, ctx| {
                f.compactor
                    .poll(tx, ctx, PollCompactionJobsRequest { updates, capacity })
                    .unwrap()
            })
        }

        fn reopen(self) -> Fixture {
            let Fixture {
                dir,
                db,
                config,
                next_index,
                ..
            } = self;
            let index = Arc::new(BlockIndex::new(Duration::from_secs(6 * 3600)));
            let compactor = Compactor::new(&config, index.clone());
            {
                let tx = db.begin_read().unwrap();
                index.restore(&tx).unwrap();
                compactor.restore(&tx).unwrap();
            }
            Fixture {
                dir,
                db,
                index,
                compactor,
                config,
                next_index,
            }
        }
    }

    fn block(id: &str, shard: u32, level: u32) -> BlockMeta {
        BlockMeta {
            id: id.to_string(),
            tenant: "tenant-a".to_string(),
            shard,
            compaction_level: level,
            min_time: 1_000,
            max_time: 2_000,
            size: 1024,
            datasets: vec![Dataset {
                name: "svc".to_string(),
                labels: vec![],
            }],
        }
    }

    fn update(name: &str, token: u64, outcome: JobOutcome) -> JobStatusUpdate {
        JobStatusUpdate {
            name: name.to_string(),
            token,
            outcome,
        }
    }

    #[test]
    fn full_batch_becomes_a_job() {
        let mut f = Fixture::new();
        for i in 0..9 {
            f.add(block(&format!("b{i:02}"), 1, 0), 1_000);
        }
        assert_eq!(f.compactor.stats().queued_blocks, 9);
        assert!(f.compactor.jobs().is_empty());

        f.add(block("b09", 1, 0), 1_000);
        let jobs = f.compactor.jobs();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert!(job.name.starts_with("L0-S1-"), "{}", job.name);
        assert_eq!(job.status, JobStatus::Initial);
        assert_eq!(job.blocks, (0..10).map(|i| format!("b{i:02}")).collect::<Vec<_>>());
        assert_eq!(
            f.compactor.stats(),
            CompactionStats {
                queued_blocks: 0,
                pending_jobs: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn restaged_batch_maps_to_the_existing_job() {
        let mut f = Fixture::new();
        let blocks: Vec<_> = (0..10).map(|i| block(&format!("b{i}"), 1, 0)).collect();
        for b in &blocks {
            f.add(b.clone(), 1_000);
        }
        let before = f.compactor.jobs();
        assert_eq!(before.len(), 1);

        f.apply(2_000, |f, tx, ctx| f.compactor.add_blocks(tx, ctx, &blocks).unwrap());
        assert_eq!(f.compactor.jobs(), before);
        assert_eq!(f.compactor.stats().queued_blocks, 0);

        let f = f.reopen();
        assert_eq!(f.compactor.jobs(), before);
        assert_eq!(f.compactor.stats().queued_blocks, 0);
    }

    #[test]
    fn colliding_job_name_keeps_the_batch() {
        let mut f = Fixture::new();
        let blocks: Vec<_> = (0..10).map(|i| block(&format!("b{i}"), 1, 0)).collect();
        for b in &blocks {
            f.add(b.clone(), 1_000);
        }
        let original = f.compactor.jobs().remove(0);
        {
            // Another batch already owns the hashed name
            let mut queues = f.compactor.queues.lock();
            queues.jobs.clear();
            queues.jobs.enqueue(CompactionJob {
                blocks: vec!["other".to_string()],
                ..original.clone()
            });
        }

        f.apply(2_000, |f, tx, ctx| f.compactor.add_blocks(tx, ctx, &blocks).unwrap());
        let renamed = format!("{}-11", original.name);
        let job = f.compactor.job(&renamed).unwrap();
        assert_eq!(job.blocks, original.blocks);
        assert_eq!(job.added_at, 2_000);
        assert_eq!(f.compactor.jobs().len(), 2);
        assert_eq!(f.compactor.stats().queued_blocks, 0);

        let f = f.reopen();
        assert_eq!(f.compactor.job(&renamed).unwrap().blocks, original.blocks);
    }

    #[test]
    fn final_level_is_not_staged() {
        let mut f = Fixture::new();
        f.add(block("done", 1, 3), 1_000);
        assert_eq!(f.compactor.stats().queued_blocks, 0);
        assert_eq!(f.index.block_count(), 1);
    }

    #[test]
    fn poll_leases_with_entry_fencing_token() {
        let mut f = Fixture::new();
        for i in 0..10 {
            f.add(block(&format!("b{i}"), 1, 0), 1_000);
        }

        let first = f.poll(5_000, vec![], 2);
        assert_eq!(first.assigned.len(), 1);
        let job = &first.assigned[0];
        assert_eq!(job.token, 11);
        assert_eq!(job.lease_expires_at, 5_000 + LEASE);
        assert_eq!(job.blocks.len(), 10);

        // Lease still held
        assert!(f.poll(6_000, vec![], 1).assigned.is_empty());

        // Expired: another worker takes over with a newer token
        let second = f.poll(5_000 + LEASE, vec![], 1);
        assert_eq!(second.assigned.len(), 1);
        assert_eq!(second.assigned[0].token, 13);

        // The previous owner is fenced off
        let stale = f.poll(21_000, vec![update(&job.name, 11, JobOutcome::InProgress)], 0);
        assert_eq!(stale.rejected, vec![job.name.clone()]);

        let renewed = f.poll(21_000, vec![update(&job.name, 13, JobOutcome::InProgress)], 0);
        assert!(renewed.rejected.is_empty());
        assert_eq!(f.compactor.job(&job.name).unwrap().lease_expires_at, 21_000 + LEASE);
    }

    #[test]
    fn success_replaces_sources_and_stages_outputs() {
        let mut f = Fixture::new();
        for i in 0..10 {
            f.add(block(&format!("b{i}"), 1, 0), 1_000);
        }
        let job = f.poll(2_000, vec![], 1).assigned.remove(0);

        let outputs = vec![block("c1", 1, 1), block("c0", 1, 1)];
        let response = f.poll(
            3_000,
            vec![update(&job.name, job.token, JobOutcome::Success { compacted: outputs })],
            1,
        );
        assert!(response.rejected.is_empty());
        assert!(response.assigned.is_empty());
        assert!(f.compactor.job(&job.name).is_none());

        let tx = f.db.begin_read().unwrap();
        assert!(f.index.find_block(&tx, "tenant-a", 1, "b0").unwrap().is_none());
        assert!(f.index.find_block(&tx, "tenant-a", 1, "c0").unwrap().is_some());
        assert_eq!(f.index.block_count(), 2);
        assert_eq!(f.compactor.stats().queued_blocks, 2);
    }

    #[test]
    fn failures_retry_then_cancel() {
        let mut f = Fixture::new();
        for i in 0..10 {
            f.add(block(&format!("b{i}"), 1, 0), 1_000);
        }

        let mut now = 2_000;
        for attempt in 1..=3 {
            let job = f.poll(now, vec![], 1).assigned.remove(0);
            now += 1_000;
            let response = f.poll(now, vec![update(&job.name, job.token, JobOutcome::Failure)], 0);
            assert!(response.rejected.is_empty());
            let stored = f.compactor.job(&job.name).unwrap();
            assert_eq!(stored.failures, attempt);
        }

        let stats = f.compactor.stats();
        assert_eq!(stats.cancelled_jobs, 1);
        assert_eq!(stats.pending_jobs, 0);
        assert!(f.poll(now, vec![], 1).assigned.is_empty());
    }

    #[test]
    fn jobs_without_blocks_are_dropped_on_assignment() {
        let mut f = Fixture::new();
        for i in 0..10 {
            f.add(block(&format!("b{i}"), 1, 0), 1_000);
        }
        f.apply(2_000, |f, tx, _| {
            for i in 0..10 {
                f.index.remove_block(tx, "tenant-a", 1, &format!("b{i}")).unwrap();
            }
        });

        assert!(f.poll(3_000, vec![], 1).assigned.is_empty());
        assert!(f.compactor.jobs().is_empty());
    }

    #[test]
    fn forgotten_blocks_leave_the_queue() {
        let mut f = Fixture::new();
        let blocks: Vec<_> = (0..3).map(|i| block(&format!("b{i}"), 1, 0)).collect();
        for b in &blocks {
            f.add(b.clone(), 1_000);
        }
        f.apply(2_000, |f, tx, _| f.compactor.forget_blocks(tx, &blocks[..2]).unwrap());
        assert_eq!(f.compactor.stats().queued_blocks, 1);

        let f = f.reopen();
        assert_eq!(f.compactor.stats().queued_blocks, 1);
    }

    #[test]
    fn restore_rebuilds_queues() {
        let mut f = Fixture::new();
        for i in 0..14 {
            f.add(block(&format!("b{i:02}"), 1, 0), 1_000);
        }
        let leased = f.poll(2_000, vec![], 1).assigned.remove(0);
        let before = (f.compactor.stats(), f.compactor.jobs());

        let mut f = f.reopen();
        assert_eq!((f.compactor.stats(), f.compactor.jobs()), before);

        // Restored staging continues where it left off
        for i in 14..20 {
            f.add(block(&format!("b{i:02}"), 1, 0), 3_000);
        }
        let jobs = f.compactor.jobs();
        assert_eq!(jobs.len(), 2);
        let fresh = jobs.iter().find(|j| j.name != leased.name).unwrap();
        assert_eq!(fresh.blocks, (10..20).map(|i| format!("b{i:02}")).collect::<Vec<_>>());
    }

    #[test]
    fn aged_batches_are_flushed() {
        let mut f = Fixture::with_config(CompactionConfig {
            max_batch_age: Duration::from_secs(60),
            ..CompactionConfig::default()
        });
        f.add(block("old", 1, 0), 1_000);
        f.add(block("other", 2, 0), 30_000);
        assert!(f.compactor.jobs().is_empty());

        f.add(block("late", 2, 0), 61_000);
        let jobs = f.compactor.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].blocks, vec!["old".to_string()]);
        assert_eq!(f.compactor.stats().queued_blocks, 2);
    }
}
