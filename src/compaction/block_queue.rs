//! Staging queue for blocks awaiting compaction
//!
//! Blocks are grouped by compaction key (tenant, shard, level). Each key has
//! a staging batch that accumulates blocks in arrival order; once it holds
//! `batch_size` blocks, or has not been sealed for `max_batch_age`, it is
//! sealed and linked into two lists:
//!
//! - the global list of the level, in the order batches were sealed, and
//! - the local list of its key.
//!
//! Batches live in an arena and are linked by slot index. Removing a block
//! clears its slot instead of shifting the batch, so the positions recorded
//! in the per-key block map stay valid. A batch that becomes empty is
//! unlinked and its arena slot is reused.
//!
//! A staging batch is as old as the oldest block it holds, whatever order
//! the blocks arrived in, so a queue rebuilt from storage ages exactly like
//! the one it was persisted from.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::trace;

/// Tenant and shard a block belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantShard {
    /// Tenant
    pub tenant: String,
    /// Shard
    pub shard: u32,
}

impl TenantShard {
    /// Build a key
    pub fn new(tenant: impl Into<String>, shard: u32) -> Self {
        Self {
            tenant: tenant.into(),
            shard,
        }
    }
}

/// A block waiting in the queue, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedBlock {
    /// Block id
    pub id: String,
    /// Tenant of the block
    pub tenant: String,
    /// Shard of the block
    pub shard: u32,
    /// Compaction level of the block
    pub level: u32,
    /// Log index of the entry that queued the block
    pub index: u64,
    /// Unix millis of that entry
    pub appended_at: i64,
}

/// Block reference stored in a batch slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    /// Block id
    pub id: String,
    /// Log index of the entry that queued the block
    pub index: u64,
    /// Unix millis of that entry
    pub appended_at: i64,
}

/// Blocks taken from the queue to form one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    /// Compaction level
    pub level: u32,
    /// Tenant and shard
    pub key: TenantShard,
    /// Blocks in arrival order
    pub blocks: Vec<BlockEntry>,
}

type BatchId = usize;

#[derive(Debug, Default)]
struct Batch {
    key: Option<TenantShard>,
    // `None` marks a removed block
    blocks: Vec<Option<BlockEntry>>,
    size: usize,
    created_at: i64,
    sealed: bool,
    // Global list of the level
    prev_g: Option<BatchId>,
    next_g: Option<BatchId>,
    // Local list of the key
    prev: Option<BatchId>,
    next: Option<BatchId>,
}

#[derive(Debug)]
struct Staged {
    head: Option<BatchId>,
    tail: Option<BatchId>,
    batch: BatchId,
    refs: HashMap<String, (BatchId, usize)>,
}

#[derive(Debug, Default)]
struct LevelQueue {
    arena: Vec<Batch>,
    free: Vec<BatchId>,
    staged: BTreeMap<TenantShard, Staged>,
    head: Option<BatchId>,
    tail: Option<BatchId>,
    // Non-empty staging batches by creation time
    aging: BTreeSet<(i64, TenantShard)>,
}

fn alloc(arena: &mut Vec<Batch>, free: &mut Vec<BatchId>, key: &TenantShard) -> BatchId {
    let batch = Batch {
        key: Some(key.clone()),
        ..Batch::default()
    };
    match free.pop() {
        Some(id) => {
            arena[id] = batch;
            id
        }
        None => {
            arena.push(batch);
            arena.len() - 1
        }
    }
}

impl LevelQueue {
    fn release(&mut self, id: BatchId) {
        self.arena[id] = Batch::default();
        self.free.push(id);
    }

    fn push(&mut self, key: &TenantShard, entry: BlockEntry) -> Option<BatchId> {
        let (arena, free) = (&mut self.arena, &mut self.free);
        let staged = self.staged.entry(key.clone()).or_insert_with(|| Staged {
            head: None,
            tail: None,
            batch: alloc(arena, free, key),
            refs: HashMap::new(),
        });
        if staged.refs.contains_key(&entry.id) {
            return None;
        }
        let id = staged.batch;
        let batch = &mut self.arena[id];
        staged.refs.insert(entry.id.clone(), (id, batch.blocks.len()));

        // A staging batch is as old as its oldest block
        if batch.size == 0 {
            batch.created_at = entry.appended_at;
            self.aging.insert((entry.appended_at, key.clone()));
        } else if entry.appended_at < batch.created_at {
            self.aging.remove(&(batch.created_at, key.clone()));
            batch.created_at = entry.appended_at;
            self.aging.insert((entry.appended_at, key.clone()));
        }
        batch.blocks.push(Some(entry));
        batch.size += 1;
        Some(id)
    }

    /// Seal the staging batch of `key` and start a new one
    fn seal(&mut self, key: &TenantShard) {
        let Some(staged) = self.staged.get(key) else {
            return;
        };
        let id = staged.batch;
        if self.arena[id].size == 0 {
            return;
        }
        let created_at = self.arena[id].created_at;
        self.aging.remove(&(created_at, key.clone()));

        // Global list
        self.arena[id].prev_g = self.tail;
        match self.tail {
            Some(tail) => self.arena[tail].next_g = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);

        // Local list
        let next = alloc(&mut self.arena, &mut self.free, key);
        let Some(staged) = self.staged.get_mut(key) else {
            return;
        };
        let local_tail = staged.tail;
        staged.tail = Some(id);
        if staged.head.is_none() {
            staged.head = Some(id);
        }
        staged.batch = next;
        self.arena[id].prev = local_tail;
        if let Some(tail) = local_tail {
            self.arena[tail].next = Some(id);
        }
        self.arena[id].sealed = true;
        trace!(tenant = %key.tenant, shard = key.shard, batch = id, "Sealed batch");
    }

    fn unlink(&mut self, id: BatchId) {
        let (prev_g, next_g, prev, next) = {
            let batch = &self.arena[id];
            (batch.prev_g, batch.next_g, batch.prev, batch.next)
        };
        match prev_g {
            Some(p) => self.arena[p].next_g = next_g,
            None => self.head = next_g,
        }
        match next_g {
            Some(n) => self.arena[n].prev_g = prev_g,
            None => self.tail = prev_g,
        }
        if let Some(staged) = self.arena[id].key.clone().and_then(|k| self.staged.get_mut(&k)) {
            if prev.is_none() {
                staged.head = next;
            }
            if next.is_none() {
                staged.tail = prev;
            }
        }
        if let Some(p) = prev {
            self.arena[p].next = next;
        }
        if let Some(n) = next {
            self.arena[n].prev = prev;
        }
    }

    fn remove(&mut self, key: &TenantShard, block: &str) -> Option<BlockEntry> {
        let staged = self.staged.get_mut(key)?;
        let (id, slot) = staged.refs.remove(block)?;
        let refs_left = staged.refs.len();

        let batch = &mut self.arena[id];
        let is_staging = !batch.sealed;
        let entry = batch.blocks[slot].take();
        batch.size -= 1;
        let emptied = batch.size == 0;
        let created_at = batch.created_at;

        if is_staging && !emptied {
            let oldest = batch.blocks.iter().flatten().map(|e| e.appended_at).min();
            if let Some(oldest) = oldest.filter(|t| *t != created_at) {
                batch.created_at = oldest;
                self.aging.remove(&(created_at, key.clone()));
                self.aging.insert((oldest, key.clone()));
            }
        }
        if emptied {
            if is_staging {
                batch.blocks.clear();
                self.aging.remove(&(created_at, key.clone()));
            } else {
                self.unlink(id);
                self.release(id);
            }
        }
        if refs_left == 0 {
            // Nothing references the key any more, sealed batches included
            if let Some(staged) = self.staged.remove(key) {
                let batch = staged.batch;
                self.aging.remove(&(self.arena[batch].created_at, key.clone()));
                self.release(batch);
            }
        }
        entry
    }

    /// Keys whose staging batch was created at or before `cutoff`
    fn aged(&self, cutoff: i64) -> Vec<TenantShard> {
        self.aging
            .iter()
            .take_while(|(created_at, _)| *created_at <= cutoff)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Up to `limit` unique blocks of `key`, walking its sealed batches
    /// from the oldest
    fn collect(&self, key: &TenantShard, limit: usize) -> Vec<BlockEntry> {
        let mut visited = HashSet::new();
        let mut blocks = Vec::new();
        let mut cursor = self.staged.get(key).and_then(|s| s.head);
        while let Some(id) = cursor {
            for entry in self.arena[id].blocks.iter().flatten() {
                if blocks.len() == limit {
                    return blocks;
                }
                if visited.insert(entry.id.as_str()) {
                    blocks.push(entry.clone());
                }
            }
            cursor = self.arena[id].next;
        }
        blocks
    }

    fn blocks(&self) -> usize {
        self.staged.values().map(|s| s.refs.len()).sum()
    }

    fn sealed(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            count += 1;
            cursor = self.arena[id].next_g;
        }
        count
    }
}

/// Blocks staged for compaction, per level
#[derive(Debug)]
pub struct BlockQueue {
    batch_size: usize,
    max_batch_age: i64,
    // Indexed by level, grown on demand
    levels: Vec<Option<LevelQueue>>,
}

impl BlockQueue {
    /// Create a queue sealing batches at `batch_size` blocks, or after
    /// `max_batch_age` millis (zero disables age-based sealing)
    pub fn new(batch_size: usize, max_batch_age: i64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_batch_age,
            levels: Vec::new(),
        }
    }

    fn level_mut(&mut self, level: u32) -> &mut LevelQueue {
        let level = level as usize;
        if level >= self.levels.len() {
            self.levels.resize_with(level + 1, || None);
        }
        self.levels[level].get_or_insert_with(LevelQueue::default)
    }

    /// Stage a block. Returns false if it is already queued.
    ///
    /// The block's staging batch is sealed once full; with age-based sealing
    /// enabled, every staging batch of the level older than
    /// `block.appended_at - max_batch_age` is sealed as well.
    pub fn push(&mut self, block: &QueuedBlock) -> bool {
        let batch_size = self.batch_size;
        let max_batch_age = self.max_batch_age;
        let key = TenantShard::new(block.tenant.clone(), block.shard);
        let level = self.level_mut(block.level);

        let entry = BlockEntry {
            id: block.id.clone(),
            index: block.index,
            appended_at: block.appended_at,
        };
        let Some(batch) = level.push(&key, entry) else {
            return false;
        };
        if level.arena[batch].size >= batch_size {
            level.seal(&key);
        }
        if max_batch_age > 0 {
            for aged in level.aged(block.appended_at - max_batch_age) {
                level.seal(&aged);
            }
        }
        true
    }

    /// Stage a block loaded from storage. Never seals: persisted blocks are
    /// the contents of staging batches.
    pub fn restore(&mut self, block: &QueuedBlock) -> bool {
        let key = TenantShard::new(block.tenant.clone(), block.shard);
        let entry = BlockEntry {
            id: block.id.clone(),
            index: block.index,
            appended_at: block.appended_at,
        };
        self.level_mut(block.level)
            .push(&key, entry)
            .is_some()
    }

    /// Remove a block from wherever it is queued
    pub fn remove(&mut self, level: u32, key: &TenantShard, block: &str) -> Option<BlockEntry> {
        self.levels
            .get_mut(level as usize)?
            .as_mut()?
            .remove(key, block)
    }

    /// Take the blocks of the oldest sealed batch, lowest level first.
    ///
    /// The batch is topped up to `batch_size` with blocks from later sealed
    /// batches of the same key. Taken blocks leave the queue.
    pub fn next_batch(&mut self) -> Option<PlannedBatch> {
        let batch_size = self.batch_size;
        let (level, queue) = self
            .levels
            .iter_mut()
            .enumerate()
            .find_map(|(i, l)| l.as_mut().filter(|q| q.head.is_some()).map(|q| (i, q)))?;

        let head = queue.head?;
        let key = queue.arena[head].key.clone()?;
        let blocks = queue.collect(&key, batch_size);
        for entry in &blocks {
            queue.remove(&key, &entry.id);
        }
        Some(PlannedBatch {
            level: level as u32,
            key,
            blocks,
        })
    }

    /// Whether `block` is queued under `key` at `level`
    pub fn contains(&self, level: u32, key: &TenantShard, block: &str) -> bool {
        self.levels
            .get(level as usize)
            .and_then(Option::as_ref)
            .and_then(|q| q.staged.get(key))
            .is_some_and(|s| s.refs.contains_key(block))
    }

    /// Number of queued blocks
    pub fn len(&self) -> usize {
        self.levels.iter().flatten().map(LevelQueue::blocks).sum()
    }

    /// Check if no block is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sealed batches not yet planned
    pub fn sealed_batches(&self) -> usize {
        self.levels.iter().flatten().map(LevelQueue::sealed).sum()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.levels.clear();
    }
}
