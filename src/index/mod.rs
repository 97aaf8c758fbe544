//! Block index
//!
//! Block metadata is partitioned by time: a block lands in the partition
//! window containing its `min_time`, then in the shard of its tenant. Three
//! tables back the index:
//!
//! | Table | Key | Value |
//! |---|---|---|
//! | `index_blocks` | partition, shard, tenant, block id | [`BlockMeta`] |
//! | `index_shards` | partition, shard, tenant | [`ShardRange`] |
//! | `index_locations` | shard, tenant, block id | partition |
//!
//! Integers are big-endian so keys sort by partition, then shard. Tenants
//! are length-prefixed, so no tenant key is a prefix of another.
//!
//! Reads go through [`IndexReader`], implemented for both transaction kinds:
//! the query path reads through the consistent read transaction, command
//! handlers through the apply transaction.

pub mod retention;

use crate::error::{MetastoreError, Result};
use crate::fsm::StateRestorer;
use crate::types::{BlockMeta, BlockQuery, MetadataQuery, PartitionTombstone, SERVICE_NAME_LABEL};

use redb::{ReadOnlyTable, ReadTransaction, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

type Key = &'static [u8];

const INDEX_BLOCKS: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("index_blocks");
const INDEX_SHARDS: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("index_shards");
const INDEX_LOCATIONS: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("index_locations");

/// Time span and size of a partition shard
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardRange {
    /// Earliest `min_time` of the blocks ever added
    pub min_time: i64,
    /// Latest `max_time` of the blocks ever added
    pub max_time: i64,
    /// Blocks currently in the shard
    pub blocks: u64,
}

/// A shard of a partition, as listed by [`BlockIndex::partitions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionShard {
    /// Partition start, unix millis
    pub partition: i64,
    /// Tenant
    pub tenant: String,
    /// Shard
    pub shard: u32,
    /// Time span and size
    pub range: ShardRange,
}

impl PartitionShard {
    /// Tombstone removing this shard
    pub fn tombstone(&self) -> PartitionTombstone {
        PartitionTombstone {
            partition: self.partition,
            tenant: self.tenant.clone(),
            shard: self.shard,
        }
    }
}

/// Response of the `TruncateIndex` command
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TruncateResponse {
    /// False if the plan was made in another term and was dropped
    pub accepted: bool,
    /// Term of the entry that carried the plan
    pub term: u64,
    /// Blocks removed from the index
    pub removed_blocks: usize,
}

/// Transaction the index can be read through
pub trait IndexReader {
    /// Table type opened by the transaction
    type Handle<'a>: ReadableTable<Key, Key>
    where
        Self: 'a;

    /// Open an index table
    fn index_table(&self, definition: TableDefinition<'_, Key, Key>) -> Result<Self::Handle<'_>>;
}

impl IndexReader for ReadTransaction {
    type Handle<'a> = ReadOnlyTable<Key, Key>;

    fn index_table(&self, definition: TableDefinition<'_, Key, Key>) -> Result<Self::Handle<'_>> {
        self.open_table(definition)
            .map_err(|e| MetastoreError::storage_error("open index table", e))
    }
}

impl IndexReader for WriteTransaction {
    type Handle<'a> = Table<'a, Key, Key>;

    fn index_table(&self, definition: TableDefinition<'_, Key, Key>) -> Result<Self::Handle<'_>> {
        self.open_table(definition)
            .map_err(|e| MetastoreError::storage_error("open index table", e))
    }
}

fn storage<E>(operation: &'static str) -> impl FnOnce(E) -> MetastoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |e| MetastoreError::storage_error(operation, e)
}

fn encode_partition(partition: i64) -> [u8; 8] {
    // Flip the sign bit so negative partitions sort first
    ((partition as u64) ^ (1 << 63)).to_be_bytes()
}

fn decode_partition(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

fn put_tenant(key: &mut Vec<u8>, tenant: &str) {
    key.extend_from_slice(&(tenant.len() as u32).to_be_bytes());
    key.extend_from_slice(tenant.as_bytes());
}

fn shard_key(partition: i64, tenant: &str, shard: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + tenant.len());
    key.extend_from_slice(&encode_partition(partition));
    key.extend_from_slice(&shard.to_be_bytes());
    put_tenant(&mut key, tenant);
    key
}

fn block_key(partition: i64, tenant: &str, shard: u32, block: &str) -> Vec<u8> {
    let mut key = shard_key(partition, tenant, shard);
    key.extend_from_slice(block.as_bytes());
    key
}

fn location_key(tenant: &str, shard: u32, block: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + tenant.len() + block.len());
    key.extend_from_slice(&shard.to_be_bytes());
    put_tenant(&mut key, tenant);
    key.extend_from_slice(block.as_bytes());
    key
}

fn decode_shard_key(key: &[u8]) -> Option<(i64, String, u32)> {
    let partition = decode_partition(key)?;
    let shard = u32::from_be_bytes(key.get(8..12)?.try_into().ok()?);
    let len = u32::from_be_bytes(key.get(12..16)?.try_into().ok()?) as usize;
    let tenant = std::str::from_utf8(key.get(16..16 + len)?).ok()?;
    Some((partition, tenant.to_string(), shard))
}

fn decode<T: serde::de::DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| MetastoreError::serialization(what, e))
}

fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| MetastoreError::serialization(what, e))
}

/// Partitioned index of block metadata
#[derive(Debug)]
pub struct BlockIndex {
    partition_duration: i64,
    blocks: AtomicU64,
}

impl BlockIndex {
    /// Create an index with partitions `partition_duration` wide
    pub fn new(partition_duration: Duration) -> Self {
        Self {
            partition_duration: (partition_duration.as_millis() as i64).max(1),
            blocks: AtomicU64::new(0),
        }
    }

    /// Partition width in millis
    pub fn partition_duration(&self) -> i64 {
        self.partition_duration
    }

    /// Start of the partition containing `time`
    pub fn partition_of(&self, time: i64) -> i64 {
        time.div_euclid(self.partition_duration)
            .saturating_mul(self.partition_duration)
    }

    /// Number of blocks in the index
    pub fn block_count(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Add a block. Returns false if a block with the same id is already
    /// present in the tenant shard.
    pub fn insert_block(&self, tx: &WriteTransaction, block: &BlockMeta) -> Result<bool> {
        let location = location_key(&block.tenant, block.shard, &block.id);
        let mut locations = tx.index_table(INDEX_LOCATIONS)?;
        if locations
            .get(location.as_slice())
            .map_err(storage("read block location"))?
            .is_some()
        {
            return Ok(false);
        }
        let partition = self.partition_of(block.min_time);
        locations
            .insert(location.as_slice(), &partition.to_be_bytes()[..])
            .map_err(storage("write block location"))?;

        let value = encode("BlockMeta", block)?;
        tx.index_table(INDEX_BLOCKS)?
            .insert(
                block_key(partition, &block.tenant, block.shard, &block.id).as_slice(),
                value.as_slice(),
            )
            .map_err(storage("write block"))?;

        let key = shard_key(partition, &block.tenant, block.shard);
        update_shard(tx, &key, |range| {
            Some(match range {
                Some(r) => ShardRange {
                    min_time: r.min_time.min(block.min_time),
                    max_time: r.max_time.max(block.max_time),
                    blocks: r.blocks + 1,
                },
                None => ShardRange {
                    min_time: block.min_time,
                    max_time: block.max_time,
                    blocks: 1,
                },
            })
        })?;
        self.blocks.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Remove a block, returning its metadata if it was present
    pub fn remove_block(
        &self,
        tx: &WriteTransaction,
        tenant: &str,
        shard: u32,
        block: &str,
    ) -> Result<Option<BlockMeta>> {
        let location = location_key(tenant, shard, block);
        let partition = {
            let mut locations = tx.index_table(INDEX_LOCATIONS)?;
            let removed = locations
                .remove(location.as_slice())
                .map_err(storage("remove block location"))?;
            match removed {
                Some(value) => decode_location(value.value())?,
                None => return Ok(None),
            }
        };

        let removed = {
            let mut blocks = tx.index_table(INDEX_BLOCKS)?;
            let value = blocks
                .remove(block_key(partition, tenant, shard, block).as_slice())
                .map_err(storage("remove block"))?;
            match value {
                Some(value) => Some(decode::<BlockMeta>("BlockMeta", value.value())?),
                None => None,
            }
        };

        update_shard(tx, &shard_key(partition, tenant, shard), |range| {
            range
                .map(|r| ShardRange {
                    blocks: r.blocks.saturating_sub(1),
                    ..r
                })
                .filter(|r| r.blocks > 0)
        })?;
        if removed.is_some() {
            self.blocks.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Swap compaction sources for its outputs
    pub fn replace_blocks(
        &self,
        tx: &WriteTransaction,
        tenant: &str,
        shard: u32,
        added: &[BlockMeta],
        removed: &[String],
    ) -> Result<()> {
        for block in added {
            self.insert_block(tx, block)?;
        }
        for id in removed {
            if self.remove_block(tx, tenant, shard, id)?.is_none() {
                debug!(tenant, shard, block = %id, "Compacted block already gone from the index");
            }
        }
        Ok(())
    }

    /// Look up a block
    pub fn find_block<T: IndexReader>(
        &self,
        tx: &T,
        tenant: &str,
        shard: u32,
        block: &str,
    ) -> Result<Option<BlockMeta>> {
        let locations = tx.index_table(INDEX_LOCATIONS)?;
        let partition = match locations
            .get(location_key(tenant, shard, block).as_slice())
            .map_err(storage("read block location"))?
        {
            Some(value) => decode_location(value.value())?,
            None => return Ok(None),
        };
        let blocks = tx.index_table(INDEX_BLOCKS)?;
        let value = blocks
            .get(block_key(partition, tenant, shard, block).as_slice())
            .map_err(storage("read block"))?;
        value
            .map(|v| decode::<BlockMeta>("BlockMeta", v.value()))
            .transpose()
    }

    /// Look up blocks by id; missing blocks are skipped
    pub fn get_blocks<T: IndexReader>(&self, tx: &T, query: &BlockQuery) -> Result<Vec<BlockMeta>> {
        let mut found = Vec::with_capacity(query.blocks.len());
        for id in &query.blocks {
            if let Some(block) = self.find_block(tx, &query.tenant, query.shard, id)? {
                found.push(block);
            }
        }
        Ok(found)
    }

    /// All partition shards, ordered by partition then shard
    pub fn partitions<T: IndexReader>(&self, tx: &T) -> Result<Vec<PartitionShard>> {
        let shards = tx.index_table(INDEX_SHARDS)?;
        let mut partitions = Vec::new();
        for item in shards.iter().map_err(storage("scan shards"))? {
            let (key, value) = item.map_err(storage("scan shards"))?;
            let Some((partition, tenant, shard)) = decode_shard_key(key.value()) else {
                continue;
            };
            partitions.push(PartitionShard {
                partition,
                tenant,
                shard,
                range: decode("ShardRange", value.value())?,
            });
        }
        Ok(partitions)
    }

    /// Blocks of the queried tenants overlapping the time range with at
    /// least one dataset satisfying every matcher
    pub fn query_metadata<T: IndexReader>(&self, tx: &T, query: &MetadataQuery) -> Result<Vec<BlockMeta>> {
        query.validate()?;
        let mut result = Vec::new();
        for shard in self.query_shards(tx, query)? {
            let prefix = shard_key(shard.partition, &shard.tenant, shard.shard);
            self.scan_shard(tx, &prefix, |block| {
                if block.overlaps(query.start_time, query.end_time)
                    && (query.matchers.is_empty() || block.datasets.iter().any(|ds| query.matches(ds)))
                {
                    result.push(block);
                }
            })?;
        }
        Ok(result)
    }

    /// Distinct label sets of matching datasets, projected onto
    /// `query.label_names` (all labels when empty)
    pub fn query_metadata_labels<T: IndexReader>(
        &self,
        tx: &T,
        query: &MetadataQuery,
    ) -> Result<Vec<Vec<(String, String)>>> {
        let mut sets = BTreeSet::new();
        for block in self.query_metadata(tx, query)? {
            for dataset in block.datasets.iter().filter(|ds| query.matches(ds)) {
                let service = (SERVICE_NAME_LABEL.to_string(), dataset.name.clone());
                let labels: Vec<_> = if query.label_names.is_empty() {
                    std::iter::once(service)
                        .chain(dataset.labels.iter().cloned())
                        .collect()
                } else {
                    query
                        .label_names
                        .iter()
                        .filter_map(|name| {
                            if name == SERVICE_NAME_LABEL {
                                return Some(service.clone());
                            }
                            dataset.labels.iter().find(|(k, _)| k == name).cloned()
                        })
                        .collect()
                };
                if !labels.is_empty() {
                    sets.insert(labels);
                }
            }
        }
        Ok(sets.into_iter().collect())
    }

    /// Drop whole partition shards, returning the removed blocks
    pub fn truncate(&self, tx: &WriteTransaction, tombstones: &[PartitionTombstone]) -> Result<Vec<BlockMeta>> {
        let mut removed = Vec::new();
        for tombstone in tombstones {
            let prefix = shard_key(tombstone.partition, &tombstone.tenant, tombstone.shard);
            let mut blocks = Vec::new();
            self.scan_shard(tx, &prefix, |block| blocks.push(block))?;

            {
                let mut table = tx.index_table(INDEX_BLOCKS)?;
                let mut locations = tx.index_table(INDEX_LOCATIONS)?;
                for block in &blocks {
                    let key = block_key(tombstone.partition, &block.tenant, block.shard, &block.id);
                    table.remove(key.as_slice()).map_err(storage("remove block"))?;
                    locations
                        .remove(location_key(&block.tenant, block.shard, &block.id).as_slice())
                        .map_err(storage("remove block location"))?;
                }
            }
            tx.index_table(INDEX_SHARDS)?
                .remove(prefix.as_slice())
                .map_err(storage("remove shard"))?;

            debug!(
                partition = tombstone.partition,
                tenant = %tombstone.tenant,
                shard = tombstone.shard,
                blocks = blocks.len(),
                "Truncated partition shard"
            );
            self.blocks.fetch_sub(blocks.len() as u64, Ordering::Relaxed);
            removed.extend(blocks);
        }
        Ok(removed)
    }

    fn query_shards<T: IndexReader>(&self, tx: &T, query: &MetadataQuery) -> Result<Vec<PartitionShard>> {
        let last = self.partition_of(query.end_time);
        Ok(self
            .partitions(tx)?
            .into_iter()
            .take_while(|p| p.partition <= last)
            .filter(|p| query.tenants.contains(&p.tenant))
            .filter(|p| p.range.min_time <= query.end_time && p.range.max_time >= query.start_time)
            .collect())
    }

    fn scan_shard<T: IndexReader>(&self, tx: &T, prefix: &[u8], mut f: impl FnMut(BlockMeta)) -> Result<()> {
        let blocks = tx.index_table(INDEX_BLOCKS)?;
        for item in blocks.range(prefix..).map_err(storage("scan blocks"))? {
            let (key, value) = item.map_err(storage("scan blocks"))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            f(decode("BlockMeta", value.value())?);
        }
        Ok(())
    }
}

fn decode_location(bytes: &[u8]) -> Result<i64> {
    bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .map(i64::from_be_bytes)
        .ok_or_else(|| MetastoreError::Io {
            operation: "read block location".to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("corrupt location record of {} bytes", bytes.len()),
            ),
        })
}

fn update_shard(
    tx: &WriteTransaction,
    key: &[u8],
    f: impl FnOnce(Option<ShardRange>) -> Option<ShardRange>,
) -> Result<()> {
    let mut shards = tx.index_table(INDEX_SHARDS)?;
    let current = match shards.get(key).map_err(storage("read shard"))? {
        Some(value) => Some(decode::<ShardRange>("ShardRange", value.value())?),
        None => None,
    };
    match f(current) {
        Some(range) => {
            shards
                .insert(key, encode("ShardRange", &range)?.as_slice())
                .map_err(storage("write shard"))?;
        }
        None => {
            shards.remove(key).map_err(storage("remove shard"))?;
        }
    }
    Ok(())
}

impl StateRestorer for BlockIndex {
    fn name(&self) -> &'static str {
        "index"
    }

    fn init(&self, tx: &WriteTransaction) -> Result<()> {
        for table in [INDEX_BLOCKS, INDEX_SHARDS, INDEX_LOCATIONS] {
            tx.index_table(table)?;
        }
        Ok(())
    }

    fn restore(&self, tx: &ReadTransaction) -> Result<()> {
        let partitions = self.partitions(tx)?;
        let blocks = partitions.iter().map(|p| p.range.blocks).sum();
        self.blocks.store(blocks, Ordering::Relaxed);
        info!(shards = partitions.len(), blocks, "Block index restored");
        Ok(())
    }
}
