//! redb-backed storage for the replicated log
//!
//! Holds log entries, the hard state, the membership configuration, the
//! latest log snapshot and the truncation point left behind by compaction.
//! Implements [`raft::Storage`] so it can be handed to a `RawNode` directly.

use crate::error::{MetastoreError as Error, Result};
use crate::storage::codec::*;

use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

// Table definitions
const RAFT_LOG_TABLE: TableDefinition<'_, u64, &[u8]> = TableDefinition::new("raft_log");
const RAFT_META_TABLE: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("raft_meta");

const HARD_STATE_KEY: &str = "hard_state";
const CONF_STATE_KEY: &str = "conf_state";
const SNAPSHOT_KEY: &str = "snapshot";
const TRUNCATED_KEY: &str = "truncated";

/// Index and term of the last entry removed from the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Truncated {
    index: u64,
    term: u64,
}

impl Truncated {
    fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.index.to_be_bytes());
        buf[8..].copy_from_slice(&self.term.to_be_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != 16 {
            return None;
        }
        let mut index = [0u8; 8];
        let mut term = [0u8; 8];
        index.copy_from_slice(&data[..8]);
        term.copy_from_slice(&data[8..]);
        Some(Self {
            index: u64::from_be_bytes(index),
            term: u64::from_be_bytes(term),
        })
    }
}

fn other<E: std::error::Error + Send + Sync + 'static>(e: E) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(e)))
}

/// Raft log storage implementation using redb
#[derive(Clone)]
pub struct RaftStorage {
    database: Arc<Database>,
}

impl RaftStorage {
    /// Open (or create) the log database under `data_dir`
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| Error::Io {
                operation: "create raft directory".to_string(),
                source: e,
            })?;

        let db_path = data_dir.join("raft.db");
        let database =
            Arc::new(Database::create(&db_path).map_err(|e| Error::storage_error("create database", e))?);

        // Initialize tables
        let write_txn = database
            .begin_write()
            .map_err(|e| Error::storage_error("begin write transaction", e))?;
        {
            let _ = write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| Error::storage_error("open raft_log table", e))?;
            let _ = write_txn
                .open_table(RAFT_META_TABLE)
                .map_err(|e| Error::storage_error("open raft_meta table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::storage_error("commit table initialization", e))?;

        Ok(Self { database })
    }

    /// Seed the initial voters of a brand new cluster.
    ///
    /// Has no effect once any state has been written, so restarts and nodes
    /// that already received a snapshot keep their configuration.
    pub fn initialize(&self, voters: &[u64]) -> Result<bool> {
        let state = self.initial_state().map_err(|e| Error::consensus_error("read initial state", e))?;
        if !state.conf_state.voters.is_empty() || state.hard_state.term != 0 {
            return Ok(false);
        }
        if self.last_index().map_err(|e| Error::consensus_error("read last index", e))? != 0 {
            return Ok(false);
        }
        self.set_conf_state(&ConfState::from((voters.to_vec(), vec![])))?;
        debug!(?voters, "Initialized raft configuration");
        Ok(true)
    }

    /// Persist the membership configuration
    pub fn set_conf_state(&self, conf_state: &ConfState) -> Result<()> {
        self.put_meta(CONF_STATE_KEY, &serialize_conf_state(conf_state), "conf state")
    }

    /// Save hard state
    pub fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        self.put_meta(HARD_STATE_KEY, &serialize_hard_state(hard_state), "hard state")?;
        debug!(
            "Saved hard state: term={}, vote={}, commit={}",
            hard_state.term, hard_state.vote, hard_state.commit
        );
        Ok(())
    }

    /// Persist a new commit index, keeping term and vote
    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut hard_state = self
            .initial_state()
            .map_err(|e| Error::consensus_error("read hard state", e))?
            .hard_state;
        hard_state.commit = commit;
        self.put_meta(HARD_STATE_KEY, &serialize_hard_state(&hard_state), "hard state")
    }

    /// Append entries to the log, replacing any conflicting suffix
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        let (first, last) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.index, last.index),
            _ => return Ok(()),
        };

        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| Error::storage_error("begin write transaction", e))?;
        {
            let mut log_table = write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| Error::storage_error("open raft_log table", e))?;

            // Entries past the new tail belong to a deposed leader
            let stale: Vec<u64> = log_table
                .range(first..)
                .map_err(|e| Error::storage_error("range log entries", e))?
                .map(|r| r.map(|(k, _)| k.value()).map_err(|e| Error::storage_error("read log key", e)))
                .collect::<Result<Vec<_>>>()?;
            for index in stale {
                log_table
                    .remove(index)
                    .map_err(|e| Error::storage_error("remove log entry", e))?;
            }

            for entry in entries {
                let data = serialize_entry(entry);
                log_table
                    .insert(entry.index, &data[..])
                    .map_err(|e| Error::storage_error("insert log entry", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| Error::storage_error("commit entries", e))?;

        debug!(
            "Appended {} entries, first_index={}, last_index={}",
            entries.len(),
            first,
            last
        );
        Ok(())
    }

    /// Store a snapshot of the local state machine taken at `index`.
    ///
    /// The log itself is not touched; see [`RaftStorage::compact`].
    pub fn create_snapshot(&self, index: u64, conf_state: ConfState, data: Vec<u8>) -> Result<Snapshot> {
        let term = self
            .term(index)
            .map_err(|e| Error::consensus_error("resolve snapshot term", e))?;

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = index;
        snapshot.mut_metadata().term = term;
        snapshot.mut_metadata().set_conf_state(conf_state);
        snapshot.data = data.into();

        self.put_meta(SNAPSHOT_KEY, &serialize_snapshot(&snapshot), "snapshot")?;
        debug!(index, term, size = snapshot.data.len(), "Created log snapshot");
        Ok(snapshot)
    }

    /// Install a snapshot received from the leader, discarding the whole log
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let metadata = snapshot.get_metadata().clone();

        let mut hard_state = self
            .initial_state()
            .map_err(|e| Error::consensus_error("read hard state", e))?
            .hard_state;
        hard_state.term = hard_state.term.max(metadata.term);
        hard_state.commit = hard_state.commit.max(metadata.index);

        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| Error::storage_error("begin write transaction", e))?;
        {
            let mut log_table = write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| Error::storage_error("open raft_log table", e))?;
            let keys: Vec<u64> = log_table
                .range::<u64>(..)
                .map_err(|e| Error::storage_error("range log entries", e))?
                .map(|r| r.map(|(k, _)| k.value()).map_err(|e| Error::storage_error("read log key", e)))
                .collect::<Result<Vec<_>>>()?;
            for index in keys {
                log_table
                    .remove(index)
                    .map_err(|e| Error::storage_error("remove log entry", e))?;
            }

            let mut meta = write_txn
                .open_table(RAFT_META_TABLE)
                .map_err(|e| Error::storage_error("open raft_meta table", e))?;
            let truncated = Truncated {
                index: metadata.index,
                term: metadata.term,
            };
            meta.insert(TRUNCATED_KEY, &truncated.encode()[..])
                .map_err(|e| Error::storage_error("insert truncation point", e))?;
            meta.insert(SNAPSHOT_KEY, &serialize_snapshot(&snapshot)[..])
                .map_err(|e| Error::storage_error("insert snapshot", e))?;
            meta.insert(CONF_STATE_KEY, &serialize_conf_state(metadata.get_conf_state())[..])
                .map_err(|e| Error::storage_error("insert conf state", e))?;
            meta.insert(HARD_STATE_KEY, &serialize_hard_state(&hard_state)[..])
                .map_err(|e| Error::storage_error("insert hard state", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::storage_error("commit snapshot", e))?;

        debug!("Applied snapshot at index={}", metadata.index);
        Ok(())
    }

    /// Remove log entries before `compact_index`
    pub fn compact(&self, compact_index: u64) -> Result<()> {
        let first = self
            .first_index()
            .map_err(|e| Error::consensus_error("read first index", e))?;
        if compact_index <= first {
            return Ok(());
        }
        let last = self
            .last_index()
            .map_err(|e| Error::consensus_error("read last index", e))?;
        let compact_index = compact_index.min(last + 1);
        let truncated = Truncated {
            index: compact_index - 1,
            term: self
                .term(compact_index - 1)
                .map_err(|e| Error::consensus_error("resolve compaction term", e))?,
        };

        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| Error::storage_error("begin write transaction", e))?;
        {
            let mut log_table = write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| Error::storage_error("open raft_log table", e))?;

            // Remove all entries up to (but not including) compact_index
            let entries_to_remove: Vec<u64> = log_table
                .range(..compact_index)
                .map_err(|e| Error::storage_error("range log entries", e))?
                .map(|r| r.map(|(k, _)| k.value()).map_err(|e| Error::storage_error("read log key", e)))
                .collect::<Result<Vec<_>>>()?;
            for index in entries_to_remove {
                log_table
                    .remove(index)
                    .map_err(|e| Error::storage_error("remove log entry", e))?;
            }

            let mut meta = write_txn
                .open_table(RAFT_META_TABLE)
                .map_err(|e| Error::storage_error("open raft_meta table", e))?;
            meta.insert(TRUNCATED_KEY, &truncated.encode()[..])
                .map_err(|e| Error::storage_error("insert truncation point", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::storage_error("commit compaction", e))?;

        debug!("Compacted log up to index {}", compact_index);
        Ok(())
    }

    /// The stored log snapshot, if any
    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| Error::storage_error("begin read transaction", e))?;
        let meta = read_txn
            .open_table(RAFT_META_TABLE)
            .map_err(|e| Error::storage_error("open raft_meta table", e))?;
        match meta
            .get(SNAPSHOT_KEY)
            .map_err(|e| Error::storage_error("get snapshot", e))?
        {
            Some(data) => Ok(Some(deserialize_snapshot(data.value())?)),
            None => Ok(None),
        }
    }

    fn put_meta(&self, key: &str, value: &[u8], what: &str) -> Result<()> {
        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| Error::storage_error("begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(RAFT_META_TABLE)
                .map_err(|e| Error::storage_error("open raft_meta table", e))?;
            table
                .insert(key, value)
                .map_err(|e| Error::storage_error(&format!("insert {}", what), e))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::storage_error(&format!("commit {}", what), e))
    }

    fn truncated(&self, read_txn: &ReadTransaction) -> raft::Result<Truncated> {
        let meta = read_txn.open_table(RAFT_META_TABLE).map_err(other)?;
        let truncated = meta
            .get(TRUNCATED_KEY)
            .map_err(other)?
            .and_then(|data| Truncated::decode(data.value()))
            .unwrap_or_default();
        Ok(truncated)
    }

    fn begin_read(&self) -> raft::Result<ReadTransaction> {
        self.database.begin_read().map_err(other)
    }
}

impl Storage for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let read_txn = self.begin_read()?;
        let meta = read_txn.open_table(RAFT_META_TABLE).map_err(other)?;

        let hard_state = match meta.get(HARD_STATE_KEY).map_err(other)? {
            Some(data) => deserialize_hard_state(data.value()).map_err(other)?,
            None => HardState::default(),
        };

        let conf_state = match meta.get(CONF_STATE_KEY).map_err(other)? {
            Some(data) => deserialize_conf_state(data.value()).map_err(other)?,
            None => ConfState::default(),
        };

        Ok(RaftState {
            hard_state,
            conf_state,
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into().unwrap_or(u64::MAX);
        let read_txn = self.begin_read()?;

        if low <= self.truncated(&read_txn)?.index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }

        let log_table = read_txn.open_table(RAFT_LOG_TABLE).map_err(other)?;
        let mut entries = Vec::with_capacity((high - low) as usize);
        let mut total_size = 0u64;

        for index in low..high {
            let data = match log_table.get(index).map_err(other)? {
                Some(data) => data,
                None => return Err(raft::Error::Store(StorageError::Unavailable)),
            };
            let entry_data = data.value();
            let entry_size = entry_data.len() as u64;

            // Always return at least one entry
            if !entries.is_empty() && total_size + entry_size > max_size {
                break;
            }

            entries.push(deserialize_entry(entry_data).map_err(other)?);
            total_size += entry_size;
        }

        Ok(entries)
    }

    fn term(&self, index: u64) -> raft::Result<u64> {
        let read_txn = self.begin_read()?;
        let truncated = self.truncated(&read_txn)?;

        if index == truncated.index {
            return Ok(truncated.term);
        }
        if index < truncated.index {
            return Err(raft::Error::Store(StorageError::Compacted));
        }

        let log_table = read_txn.open_table(RAFT_LOG_TABLE).map_err(other)?;
        match log_table.get(index).map_err(other)? {
            Some(data) => Ok(deserialize_entry(data.value()).map_err(other)?.term),
            None => Err(raft::Error::Store(StorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        let read_txn = self.begin_read()?;
        Ok(self.truncated(&read_txn)?.index + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        let read_txn = self.begin_read()?;
        let log_table = read_txn.open_table(RAFT_LOG_TABLE).map_err(other)?;

        let last = log_table.range::<u64>(..).map_err(other)?.next_back();
        match last {
            Some(last) => {
                let (key, _) = last.map_err(other)?;
                Ok(key.value())
            }
            None => Ok(self.truncated(&read_txn)?.index),
        }
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        match self.latest_snapshot().map_err(other)? {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => Ok(snapshot),
            // The node takes snapshots on its own schedule
            _ => Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = format!("entry-{}", index).into_bytes().into();
        e
    }

    async fn storage() -> (TempDir, RaftStorage) {
        let dir = TempDir::new().unwrap();
        let storage = RaftStorage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_empty_storage() {
        let (_dir, storage) = storage().await;
        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 0);
        assert_eq!(storage.term(0).unwrap(), 0);
        assert!(storage.latest_snapshot().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_only_once() {
        let (_dir, storage) = storage().await;
        assert!(storage.initialize(&[1, 2, 3]).unwrap());
        assert!(!storage.initialize(&[4]).unwrap());
        assert_eq!(storage.initial_state().unwrap().conf_state.voters, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_append_replaces_conflicting_suffix() {
        let (_dir, storage) = storage().await;
        storage
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1)])
            .unwrap();
        storage.append(&[entry(2, 2)]).unwrap();

        assert_eq!(storage.last_index().unwrap(), 2);
        assert_eq!(storage.term(2).unwrap(), 2);
        let entries = storage
            .entries(1, 3, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_entries_respects_max_size() {
        let (_dir, storage) = storage().await;
        storage
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1)])
            .unwrap();

        let entries = storage
            .entries(1, 4, Some(1), GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(entries.len(), 1);

        assert!(matches!(
            storage.entries(1, 5, None, GetEntriesContext::empty(false)),
            Err(raft::Error::Store(StorageError::Unavailable))
        ));
    }

    #[tokio::test]
    async fn test_compaction_keeps_term_of_truncation_point() {
        let (_dir, storage) = storage().await;
        storage
            .append(&[entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)])
            .unwrap();
        storage.compact(3).unwrap();

        assert_eq!(storage.first_index().unwrap(), 3);
        assert_eq!(storage.last_index().unwrap(), 4);
        assert_eq!(storage.term(2).unwrap(), 1);
        assert!(matches!(
            storage.term(1),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
        assert!(matches!(
            storage.entries(2, 4, None, GetEntriesContext::empty(false)),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let (_dir, storage) = storage().await;
        storage.initialize(&[1]).unwrap();
        storage
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1)])
            .unwrap();

        let snapshot = storage
            .create_snapshot(2, ConfState::from((vec![1], vec![])), b"state".to_vec())
            .unwrap();
        assert_eq!(snapshot.get_metadata().term, 1);
        assert_eq!(storage.snapshot(0, 2).unwrap().get_metadata().index, 2);
        assert!(storage.snapshot(3, 2).is_err());

        // A follower installing a newer snapshot drops its log entirely
        let mut incoming = Snapshot::default();
        incoming.mut_metadata().index = 10;
        incoming.mut_metadata().term = 3;
        incoming
            .mut_metadata()
            .set_conf_state(ConfState::from((vec![1, 2], vec![])));
        storage.apply_snapshot(incoming).unwrap();

        assert_eq!(storage.first_index().unwrap(), 11);
        assert_eq!(storage.last_index().unwrap(), 10);
        assert_eq!(storage.term(10).unwrap(), 3);
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.commit, 10);
        assert_eq!(state.conf_state.voters, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_hard_state_commit() {
        let (_dir, storage) = storage().await;
        let mut hs = HardState::default();
        hs.term = 4;
        hs.vote = 2;
        storage.save_hard_state(&hs).unwrap();
        storage.set_commit(9).unwrap();

        let state = storage.initial_state().unwrap().hard_state;
        assert_eq!((state.term, state.vote, state.commit), (4, 2, 9));
    }
}
