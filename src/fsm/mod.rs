//! Transactional state machine
//!
//! The [`Fsm`] applies committed log entries to a redb database. Each command
//! runs inside one write transaction together with the applied-index record,
//! so a crash between apply and commit leaves no trace and replay after a
//! restart skips everything at or below the stored index.
//!
//! Business logic lives in command handlers registered per [`CommandType`]
//! and in [`StateRestorer`]s that own their tables and any in-memory state
//! derived from them.

pub mod context;
pub mod snapshot;

pub use context::ContextRegistry;
pub use snapshot::FsmSnapshot;

use crate::config::FsmConfig;
use crate::error::{MetastoreError, Result};
use crate::observability;
use crate::raft::messages::{CommandType, RaftLogEntry};

use parking_lot::{Mutex, RwLock};
use raft::prelude::{Entry, EntryType};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const RAFT_TABLE: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("raft");
const APPLIED_INDEX_KEY: &[u8] = b"term.applied_index";

const DB_FILE: &str = "metastore.db";
const RESTORE_FILE: &str = "metastore.db.restore";

/// Term and index of the last command committed to the database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct AppliedIndex {
    /// Term of the entry
    pub term: u64,
    /// Log index of the entry
    pub index: u64,
}

impl AppliedIndex {
    fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.term.to_be_bytes());
        buf[8..].copy_from_slice(&self.index.to_be_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let mut term = [0u8; 8];
        let mut index = [0u8; 8];
        term.copy_from_slice(&bytes[..8]);
        index.copy_from_slice(&bytes[8..16]);
        Some(Self {
            term: u64::from_be_bytes(term),
            index: u64::from_be_bytes(index),
        })
    }
}

/// Position of the entry being applied, handed to every handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    /// Log index of the entry
    pub index: u64,
    /// Term of the entry
    pub term: u64,
    /// Unix millis stamped by the proposer
    pub appended_at: i64,
}

/// Owner of a slice of the persisted state.
///
/// Implementations must be idempotent: both methods run at startup and again
/// after every snapshot restore.
pub trait StateRestorer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Create tables. Runs with exclusive access to the database, inside the
    /// same write transaction as every other restorer.
    fn init(&self, tx: &WriteTransaction) -> Result<()>;

    /// Rebuild in-memory state. Restorers run concurrently, each with its
    /// own read transaction.
    fn restore(&self, tx: &ReadTransaction) -> Result<()>;
}

/// Result of applying a single log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Not a command: empty, no-op or membership entry
    Ignored,
    /// Already reflected in the database
    Skipped,
    /// Handler response
    Applied(Vec<u8>),
}

impl ApplyOutcome {
    /// Response bytes; replay skips answer with an empty response
    pub fn into_response(self) -> Vec<u8> {
        match self {
            ApplyOutcome::Applied(data) => data,
            ApplyOutcome::Ignored | ApplyOutcome::Skipped => Vec::new(),
        }
    }
}

type Handler =
    Box<dyn Fn(&CommandContext, &WriteTransaction, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Invoked once when the state machine can no longer make progress.
///
/// The default hook aborts the process.
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Lifecycle of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    /// Opened, tables not yet created
    Uninitialized,
    /// Ready to apply commands and serve reads
    Initialized,
    /// A command is being applied
    Applying,
    /// A snapshot is replacing the database
    Restoring,
    /// Closed by [`Fsm::shutdown`]
    Shutdown,
    /// Stopped by a fatal failure; in-memory state can no longer be trusted
    Failed,
}

impl FsmState {
    fn is_terminal(self) -> bool {
        matches!(self, FsmState::Shutdown | FsmState::Failed)
    }
}

/// State machine over a single redb file
pub struct Fsm {
    config: FsmConfig,
    path: PathBuf,
    contexts: Arc<ContextRegistry>,

    // Readers and apply hold the read side for the whole transaction;
    // restore takes the write side to swap the file.
    db: RwLock<Option<Database>>,
    applied: Mutex<AppliedIndex>,
    state: Mutex<FsmState>,
    on_fatal: RwLock<FatalHook>,

    handlers: RwLock<HashMap<CommandType, Handler>>,
    restorers: RwLock<Vec<Arc<dyn StateRestorer>>>,
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("path", &self.path)
            .field("applied", &*self.applied.lock())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Fsm {
    /// Open (or create) the database under `config.data_dir`
    pub fn open(config: FsmConfig, contexts: Arc<ContextRegistry>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| MetastoreError::Io {
            operation: format!("create data dir {}", config.data_dir.display()),
            source: e,
        })?;
        let path = config.data_dir.join(DB_FILE);
        let db = Database::create(&path)
            .map_err(|e| MetastoreError::storage_error("open state machine database", e))?;

        Ok(Self {
            config,
            path,
            contexts,
            db: RwLock::new(Some(db)),
            applied: Mutex::new(AppliedIndex::default()),
            state: Mutex::new(FsmState::Uninitialized),
            on_fatal: RwLock::new(Arc::new(abort_process)),
            handlers: RwLock::new(HashMap::new()),
            restorers: RwLock::new(Vec::new()),
        })
    }

    /// Path of the live database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Correlation token registry shared with the proposer
    pub fn contexts(&self) -> &Arc<ContextRegistry> {
        &self.contexts
    }

    /// Current lifecycle state
    pub fn state(&self) -> FsmState {
        *self.state.lock()
    }

    /// Replace the hook run on fatal failures
    pub fn on_fatal(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_fatal.write() = Arc::new(hook);
    }

    /// Mark the state machine failed and run the fatal hook.
    ///
    /// Does nothing once the state machine is shut down or already failed.
    pub fn fail(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = FsmState::Failed;
        }
        error!(reason, "State machine failed");
        let hook = self.on_fatal.read().clone();
        hook(reason);
    }

    fn fatal(&self, index: u64, term: u64, what: &str, err: impl std::fmt::Display) -> MetastoreError {
        let reason = format!("failed to {what} at index {index}, term {term}: {err}");
        self.fail(&reason);
        MetastoreError::ServiceUnavailable {
            service: "fsm".to_string(),
            reason,
        }
    }

    /// Error for operations that need a live state machine
    fn check_usable(&self) -> Result<FsmState> {
        let state = *self.state.lock();
        if state.is_terminal() {
            return Err(unavailable(state));
        }
        Ok(state)
    }

    /// Register restorers. Must happen before [`Fsm::init`].
    pub fn register_restorer(&self, restorer: Arc<dyn StateRestorer>) {
        self.restorers.write().push(restorer);
    }

    /// Register the handler for `command`.
    ///
    /// The handler must be idempotent and must only fail on storage errors:
    /// any error it returns takes the process down.
    pub fn register_handler<Req, Resp, F>(&self, command: CommandType, handler: F)
    where
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        F: Fn(&CommandContext, &WriteTransaction, Req) -> Result<Resp> + Send + Sync + 'static,
    {
        let wrapped: Handler = Box::new(move |ctx, tx, raw| {
            let request: Req = bincode::deserialize(raw)
                .map_err(|e| MetastoreError::serialization(command.as_str(), e))?;
            let response = handler(ctx, tx, request)?;
            bincode::serialize(&response)
                .map_err(|e| MetastoreError::serialization(command.as_str(), e))
        });
        self.handlers.write().insert(command, wrapped);
    }

    /// Create tables, then load the applied index and every restorer's state
    pub fn init(&self) -> Result<()> {
        let guard = self.db.read();
        self.check_usable()?;
        let db = guard.as_ref().ok_or_else(|| unavailable(FsmState::Shutdown))?;
        self.init_tables(db)?;
        self.restore_state(db)?;

        let mut state = self.state.lock();
        if *state == FsmState::Uninitialized {
            *state = FsmState::Initialized;
        }
        Ok(())
    }

    fn init_tables(&self, db: &Database) -> Result<()> {
        let tx = db
            .begin_write()
            .map_err(|e| MetastoreError::storage_error("begin init transaction", e))?;
        {
            let mut table = tx
                .open_table(RAFT_TABLE)
                .map_err(|e| MetastoreError::storage_error("open raft table", e))?;
            let exists = table
                .get(APPLIED_INDEX_KEY)
                .map_err(|e| MetastoreError::storage_error("read applied index", e))?
                .is_some();
            if !exists {
                table
                    .insert(APPLIED_INDEX_KEY, &AppliedIndex::default().encode()[..])
                    .map_err(|e| MetastoreError::storage_error("seed applied index", e))?;
            }
        }
        for restorer in self.restorers.read().iter() {
            restorer.init(&tx)?;
        }
        tx.commit()
            .map_err(|e| MetastoreError::storage_error("commit init transaction", e))
    }

    fn restore_state(&self, db: &Database) -> Result<()> {
        let applied = {
            let tx = db
                .begin_read()
                .map_err(|e| MetastoreError::storage_error("begin read transaction", e))?;
            load_applied_index(&tx)?
        };
        *self.applied.lock() = applied;
        info!(term = applied.term, applied_index = applied.index, "Restoring state");

        let restorers = self.restorers.read().clone();
        std::thread::scope(|scope| {
            let tasks: Vec<_> = restorers
                .iter()
                .map(|restorer| {
                    scope.spawn(move || -> Result<()> {
                        let tx = db.begin_read().map_err(|e| {
                            MetastoreError::storage_error("begin restore transaction", e)
                        })?;
                        restorer.restore(&tx)?;
                        debug!(restorer = restorer.name(), "Restored state");
                        Ok(())
                    })
                })
                .collect();

            tasks.into_iter().try_for_each(|task| {
                task.join().map_err(|_| MetastoreError::ServiceUnavailable {
                    service: "fsm".to_string(),
                    reason: "state restorer panicked".to_string(),
                })?
            })
        })
    }

    /// Applied index as of the last committed command
    pub fn applied(&self) -> AppliedIndex {
        *self.applied.lock()
    }

    /// Apply a committed log entry.
    ///
    /// A malformed entry, an unknown command or a failing handler or commit
    /// is fatal: the in-memory state owned by the handlers may already have
    /// diverged from the database. The state machine moves to
    /// [`FsmState::Failed`], runs the fatal hook and returns an error.
    ///
    /// # Errors
    ///
    /// Fails when the state machine is not initialized, is shut down or has
    /// failed.
    pub fn apply(&self, entry: &Entry) -> Result<ApplyOutcome> {
        if entry.get_entry_type() != EntryType::EntryNormal || entry.data.is_empty() {
            return Ok(ApplyOutcome::Ignored);
        }

        let guard = self.db.read();
        match self.check_usable()? {
            FsmState::Uninitialized => return Err(unavailable(FsmState::Uninitialized)),
            _ => *self.state.lock() = FsmState::Applying,
        }
        let result = guard
            .as_ref()
            .ok_or_else(|| unavailable(FsmState::Shutdown))
            .and_then(|db| self.apply_command(db, entry));

        let mut state = self.state.lock();
        if *state == FsmState::Applying {
            *state = FsmState::Initialized;
        }
        result
    }

    fn apply_command(&self, db: &Database, entry: &Entry) -> Result<ApplyOutcome> {
        let (index, term) = (entry.index, entry.term);
        let command = RaftLogEntry::decode(&entry.data)
            .map_err(|e| self.fatal(index, term, "decode log entry", e))?;

        let parent = self.contexts.retrieve(&entry.context);
        let span = observability::apply_span(parent.as_ref(), command.command.as_str(), index, term);
        let _entered = span.enter();

        if index <= self.applied.lock().index {
            debug!(index, "Skipping already applied command");
            return Ok(ApplyOutcome::Skipped);
        }

        let started = Instant::now();
        let handlers = self.handlers.read();
        let handler = handlers.get(&command.command).ok_or_else(|| {
            self.fatal(
                index,
                term,
                "resolve handler",
                format!("unknown command type {}", command.command),
            )
        })?;

        let tx = db
            .begin_write()
            .map_err(|e| self.fatal(index, term, "begin write transaction", e))?;
        let ctx = CommandContext {
            index,
            term,
            appended_at: command.appended_at,
        };

        let response = handler(&ctx, &tx, &command.payload)
            .map_err(|e| self.fatal(index, term, "apply command", e))?;

        let applied = AppliedIndex { term, index };
        store_applied_index(&tx, applied)
            .map_err(|e| self.fatal(index, term, "store applied index", e))?;
        tx.commit()
            .map_err(|e| self.fatal(index, term, "commit transaction", e))?;
        *self.applied.lock() = applied;

        debug!(
            command = %command.command,
            index,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Applied command"
        );
        Ok(ApplyOutcome::Applied(response))
    }

    /// Run `f` inside a read transaction.
    ///
    /// Blocks while a restore is in progress; a pending restore waits for
    /// running reads to finish.
    pub fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        self.check_usable()?;
        let db = guard.as_ref().ok_or_else(|| unavailable(FsmState::Shutdown))?;
        let tx = db
            .begin_read()
            .map_err(|e| MetastoreError::storage_error("begin read transaction", e))?;
        f(&tx)
    }

    /// Capture a point-in-time view; the I/O happens in [`FsmSnapshot::persist`]
    pub fn snapshot(&self) -> Result<FsmSnapshot> {
        let guard = self.db.read();
        self.check_usable()?;
        let db = guard.as_ref().ok_or_else(|| unavailable(FsmState::Shutdown))?;
        let tx = db
            .begin_read()
            .map_err(|e| MetastoreError::storage_error("open snapshot transaction", e))?;
        let applied = load_applied_index(&tx)?;
        Ok(FsmSnapshot::new(
            tx,
            applied,
            self.config.snapshot_compression,
            self.config.snapshot_rate_limit,
        ))
    }

    /// Convenience for persisting a snapshot into memory
    pub fn snapshot_bytes(&self) -> Result<(AppliedIndex, Vec<u8>)> {
        let snapshot = self.snapshot()?;
        let applied = snapshot.applied();
        let mut buf = Vec::new();
        snapshot.persist(&mut buf)?;
        Ok((applied, buf))
    }

    /// Replace the whole state with the snapshot read from `source`.
    ///
    /// A snapshot that cannot be staged leaves the live state untouched. A
    /// failure after the swap is fatal.
    pub fn restore<R: Read>(&self, source: R) -> Result<()> {
        self.check_usable()?;
        let started = Instant::now();
        info!("Restoring snapshot");

        let staged = self.path.with_file_name(RESTORE_FILE);
        if let Err(e) = self.stage_restore(source, &staged) {
            error!(error = %e, "Failed to stage snapshot");
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }

        // New readers queue behind us; running ones drain first
        let mut guard = self.db.write();
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                let current = *state;
                drop(state);
                let _ = std::fs::remove_file(&staged);
                return Err(unavailable(current));
            }
            *state = FsmState::Restoring;
        }
        drop(guard.take());

        let result = self.swap_in(&staged);
        match result {
            Ok(db) => {
                *guard = Some(db);
                let mut state = self.state.lock();
                if *state == FsmState::Restoring {
                    *state = FsmState::Initialized;
                }
                info!(
                    applied_index = self.applied().index,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Restored snapshot"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to restore state from snapshot");
                let reason = format!("failed to restore snapshot: {e}");
                drop(guard);
                self.fail(&reason);
                Err(e)
            }
        }
    }

    fn swap_in(&self, staged: &Path) -> Result<Database> {
        std::fs::rename(staged, &self.path).map_err(|e| MetastoreError::Io {
            operation: "swap restored database".to_string(),
            source: e,
        })?;
        let db = Database::create(&self.path)
            .map_err(|e| MetastoreError::storage_error("reopen restored database", e))?;
        self.init_tables(&db)?;
        self.restore_state(&db)?;
        Ok(db)
    }

    fn stage_restore<R: Read>(&self, source: R, staged: &Path) -> Result<()> {
        if staged.exists() {
            std::fs::remove_file(staged)?;
        }
        let mut db = Database::create(staged)
            .map_err(|e| MetastoreError::storage_error("create restore database", e))?;
        let tx = db
            .begin_write()
            .map_err(|e| MetastoreError::storage_error("begin restore transaction", e))?;
        let entries = snapshot::load_records(source, &tx)?;
        tx.commit()
            .map_err(|e| MetastoreError::storage_error("commit restore transaction", e))?;

        let intact = db
            .check_integrity()
            .map_err(|e| MetastoreError::storage_error("verify restored database", e))?;
        if !intact {
            warn!("Restored database required repair");
        }
        if self.config.snapshot_compact_on_restore {
            db.compact()
                .map_err(|e| MetastoreError::storage_error("compact restored database", e))?;
        }
        debug!(entries, "Staged snapshot");
        Ok(())
    }

    /// Write a snapshot to `sink` and return the index it covers
    pub fn persist_snapshot<W: Write>(&self, sink: W) -> Result<AppliedIndex> {
        let snapshot = self.snapshot()?;
        let applied = snapshot.applied();
        snapshot.persist(sink)?;
        Ok(applied)
    }

    /// Close the database; every later operation fails
    pub fn shutdown(&self) {
        let mut guard = self.db.write();
        *self.state.lock() = FsmState::Shutdown;
        if guard.take().is_some() {
            info!("State machine database closed");
        }
    }
}

fn unavailable(state: FsmState) -> MetastoreError {
    let reason = match state {
        FsmState::Uninitialized => "state machine is not initialized",
        FsmState::Failed => "state machine stopped after a fatal failure",
        _ => "database is closed",
    };
    MetastoreError::ServiceUnavailable {
        service: "fsm".to_string(),
        reason: reason.to_string(),
    }
}

fn abort_process(reason: &str) {
    error!(reason, "Aborting process");
    std::process::abort();
}

fn load_applied_index(tx: &ReadTransaction) -> Result<AppliedIndex> {
    let table = tx
        .open_table(RAFT_TABLE)
        .map_err(|e| MetastoreError::storage_error("open raft table", e))?;
    let value = table
        .get(APPLIED_INDEX_KEY)
        .map_err(|e| MetastoreError::storage_error("read applied index", e))?;
    value
        .and_then(|v| AppliedIndex::decode(v.value()))
        .ok_or_else(|| MetastoreError::Snapshot {
            operation: "load applied index".to_string(),
            details: "applied index record missing or invalid".to_string(),
        })
}

fn store_applied_index(tx: &WriteTransaction, applied: AppliedIndex) -> Result<()> {
    let mut table = tx
        .open_table(RAFT_TABLE)
        .map_err(|e| MetastoreError::storage_error("open raft table", e))?;
    table
        .insert(APPLIED_INDEX_KEY, &applied.encode()[..])
        .map_err(|e| MetastoreError::storage_error("store applied index", e))?;
    Ok(())
}
