//! Consensus node
//!
//! [`RaftNode`] drives a raft-rs `RawNode` over the redb log storage and the
//! transactional state machine. A single background loop ticks the node,
//! steps inbound messages and handles `Ready` batches; client operations lock
//! the same core, step their request and process the resulting `Ready`
//! inline.
//!
//! Ready handling follows the raft-rs contract:
//!
//! ```text
//! messages -> snapshot -> entries -> hard state -> persisted messages
//!          -> read states -> committed entries -> advance -> light ready
//! ```

use crate::config::Config;
use crate::error::{MetastoreError, Result};
use crate::fsm::Fsm;
use crate::raft::messages::{CommandType, RaftLogEntry};
use crate::raft::observer::{self, LeaderActivity};
use crate::raft::read::{Leader, ReplicaState};
use crate::raft::transport::{Inbound, InboundReceiver, Transport};
use crate::storage::RaftStorage;
use crate::types::{LeaderState, NodeId, NodeInfo, NodeRole, ReadIndex};

use async_trait::async_trait;
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeV2, Entry, EntryType, Message, MessageType, RawNode, ReadState, Snapshot,
};
use raft::{ReadOnlyOption, SnapshotStatus, StateRole, Storage};
use redb::ReadTransaction;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Span};

type Reply<T> = oneshot::Sender<Result<T>>;

struct PendingRead {
    term: u64,
    reply: Reply<ReadIndex>,
}

struct SnapshotPolicy {
    last_index: u64,
    last_at: Instant,
    in_flight: bool,
}

/// Everything guarded by the node lock
struct Core {
    raw: RawNode<RaftStorage>,
    proposals: HashMap<Vec<u8>, Reply<Vec<u8>>>,
    // Reads wait here until the leader has committed an entry in its term
    reads_waiting: Vec<PendingRead>,
    reads_issued: HashMap<Vec<u8>, PendingRead>,
    snapshot: SnapshotPolicy,
    was_leader: bool,
}

impl Core {
    fn leader_hint(&self) -> Option<NodeId> {
        match self.raw.raft.leader_id {
            raft::INVALID_ID => None,
            id => Some(id),
        }
    }

    fn is_leader(&self) -> bool {
        self.raw.raft.state == StateRole::Leader
    }

    fn committed_in_current_term(&self) -> bool {
        let log = &self.raw.raft.raft_log;
        log.term(log.committed)
            .map(|term| term == self.raw.raft.term)
            .unwrap_or(false)
    }
}

struct PersistedSnapshot {
    index: u64,
    result: Result<Vec<u8>>,
}

struct Inner {
    id: NodeId,
    config: Config,
    core: Mutex<Core>,
    storage: RaftStorage,
    fsm: Arc<Fsm>,
    transport: Arc<dyn Transport>,
    applied: AtomicU64,
    // Set once a fatal failure stops the node; never cleared
    halted: AtomicBool,
    leader_tx: watch::Sender<LeaderState>,
    snapshot_tx: mpsc::UnboundedSender<PersistedSnapshot>,
}

/// Raft node hosting the metastore state machine
pub struct RaftNode {
    inner: Arc<Inner>,
    inbound: parking_lot::Mutex<Option<(InboundReceiver, mpsc::UnboundedReceiver<PersistedSnapshot>)>>,
    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("node_id", &self.inner.id)
            .field("leader", &*self.inner.leader_tx.borrow())
            .field("applied", &self.applied_index())
            .finish()
    }
}

impl RaftNode {
    /// Open the log storage and create the node.
    ///
    /// The state machine must already be initialized. A stored log snapshot
    /// newer than the state machine is restored before the node starts.
    pub async fn new(
        config: Config,
        fsm: Arc<Fsm>,
        transport: Arc<dyn Transport>,
        inbound: InboundReceiver,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MetastoreError::validation("config", e.to_string()))?;
        let id = config.node_id();

        let storage = RaftStorage::new(&config.node.raft_dir).await?;
        if storage.initialize(&config.voters())? {
            info!(node_id = id, voters = ?config.voters(), "Initialized new raft configuration");
        }

        let mut applied = fsm.applied().index;
        let mut last_snapshot = 0;
        if let Some(snapshot) = storage.latest_snapshot()? {
            let index = snapshot.get_metadata().index;
            if index > applied {
                info!(node_id = id, index, applied, "Restoring state machine from log snapshot");
                fsm.restore(&snapshot.data[..])?;
            }
            applied = applied.max(index);
            last_snapshot = index;
        }
        let hard_state = storage
            .initial_state()
            .map_err(|e| MetastoreError::consensus_error("read initial state", e))?
            .hard_state;
        if applied > hard_state.commit {
            warn!(
                node_id = id,
                applied,
                commit = hard_state.commit,
                "State machine is ahead of the log; clamping applied index"
            );
            applied = hard_state.commit.max(last_snapshot);
        }

        let raft_config = raft::Config {
            id,
            election_tick: config.raft.election_tick,
            heartbeat_tick: config.raft.heartbeat_tick,
            applied,
            max_size_per_msg: config.raft.max_size_per_msg,
            max_inflight_msgs: config.raft.max_inflight_msgs,
            pre_vote: config.raft.pre_vote,
            check_quorum: config.raft.check_quorum,
            read_only_option: ReadOnlyOption::Safe,
            ..Default::default()
        };
        raft_config
            .validate()
            .map_err(|e| MetastoreError::consensus_error("validate raft config", e))?;

        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let raw = RawNode::new(&raft_config, storage.clone(), &logger)
            .map_err(|e| MetastoreError::consensus_error("create raft node", e))?;

        let (leader_tx, _) = watch::channel(LeaderState::default());
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            id,
            config,
            core: Mutex::new(Core {
                raw,
                proposals: HashMap::new(),
                reads_waiting: Vec::new(),
                reads_issued: HashMap::new(),
                snapshot: SnapshotPolicy {
                    last_index: last_snapshot,
                    last_at: Instant::now(),
                    in_flight: false,
                },
                was_leader: false,
            }),
            storage,
            fsm,
            transport,
            applied: AtomicU64::new(applied),
            halted: AtomicBool::new(false),
            leader_tx,
            snapshot_tx,
        });

        Ok(Self {
            inner,
            inbound: parking_lot::Mutex::new(Some((inbound, snapshot_rx))),
            shutdown_tx,
            task: parking_lot::Mutex::new(None),
        })
    }

    /// Node ID
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The state machine driven by this node
    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.inner.fsm
    }

    /// Whether a fatal failure stopped the node
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::Acquire)
    }

    /// Start the background loop; campaigns immediately when configured to
    /// bootstrap the cluster
    #[instrument(skip(self), fields(node_id = self.inner.id))]
    pub async fn start(&self) -> Result<()> {
        let Some((inbound, snapshots)) = self.inbound.lock().take() else {
            return Err(MetastoreError::ServiceUnavailable {
                service: "raft".to_string(),
                reason: "node already started".to_string(),
            });
        };
        info!("Starting raft node");

        if self.inner.config.node.bootstrap {
            self.campaign().await?;
        }

        let inner = self.inner.clone();
        let shutdown = self.shutdown_tx.subscribe();
        *self.task.lock() = Some(tokio::spawn(inner.run(inbound, snapshots, shutdown)));
        Ok(())
    }

    /// Stop the background loop and fail everything still waiting on it
    #[instrument(skip(self), fields(node_id = self.inner.id))]
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Raft loop terminated abnormally");
            }
        }
        let mut core = self.inner.core.lock().await;
        self.inner.fail_pending(&mut core, || MetastoreError::ServiceUnavailable {
            service: "raft".to_string(),
            reason: "node is shutting down".to_string(),
        });
        self.inner.leader_tx.send_replace(LeaderState::default());
        info!("Raft node stopped");
    }

    /// Start an election
    pub async fn campaign(&self) -> Result<()> {
        let mut core = self.inner.core.lock().await;
        core.raw
            .campaign()
            .map_err(|e| MetastoreError::consensus_error("campaign", e))?;
        self.inner.process(&mut core)
    }

    /// Replicate `request` and wait for the local state machine to apply it.
    ///
    /// Returns the handler's bincode-encoded response.
    #[instrument(skip(self, request), fields(node_id = self.inner.id, command = %command))]
    pub async fn propose<T: Serialize + Sync>(&self, command: CommandType, request: &T) -> Result<Vec<u8>> {
        let data = RaftLogEntry::new(command, request)?.encode()?;
        let token = uuid::Uuid::new_v4().as_bytes().to_vec();
        let (reply, response) = oneshot::channel();

        {
            let mut core = self.inner.core.lock().await;
            self.inner.ensure_running()?;
            if !core.is_leader() {
                return Err(MetastoreError::NotLeader {
                    operation: command.to_string(),
                    leader: core.leader_hint(),
                });
            }
            if core.raw.raft.lead_transferee.is_some() {
                return Err(MetastoreError::LeadershipTransferInProgress {
                    operation: command.to_string(),
                    leader: core.leader_hint(),
                });
            }

            let contexts = self.inner.fsm.contexts();
            contexts.store(&token, Span::current());
            if let Err(e) = core.raw.propose(token.clone(), data) {
                contexts.delete(&token);
                return Err(match e {
                    raft::Error::ProposalDropped => MetastoreError::LeadershipLost {
                        operation: command.to_string(),
                        leader: core.leader_hint(),
                    },
                    other => MetastoreError::consensus_error("propose", other),
                });
            }
            core.proposals.insert(token.clone(), reply);
            self.inner.process(&mut core)?;
        }

        let timeout = self.inner.config.raft.apply_timeout;
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MetastoreError::Cancelled {
                operation: command.to_string(),
            }),
            Err(_) => {
                self.inner.core.lock().await.proposals.remove(&token);
                self.inner.fsm.contexts().delete(&token);
                Err(MetastoreError::Timeout {
                    operation: command.to_string(),
                    duration: timeout,
                })
            }
        }
    }

    /// Read index certified by the local node as leader
    #[instrument(skip(self), fields(node_id = self.inner.id))]
    pub async fn leader_read_index(&self) -> Result<ReadIndex> {
        let (reply, response) = oneshot::channel();
        {
            let mut core = self.inner.core.lock().await;
            self.inner.ensure_running()?;
            self.inner.enqueue_read(&mut core, reply);
            self.inner.process(&mut core)?;
        }
        let timeout = self.inner.config.raft.apply_timeout;
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MetastoreError::Cancelled {
                operation: "read_index".to_string(),
            }),
            Err(_) => Err(MetastoreError::Timeout {
                operation: "read_index".to_string(),
                duration: timeout,
            }),
        }
    }

    /// Highest log index applied locally; never blocks
    pub fn applied_index(&self) -> u64 {
        self.inner.applied.load(Ordering::Acquire)
    }

    /// Current leadership view
    pub fn leader_state(&self) -> LeaderState {
        *self.inner.leader_tx.borrow()
    }

    /// Subscribe to leadership changes
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.inner.leader_tx.subscribe()
    }

    /// Run `activity` whenever this node is the leader
    pub fn run_on_leader(&self, activity: Arc<dyn LeaderActivity>) -> JoinHandle<()> {
        observer::run_on_leader(
            self.subscribe(),
            self.inner.config.raft.leader_observer_debounce,
            activity,
        )
    }

    /// Hand leadership to the most up-to-date peer.
    ///
    /// Returns `Ok(false)` when the node is not the leader or has no peers.
    #[instrument(skip(self), fields(node_id = self.inner.id))]
    pub async fn transfer_leadership(&self) -> Result<bool> {
        let mut core = self.inner.core.lock().await;
        if !core.is_leader() {
            debug!("Not the leader, nothing to transfer");
            return Ok(false);
        }
        let id = self.inner.id;
        let target = core
            .raw
            .raft
            .prs()
            .iter()
            .filter(|(peer, _)| **peer != id)
            .max_by_key(|(peer, progress)| (progress.matched, std::cmp::Reverse(**peer)))
            .map(|(peer, _)| *peer);
        let Some(target) = target else {
            debug!("No peers to transfer leadership to");
            return Ok(false);
        };

        info!(target, "Transferring leadership");
        core.raw.transfer_leader(target);
        self.inner.process(&mut core)?;
        Ok(true)
    }

    /// Operational snapshot of the node
    pub async fn node_info(&self) -> Result<NodeInfo> {
        let core = self.inner.core.lock().await;
        let raft = &core.raw.raft;
        let peers = self
            .inner
            .storage
            .initial_state()
            .map_err(|e| MetastoreError::consensus_error("read conf state", e))?
            .conf_state
            .voters;
        Ok(NodeInfo {
            server_id: self.inner.id,
            role: raft.state.into(),
            term: raft.term,
            leader_id: core.leader_hint(),
            last_log_index: raft.raft_log.last_index(),
            commit_index: raft.raft_log.committed,
            applied_index: self.applied_index(),
            peers,
            compaction: Default::default(),
        })
    }
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        mut inbound: InboundReceiver,
        mut snapshots: mpsc::UnboundedReceiver<PersistedSnapshot>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.raft.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(node_id = self.id, "Raft loop started");

        loop {
            let result = tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                Some(msg) = inbound.recv() => self.on_inbound(msg).await,
                Some(done) = snapshots.recv() => self.on_snapshot_persisted(done).await,
                _ = shutdown.changed() => break,
            };
            if let Err(e) = result {
                let mut core = self.core.lock().await;
                self.halt(&mut core, &e);
            }
            if self.halted.load(Ordering::Acquire) {
                break;
            }
        }
        info!(node_id = self.id, "Raft loop stopped");
    }

    async fn on_tick(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.raw.tick();
        core.proposals.retain(|_, reply| !reply.is_closed());
        core.reads_waiting.retain(|read| !read.reply.is_closed());
        core.reads_issued.retain(|_, read| !read.reply.is_closed());
        self.maybe_snapshot(&mut core);
        self.process(&mut core)
    }

    async fn on_inbound(&self, msg: Inbound) -> Result<()> {
        let mut core = self.core.lock().await;
        match msg {
            Inbound::Raft(message) => {
                if let Err(e) = core.raw.step(message) {
                    debug!(node_id = self.id, error = %e, "Ignoring raft message");
                }
            }
            Inbound::ReadIndex(reply) => self.enqueue_read(&mut core, reply),
        }
        self.process(&mut core)
    }

    fn enqueue_read(&self, core: &mut Core, reply: Reply<ReadIndex>) {
        if !core.is_leader() {
            let _ = reply.send(Err(MetastoreError::NotLeader {
                operation: "read_index".to_string(),
                leader: core.leader_hint(),
            }));
            return;
        }
        let term = core.raw.raft.term;
        core.reads_waiting.push(PendingRead { term, reply });
    }

    /// Issue waiting reads and drain every available `Ready`.
    ///
    /// Any failure here leaves the log, the raft state and the state machine
    /// out of step, so it halts the node.
    fn process(&self, core: &mut Core) -> Result<()> {
        self.ensure_running()?;
        loop {
            self.issue_reads(core);
            if !core.raw.has_ready() {
                return Ok(());
            }
            if let Err(e) = self.on_ready(core) {
                self.halt(core, &e);
                return Err(e);
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.halted.load(Ordering::Acquire) {
            return Err(halted());
        }
        Ok(())
    }

    /// Stop serving after a fatal failure and hand it to the state
    /// machine's fatal hook
    fn halt(&self, core: &mut Core, err: &MetastoreError) {
        if self.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(node_id = self.id, error = %err, "Raft node halted");
        self.fsm.fail(&format!("raft node {} halted: {err}", self.id));
        self.fail_pending(core, halted);
        core.was_leader = false;
        self.leader_tx.send_replace(LeaderState::default());
    }

    fn issue_reads(&self, core: &mut Core) {
        if core.reads_waiting.is_empty() || !core.is_leader() || !core.committed_in_current_term() {
            return;
        }
        for read in std::mem::take(&mut core.reads_waiting) {
            let ctx = uuid::Uuid::new_v4().as_bytes().to_vec();
            core.raw.read_index(ctx.clone());
            core.reads_issued.insert(ctx, read);
        }
    }

    fn on_ready(&self, core: &mut Core) -> Result<()> {
        let mut ready = core.raw.ready();
        let mut snapshot_targets = Vec::new();

        self.send(ready.take_messages(), &mut snapshot_targets);

        if !ready.snapshot().is_empty() {
            self.install_snapshot(core, ready.snapshot().clone())?;
        }
        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            self.storage.save_hard_state(hs)?;
        }
        self.send(ready.take_persisted_messages(), &mut snapshot_targets);

        for state in ready.take_read_states() {
            self.complete_read(core, state);
        }
        self.apply_committed(core, ready.take_committed_entries())?;

        let mut light = core.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.set_commit(commit)?;
        }
        self.send(light.take_messages(), &mut snapshot_targets);
        self.apply_committed(core, light.take_committed_entries())?;
        core.raw.advance_apply();

        for target in snapshot_targets {
            core.raw.report_snapshot(target, SnapshotStatus::Finish);
        }
        self.publish_leadership(core);
        Ok(())
    }

    fn send(&self, messages: Vec<Message>, snapshot_targets: &mut Vec<NodeId>) {
        for message in messages {
            if message.get_msg_type() == MessageType::MsgSnapshot {
                snapshot_targets.push(message.to);
            }
            self.transport.send(message);
        }
    }

    fn install_snapshot(&self, core: &mut Core, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        info!(node_id = self.id, index, "Installing snapshot from leader");
        if let Err(e) = self.fsm.restore(&snapshot.data[..]) {
            error!(node_id = self.id, index, error = %e, "Failed to restore state machine");
            return Err(e);
        }
        self.storage.apply_snapshot(snapshot)?;
        self.applied.store(index, Ordering::Release);
        core.snapshot.last_index = index;
        core.snapshot.last_at = Instant::now();
        Ok(())
    }

    fn apply_committed(&self, core: &mut Core, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    let outcome = self.fsm.apply(&entry)?;
                    if let Some(reply) = core.proposals.remove(&entry.context[..]) {
                        let _ = reply.send(Ok(outcome.into_response()));
                    }
                }
                EntryType::EntryConfChange => {
                    let cc = ConfChange::decode(&entry.data[..])
                        .map_err(|e| MetastoreError::serialization("ConfChange", e))?;
                    let conf_state = core
                        .raw
                        .apply_conf_change(&cc)
                        .map_err(|e| MetastoreError::consensus_error("apply conf change", e))?;
                    self.storage.set_conf_state(&conf_state)?;
                }
                EntryType::EntryConfChangeV2 => {
                    let cc = ConfChangeV2::decode(&entry.data[..])
                        .map_err(|e| MetastoreError::serialization("ConfChangeV2", e))?;
                    let conf_state = core
                        .raw
                        .apply_conf_change(&cc)
                        .map_err(|e| MetastoreError::consensus_error("apply conf change", e))?;
                    self.storage.set_conf_state(&conf_state)?;
                }
            }
            self.applied.store(entry.index, Ordering::Release);
        }
        Ok(())
    }

    fn complete_read(&self, core: &mut Core, state: ReadState) {
        let Some(read) = core.reads_issued.remove(&state.request_ctx[..]) else {
            return;
        };
        let current = core.raw.raft.term;
        let result = if current != read.term {
            Err(MetastoreError::TermMismatch {
                operation: "read_index".to_string(),
                expected: read.term,
                current,
            })
        } else if !core.is_leader() {
            Err(MetastoreError::LeadershipLost {
                operation: "read_index".to_string(),
                leader: core.leader_hint(),
            })
        } else {
            Ok(ReadIndex {
                commit_index: state.index,
                term: read.term,
            })
        };
        let _ = read.reply.send(result);
    }

    fn publish_leadership(&self, core: &mut Core) {
        let state = LeaderState {
            role: NodeRole::from(core.raw.raft.state),
            term: core.raw.raft.term,
            leader_id: core.leader_hint(),
        };
        self.leader_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });

        let leading = core.is_leader();
        if core.was_leader && !leading {
            warn!(
                node_id = self.id,
                term = state.term,
                leader = ?state.leader_id,
                "Lost leadership; failing pending requests"
            );
            let leader = state.leader_id;
            self.fail_pending(core, || MetastoreError::LeadershipLost {
                operation: "propose".to_string(),
                leader,
            });
        } else if !core.was_leader && leading {
            info!(node_id = self.id, term = state.term, "Became leader");
        }
        core.was_leader = leading;
    }

    fn fail_pending(&self, core: &mut Core, err: impl Fn() -> MetastoreError) {
        for (token, reply) in core.proposals.drain() {
            self.fsm.contexts().delete(&token);
            let _ = reply.send(Err(err()));
        }
        let reads = std::mem::take(&mut core.reads_waiting)
            .into_iter()
            .chain(core.reads_issued.drain().map(|(_, read)| read));
        for read in reads {
            let _ = read.reply.send(Err(err()));
        }
    }

    fn maybe_snapshot(&self, core: &mut Core) {
        if core.snapshot.in_flight {
            return;
        }
        let applied = self.applied.load(Ordering::Acquire);
        let pending = applied.saturating_sub(core.snapshot.last_index);
        let due = pending >= self.config.raft.snapshot_threshold
            || (pending > 0 && core.snapshot.last_at.elapsed() >= self.config.raft.snapshot_interval);
        if !due {
            return;
        }

        // The read transaction pins the state at `applied`; persisting it is
        // the expensive part and runs off the loop
        let snapshot = match self.fsm.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(node_id = self.id, error = %e, "Failed to open state machine snapshot");
                return;
            }
        };
        core.snapshot.in_flight = true;
        debug!(node_id = self.id, index = applied, "Taking snapshot");

        let done = self.snapshot_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut data = Vec::new();
            let result = snapshot.persist(&mut data).map(|_| data);
            let _ = done.send(PersistedSnapshot {
                index: applied,
                result,
            });
        });
    }

    async fn on_snapshot_persisted(&self, done: PersistedSnapshot) -> Result<()> {
        let mut core = self.core.lock().await;
        core.snapshot.in_flight = false;
        core.snapshot.last_at = Instant::now();

        let data = match done.result {
            Ok(data) => data,
            Err(e) => {
                warn!(node_id = self.id, index = done.index, error = %e, "Failed to persist snapshot");
                return Ok(());
            }
        };
        if done.index <= core.snapshot.last_index {
            // A snapshot from the leader superseded this one
            return Ok(());
        }

        let conf_state = self
            .storage
            .initial_state()
            .map_err(|e| MetastoreError::consensus_error("read conf state", e))?
            .conf_state;
        let size = data.len();
        self.storage.create_snapshot(done.index, conf_state, data)?;
        core.snapshot.last_index = done.index;

        let compact_to = done.index.saturating_sub(self.config.raft.trailing_logs);
        if compact_to > 0 {
            self.storage.compact(compact_to)?;
        }
        info!(
            node_id = self.id,
            index = done.index,
            size,
            compacted_to = compact_to,
            "Snapshot stored"
        );
        Ok(())
    }
}

fn halted() -> MetastoreError {
    MetastoreError::ServiceUnavailable {
        service: "raft".to_string(),
        reason: "node halted after a fatal failure".to_string(),
    }
}

#[async_trait]
impl Leader for RaftNode {
    async fn read_index(&self) -> Result<ReadIndex> {
        let state = self.leader_state();
        if state.is_leader() {
            return self.leader_read_index().await;
        }
        match state.leader_id {
            Some(leader) => self.inner.transport.read_index(self.inner.id, leader).await,
            None => Err(MetastoreError::NotLeader {
                operation: "read_index".to_string(),
                leader: None,
            }),
        }
    }
}

impl ReplicaState for RaftNode {
    fn applied_index(&self) -> u64 {
        RaftNode::applied_index(self)
    }

    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        self.inner.fsm.read(f)
    }
}

/// Wait until some node in `nodes` reports itself leader
pub async fn wait_for_leader(nodes: &[Arc<RaftNode>], timeout: Duration) -> Result<Arc<RaftNode>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(node) = nodes.iter().find(|n| n.leader_state().is_leader()) {
            return Ok(node.clone());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(MetastoreError::Timeout {
                operation: "wait for leader".to_string(),
                duration: timeout,
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
