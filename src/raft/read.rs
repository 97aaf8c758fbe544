//! Consistent reads
//!
//! Implements the read-index pattern: obtain the leader's commit index
//! (locally when leading, over RPC otherwise), wait for the local state
//! machine to apply up to it, then read. The data observed is never older
//! than the read index, but may be newer.

use crate::error::{MetastoreError, Result};
use crate::types::ReadIndex;

use async_trait::async_trait;
use redb::ReadTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Source of read indexes
#[async_trait]
pub trait Leader: Send + Sync {
    /// Commit index certified by the current leader
    async fn read_index(&self) -> Result<ReadIndex>;
}

/// Local replica the read is served from
pub trait ReplicaState: Send + Sync {
    /// Highest log index applied locally
    fn applied_index(&self) -> u64;

    /// Run `f` inside a read transaction on the local state machine
    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T>;
}

/// Read-only access to the replicated state
pub struct StateReader<L, S> {
    leader: Arc<L>,
    state: Arc<S>,
    check_interval: Duration,
    max_distance: u64,
}

impl<L, S> std::fmt::Debug for StateReader<L, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReader")
            .field("check_interval", &self.check_interval)
            .field("max_distance", &self.max_distance)
            .finish()
    }
}

impl<L: Leader, S: ReplicaState> StateReader<L, S> {
    /// Create a reader. `max_distance` of zero disables the lag check.
    pub fn new(leader: Arc<L>, state: Arc<S>, check_interval: Duration, max_distance: u64) -> Self {
        Self {
            leader,
            state,
            check_interval,
            max_distance,
        }
    }

    /// Run `f` against state that reflects every write committed before the
    /// call.
    ///
    /// Errors returned before `f` runs guarantee the state was not accessed;
    /// they can be retried, possibly on another replica.
    pub async fn consistent_read<T>(
        &self,
        deadline: Instant,
        f: impl FnOnce(&ReadTransaction, ReadIndex) -> Result<T>,
    ) -> Result<T> {
        self.try_consistent_read(deadline, f)
            .await
            .map_err(MetastoreError::consistent_read)
    }

    async fn try_consistent_read<T>(
        &self,
        deadline: Instant,
        f: impl FnOnce(&ReadTransaction, ReadIndex) -> Result<T>,
    ) -> Result<T> {
        let read_index = self.wait_leader_commit_index_applied(deadline).await?;
        self.state.read(|tx| {
            // A snapshot restore may have rewound the state between the
            // wait above and the start of this transaction.
            let applied = self.state.applied_index();
            if applied < read_index.commit_index {
                return Err(MetastoreError::Aborted {
                    applied,
                    commit_index: read_index.commit_index,
                });
            }
            f(tx, read_index)
        })
    }

    /// Obtain a read index and block until the local replica has applied it
    pub async fn wait_leader_commit_index_applied(&self, deadline: Instant) -> Result<ReadIndex> {
        let read_index = self.leader.read_index().await?;
        trace!(
            commit_index = read_index.commit_index,
            term = read_index.term,
            "Obtained read index"
        );
        wait_index_reached(
            || self.state.applied_index(),
            read_index.commit_index,
            self.check_interval,
            self.max_distance,
            deadline,
        )
        .await?;
        Ok(read_index)
    }
}

/// Poll `src` until it reaches `dst`.
///
/// Fails with [`MetastoreError::LagBehind`] as soon as `dst - src` exceeds
/// `max_distance` (zero disables the check), and with
/// [`MetastoreError::Timeout`] once `deadline` passes.
pub async fn wait_index_reached(
    src: impl Fn() -> u64,
    dst: u64,
    interval: Duration,
    max_distance: u64,
    deadline: Instant,
) -> Result<()> {
    let started = Instant::now();
    if compare_index(&src, dst, max_distance)? {
        return Ok(());
    }
    let mut ticker = tokio::time::interval_at(started + interval, interval);
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                debug!(target_index = dst, current = src(), "Index wait timed out");
                return Err(MetastoreError::Timeout {
                    operation: format!("wait for index {dst}"),
                    duration: started.elapsed(),
                });
            }
            _ = ticker.tick() => {
                if compare_index(&src, dst, max_distance)? {
                    return Ok(());
                }
            }
        }
    }
}

fn compare_index(src: &impl Fn() -> u64, dst: u64, max_distance: u64) -> Result<bool> {
    let current = src();
    if max_distance > 0 && dst.saturating_sub(current) > max_distance {
        return Err(MetastoreError::LagBehind {
            applied: current,
            target: dst,
        });
    }
    Ok(current >= dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use redb::{Database, ReadableTable, TableDefinition};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    const KV: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("kv");

    struct FixedLeader(Result<ReadIndex>);

    #[async_trait]
    impl Leader for FixedLeader {
        async fn read_index(&self) -> Result<ReadIndex> {
            match &self.0 {
                Ok(index) => Ok(*index),
                Err(_) => Err(MetastoreError::NotLeader {
                    operation: "read_index".to_string(),
                    leader: Some(2),
                }),
            }
        }
    }

    struct Replica {
        _dir: TempDir,
        db: Database,
        applied: AtomicU64,
        // Values returned by the next applied_index calls, before `applied`
        scripted: Mutex<VecDeque<u64>>,
    }

    impl Replica {
        fn new(applied: u64) -> Self {
            let dir = TempDir::new().unwrap();
            let db = Database::create(dir.path().join("kv.db")).unwrap();
            let tx = db.begin_write().unwrap();
            tx.open_table(KV)
                .unwrap()
                .insert(&b"k"[..], &b"v"[..])
                .unwrap();
            tx.commit().unwrap();
            Self {
                _dir: dir,
                db,
                applied: AtomicU64::new(applied),
                scripted: Mutex::new(VecDeque::new()),
            }
        }
    }

    impl ReplicaState for Replica {
        fn applied_index(&self) -> u64 {
            self.scripted
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.applied.load(Ordering::SeqCst))
        }

        fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
            let tx = self.db.begin_read().unwrap();
            f(&tx)
        }
    }

    fn reader(leader: FixedLeader, replica: Arc<Replica>, max_distance: u64) -> StateReader<FixedLeader, Replica> {
        StateReader::new(Arc::new(leader), replica, Duration::from_millis(5), max_distance)
    }

    fn at(commit_index: u64) -> FixedLeader {
        FixedLeader(Ok(ReadIndex {
            commit_index,
            term: 1,
        }))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[tokio::test]
    async fn test_read_when_caught_up() {
        let replica = Arc::new(Replica::new(10));
        let value = reader(at(10), replica, 0)
            .consistent_read(deadline(), |tx, index| {
                assert_eq!(index.commit_index, 10);
                let table = tx.open_table(KV).unwrap();
                Ok(table.get(&b"k"[..]).unwrap().unwrap().value().to_vec())
            })
            .await
            .unwrap();
        assert_eq!(value, b"v");
    }

    #[tokio::test]
    async fn test_read_waits_for_catch_up() {
        let replica = Arc::new(Replica::new(5));
        let catch_up = {
            let replica = replica.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                replica.applied.store(12, Ordering::SeqCst);
            })
        };
        let read = reader(at(12), replica, 0)
            .consistent_read(deadline(), |_, index| Ok(index))
            .await
            .unwrap();
        assert_eq!(read.commit_index, 12);
        catch_up.await.unwrap();
    }

    #[tokio::test]
    async fn test_lag_behind_fails_fast() {
        let replica = Arc::new(Replica::new(1));
        let err = reader(at(500), replica, 100)
            .consistent_read(deadline(), |_, _| Ok(()))
            .await
            .unwrap_err();
        match err {
            MetastoreError::ConsistentRead { source } => {
                assert!(matches!(*source, MetastoreError::LagBehind { applied: 1, target: 500 }))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rewound_state_aborts() {
        let replica = Arc::new(Replica::new(3));
        // Caught up during the wait, rewound by the time the transaction opens
        replica.scripted.lock().extend([10, 3]);
        let err = reader(at(10), replica, 0)
            .consistent_read(deadline(), |_, _| -> Result<()> {
                panic!("state must not be accessed")
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.category(), "consistency");
        match err {
            MetastoreError::ConsistentRead { source } => assert!(matches!(
                *source,
                MetastoreError::Aborted {
                    applied: 3,
                    commit_index: 10
                }
            )),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_leader_error_is_wrapped() {
        let replica = Arc::new(Replica::new(3));
        let err = reader(FixedLeader(Err(MetastoreError::validation("x", "y"))), replica, 0)
            .consistent_read(deadline(), |_, _| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.leader_hint(), Some(2));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_deadline() {
        let replica = Arc::new(Replica::new(0));
        let err = reader(at(1), replica, 0)
            .consistent_read(Instant::now() + Duration::from_millis(30), |_, _| Ok(()))
            .await
            .unwrap_err();
        match err {
            MetastoreError::ConsistentRead { source } => {
                assert!(matches!(*source, MetastoreError::Timeout { .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wait_index_reached_immediate() {
        let past = Instant::now();
        wait_index_reached(|| 7, 7, Duration::from_millis(1), 0, past)
            .await
            .unwrap();
        assert!(compare_index(&|| 0, 10, 5).is_err());
        assert!(!compare_index(&|| 0, 10, 0).unwrap());
    }
}
