//! Leadership observation
//!
//! Components that must run only on the leader implement [`LeaderActivity`]
//! and are driven by a watcher over the node's leadership channel. Changes
//! are debounced: a burst of transitions collapses into the final state, and
//! `start`/`stop` strictly alternate. Leadership is tracked per term, so a
//! burst that ends with the node leading in a newer term restarts the
//! activity even if the intermediate follower state was never observed.

use crate::types::LeaderState;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Work that runs while the local node is the leader.
///
/// Calls alternate: `start`, `stop`, `start`, ... Each `start` belongs to a
/// single term. Implementations should return quickly and spawn whatever
/// long-running work they need.
pub trait LeaderActivity: Send + Sync + 'static {
    /// The node became leader
    fn start(&self);

    /// The node stopped being leader, or is shutting down
    fn stop(&self);
}

/// Drive `activity` from leadership changes published on `state`.
///
/// The task ends when the publishing node is dropped; a running activity is
/// stopped first.
pub fn run_on_leader(
    mut state: watch::Receiver<LeaderState>,
    debounce: Duration,
    activity: Arc<dyn LeaderActivity>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Term of the running activity
        let mut active: Option<u64> = None;
        loop {
            let (leading, term) = {
                let current = state.borrow_and_update();
                (current.is_leader(), current.term)
            };
            match (active, leading) {
                (Some(started), true) if started == term => {}
                (Some(started), true) => {
                    info!(from = started, to = term, "Leadership moved to a new term, restarting leader activity");
                    activity.stop();
                    activity.start();
                    active = Some(term);
                }
                (None, true) => {
                    info!(term, "Leadership acquired, starting leader activity");
                    activity.start();
                    active = Some(term);
                }
                (Some(started), false) => {
                    info!(term = started, "Leadership lost, stopping leader activity");
                    activity.stop();
                    active = None;
                }
                (None, false) => {}
            }

            if state.changed().await.is_err() {
                break;
            }
            // Let flapping settle before acting on the latest value
            if !debounce.is_zero() {
                tokio::time::sleep(debounce).await;
            }
        }
        if active.is_some() {
            debug!("Leadership channel closed, stopping leader activity");
            activity.stop();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeRole;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl LeaderActivity for Recorder {
        fn start(&self) {
            self.0.lock().push("start");
        }
        fn stop(&self) {
            self.0.lock().push("stop");
        }
    }

    fn state(role: NodeRole, term: u64) -> LeaderState {
        LeaderState {
            role,
            term,
            leader_id: Some(1),
        }
    }

    #[tokio::test]
    async fn test_start_stop_alternate() {
        let (tx, rx) = watch::channel(LeaderState::default());
        let recorder = Arc::new(Recorder::default());
        let handle = run_on_leader(rx, Duration::from_millis(20), recorder.clone());

        tx.send(state(NodeRole::Leader, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*recorder.0.lock(), vec!["start"]);

        // Same term: nothing to do
        tx.send(state(NodeRole::Leader, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*recorder.0.lock(), vec!["start"]);

        tx.send(state(NodeRole::Follower, 2)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*recorder.0.lock(), vec!["start", "stop"]);

        tx.send(state(NodeRole::Leader, 3)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(tx);
        handle.await.unwrap();
        assert_eq!(*recorder.0.lock(), vec!["start", "stop", "start", "stop"]);
    }

    #[tokio::test]
    async fn test_flap_across_terms_restarts() {
        let (tx, rx) = watch::channel(LeaderState::default());
        let recorder = Arc::new(Recorder::default());
        let handle = run_on_leader(rx, Duration::from_millis(20), recorder.clone());

        tx.send(state(NodeRole::Leader, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*recorder.0.lock(), vec!["start"]);

        // The follower state is hidden by the debounce window, but the
        // leadership of term 1 ended with it
        tx.send(state(NodeRole::Follower, 2)).unwrap();
        tx.send(state(NodeRole::Leader, 3)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*recorder.0.lock(), vec!["start", "stop", "start"]);

        drop(tx);
        handle.await.unwrap();
        assert_eq!(*recorder.0.lock(), vec!["start", "stop", "start", "stop"]);
    }

    #[tokio::test]
    async fn test_initially_leader() {
        let (tx, rx) = watch::channel(state(NodeRole::Leader, 1));
        let recorder = Arc::new(Recorder::default());
        let handle = run_on_leader(rx, Duration::ZERO, recorder.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(tx);
        handle.await.unwrap();
        assert_eq!(*recorder.0.lock(), vec!["start", "stop"]);
    }
}
