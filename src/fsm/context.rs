//! Proposer span registry
//!
//! The replicated log only carries serialized commands, so the proposer's
//! tracing span cannot travel with the entry. The leader parks the span here
//! under the proposal's correlation token; the apply path takes it back out
//! when it reaches that entry. Followers never find a span and apply under a
//! fresh root span.
//!
//! Entries that are never consumed (a proposal dropped by the raft layer, a
//! leadership change before commit) are swept after a TTL.

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, Span};

/// Time-bounded map from correlation token to proposer span
#[derive(Debug, Default)]
pub struct ContextRegistry {
    entries: DashMap<Vec<u8>, (Span, Instant)>,
}

impl ContextRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `span` under `token`
    pub fn store(&self, token: &[u8], span: Span) {
        self.entries.insert(token.to_vec(), (span, Instant::now()));
    }

    /// Take the span stored under `token`, if still present
    pub fn retrieve(&self, token: &[u8]) -> Option<Span> {
        if token.is_empty() {
            return None;
        }
        self.entries.remove(token).map(|(_, (span, _))| span)
    }

    /// Drop the span stored under `token`
    pub fn delete(&self, token: &[u8]) {
        self.entries.remove(token);
    }

    /// Number of parked spans
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Remove entries older than `ttl`; returns how many were dropped
    pub fn sweep(&self, ttl: Duration) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries
            .retain(|_, (_, stored_at)| now.saturating_duration_since(*stored_at) < ttl);
        before.saturating_sub(self.entries.len())
    }

    /// Start the background sweeper.
    ///
    /// The task holds a weak reference and exits once the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, ttl: Duration) -> tokio::task::JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = (ttl / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.sweep(ttl);
                if removed > 0 {
                    debug!(removed, "Swept expired proposal contexts");
                }
            }
        })
    }
}
