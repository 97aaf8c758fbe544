//! Compaction job queue
//!
//! Jobs are kept per compaction level in an ordered set keyed by
//! `(status, lease_expires_at, name)`: unassigned jobs first, then the
//! earliest lease deadline, then the name. The order is a pure function of
//! the job state, so every replica dequeues the same job for the same log
//! entry.
//!
//! Ownership is fenced: a worker's token is the log index of the entry that
//! leased the job to it. Updates and evictions carrying a token lower than
//! the recorded one come from a previous owner and are rejected.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Lifecycle of a compaction job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobStatus {
    /// Waiting for a worker
    Initial,
    /// Leased to a worker
    InProgress,
    /// Exceeded the failure budget; never assigned again
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Initial => write!(f, "initial"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A batch of blocks to be merged by a single worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompactionJob {
    /// Deterministic name derived from level, shard and block ids
    pub name: String,
    /// Tenant of the source blocks
    pub tenant: String,
    /// Shard of the source blocks
    pub shard: u32,
    /// Compaction level of the source blocks
    pub level: u32,
    /// Current status
    pub status: JobStatus,
    /// Lease deadline, unix millis; zero when unassigned
    pub lease_expires_at: i64,
    /// Fencing token of the current owner
    pub token: u64,
    /// Failed attempts so far
    pub failures: u32,
    /// Source block ids
    pub blocks: Vec<String>,
    /// Unix millis of the entry that created the job
    pub added_at: i64,
}

impl CompactionJob {
    fn key(&self) -> JobKey {
        (self.status, self.lease_expires_at, self.name.clone())
    }

    /// Whether `dequeue(now, _)` may hand this job out
    pub fn is_assignable(&self, now: i64) -> bool {
        match self.status {
            JobStatus::Initial => true,
            JobStatus::InProgress => self.lease_expires_at <= now,
            JobStatus::Cancelled => false,
        }
    }
}

type JobKey = (JobStatus, i64, String);

/// Per-level priority queues of compaction jobs
#[derive(Debug)]
pub struct JobQueue {
    lease: i64,
    jobs: HashMap<String, CompactionJob>,
    // Indexed by level, grown on demand
    levels: Vec<BTreeSet<JobKey>>,
}

impl JobQueue {
    /// Create an empty queue granting leases of `lease_millis`
    pub fn new(lease_millis: i64) -> Self {
        Self {
            lease: lease_millis,
            jobs: HashMap::new(),
            levels: Vec::new(),
        }
    }

    /// Lease duration in millis
    pub fn lease(&self) -> i64 {
        self.lease
    }

    fn level_mut(&mut self, level: u32) -> &mut BTreeSet<JobKey> {
        let level = level as usize;
        if level >= self.levels.len() {
            self.levels.resize_with(level + 1, BTreeSet::new);
        }
        &mut self.levels[level]
    }

    /// Add a job as-is. Returns false if a job with the same name exists.
    pub fn enqueue(&mut self, job: CompactionJob) -> bool {
        if self.jobs.contains_key(&job.name) {
            return false;
        }
        let key = job.key();
        self.level_mut(job.level).insert(key);
        self.jobs.insert(job.name.clone(), job);
        true
    }

    /// Lease the highest priority assignable job to `token`.
    ///
    /// Levels are visited from the lowest. Within a level only the head is
    /// considered: if it is leased and the lease has not expired, nothing
    /// behind it is assignable either.
    pub fn dequeue(&mut self, now: i64, token: u64) -> Option<CompactionJob> {
        let name = self.levels.iter().find_map(|level| {
            let (status, lease_expires_at, name) = level.first()?;
            let assignable = match status {
                JobStatus::Initial => true,
                JobStatus::InProgress => *lease_expires_at <= now,
                JobStatus::Cancelled => false,
            };
            assignable.then(|| name.clone())
        })?;
        let lease = self.lease;
        self.modify(&name, |job| {
            job.status = JobStatus::InProgress;
            job.lease_expires_at = now.saturating_add(lease);
            job.token = token;
        })
    }

    /// Renew the lease of `name` for its owner.
    ///
    /// Fails if the job is not leased or `token` is older than the recorded
    /// one.
    pub fn update(&mut self, name: &str, now: i64, token: u64) -> bool {
        if !self.is_owner(name, token) {
            return false;
        }
        let lease = self.lease;
        self.modify(name, |job| {
            job.status = JobStatus::InProgress;
            job.lease_expires_at = now.saturating_add(lease);
            job.token = token;
        })
        .is_some()
    }

    /// Remove a completed job. Same fencing rule as [`JobQueue::update`],
    /// except that cancelled jobs may be evicted.
    pub fn evict(&mut self, name: &str, token: u64) -> Option<CompactionJob> {
        match self.jobs.get(name) {
            Some(job) if job.status != JobStatus::Initial && token >= job.token => {}
            _ => return None,
        }
        let job = self.jobs.remove(name)?;
        if let Some(level) = self.levels.get_mut(job.level as usize) {
            level.remove(&job.key());
        }
        Some(job)
    }

    /// Record a failed attempt reported by the owner.
    ///
    /// The job is cancelled once `max_failures` is reached, and returned to
    /// the queue otherwise. Returns the updated job, or `None` if the report
    /// was rejected.
    pub fn fail(&mut self, name: &str, token: u64, max_failures: u32) -> Option<CompactionJob> {
        if !self.is_owner(name, token) {
            return None;
        }
        self.modify(name, |job| {
            job.failures += 1;
            job.lease_expires_at = 0;
            job.status = if job.failures >= max_failures {
                JobStatus::Cancelled
            } else {
                JobStatus::Initial
            };
        })
    }

    /// Whether `token` holds the lease of `name`.
    ///
    /// Only leased jobs have an owner: a job waiting in the queue, including
    /// one returned after a failure, must be dequeued again first.
    pub fn is_owner(&self, name: &str, token: u64) -> bool {
        self.jobs
            .get(name)
            .is_some_and(|job| job.status == JobStatus::InProgress && token >= job.token)
    }

    fn modify(&mut self, name: &str, f: impl FnOnce(&mut CompactionJob)) -> Option<CompactionJob> {
        let job = self.jobs.get_mut(name)?;
        let level = job.level as usize;
        let old = job.key();
        f(job);
        let new = job.key();
        let updated = job.clone();
        if let Some(queue) = self.levels.get_mut(level) {
            queue.remove(&old);
            queue.insert(new);
        }
        Some(updated)
    }

    /// Look up a job by name
    pub fn get(&self, name: &str) -> Option<&CompactionJob> {
        self.jobs.get(name)
    }

    /// All jobs, in priority order within each level
    pub fn iter(&self) -> impl Iterator<Item = &CompactionJob> + '_ {
        self.levels
            .iter()
            .flat_map(|level| level.iter())
            .filter_map(|(_, _, name)| self.jobs.get(name))
    }

    /// Number of jobs with `status`
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|job| job.status == status).count()
    }

    /// Number of jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drop every job
    pub fn clear(&mut self) {
        self.jobs.clear();
        self.levels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const LEASE: i64 = 15_000;

    fn job(name: &str, level: u32) -> CompactionJob {
        CompactionJob {
            name: name.to_string(),
            tenant: "t".to_string(),
            shard: 1,
            level,
            status: JobStatus::Initial,
            lease_expires_at: 0,
            token: 0,
            failures: 0,
            blocks: vec![format!("{name}-block")],
            added_at: 0,
        }
    }

    fn leased(name: &str, token: u64, lease_expires_at: i64) -> CompactionJob {
        CompactionJob {
            status: JobStatus::InProgress,
            token,
            lease_expires_at,
            ..job(name, 0)
        }
    }

    #[test]
    fn test_lease_lifecycle() {
        let mut queue = JobQueue::new(LEASE);
        assert!(queue.enqueue(job("a", 0)));
        assert!(!queue.enqueue(job("a", 0)));

        let assigned = queue.dequeue(100, 1).unwrap();
        assert_eq!(assigned.status, JobStatus::InProgress);
        assert_eq!(assigned.lease_expires_at, 100 + LEASE);
        assert_eq!(assigned.token, 1);

        // Lease still held
        assert!(queue.dequeue(101, 2).is_none());

        assert!(!queue.update("a", 101, 0));
        assert!(queue.update("a", 5_000, 1));
        assert_eq!(queue.get("a").unwrap().lease_expires_at, 5_000 + LEASE);

        assert!(queue.evict("a", 0).is_none());
        assert!(queue.evict("a", 1).is_some());
        assert!(queue.is_empty());
        assert!(queue.dequeue(i64::MAX, 3).is_none());
    }

    #[test]
    fn test_expired_lease_is_reassigned() {
        let mut queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));
        queue.dequeue(0, 1).unwrap();

        let reassigned = queue.dequeue(LEASE, 7).unwrap();
        assert_eq!(reassigned.token, 7);
        assert_eq!(reassigned.lease_expires_at, 2 * LEASE);

        // The previous owner lost the job
        assert!(!queue.update("a", LEASE + 1, 1));
        assert!(queue.evict("a", 1).is_none());
        assert!(queue.update("a", LEASE + 1, 7));
    }

    #[test]
    fn test_levels_are_visited_in_order() {
        let mut queue = JobQueue::new(LEASE);
        queue.enqueue(job("1", 1));
        queue.enqueue(job("2", 0));
        queue.enqueue(job("3", 0));
        queue.enqueue(leased("4", 1, 10));

        let names: Vec<_> = std::iter::from_fn(|| queue.dequeue(0, 1))
            .map(|job| job.name)
            .collect();
        assert_eq!(names, vec!["2", "3", "1"]);
    }

    #[test]
    fn test_failures_cancel_the_job() {
        let mut queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));

        for attempt in 1..3u64 {
            queue.dequeue(0, attempt).unwrap();
            let failed = queue.fail("a", attempt, 3).unwrap();
            assert_eq!(failed.status, JobStatus::Initial);
            assert_eq!(failed.failures, attempt as u32);
        }
        queue.dequeue(0, 3).unwrap();
        assert!(queue.fail("a", 2, 3).is_none());
        let failed = queue.fail("a", 3, 3).unwrap();
        assert_eq!(failed.status, JobStatus::Cancelled);

        assert!(queue.dequeue(i64::MAX, 4).is_none());
        assert!(!queue.update("a", 0, 4));
        assert_eq!(queue.count(JobStatus::Cancelled), 1);
        assert!(queue.evict("a", 4).is_some());
    }

    #[test]
    fn test_iter_follows_priority() {
        let mut queue = JobQueue::new(LEASE);
        queue.enqueue(leased("b", 1, 50));
        queue.enqueue(leased("a", 1, 20));
        queue.enqueue(job("c", 0));
        let names: Vec<_> = queue.iter().map(|job| job.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_unleased_job_has_no_owner() {
        let mut queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));
        assert!(!queue.is_owner("a", 0));
        assert!(!queue.update("a", 0, 0));
        assert!(queue.fail("a", 0, 3).is_none());
        assert!(queue.evict("a", 0).is_none());
        assert_eq!(queue.get("a"), Some(&job("a", 0)));

        // A failed job goes back to the queue and loses its owner
        queue.dequeue(0, 5).unwrap();
        queue.fail("a", 5, 3).unwrap();
        assert!(!queue.update("a", 10, 5));
        assert!(queue.evict("a", 5).is_none());
        assert!(queue.fail("a", 5, 3).is_none());
        assert_eq!(queue.get("a").unwrap().failures, 1);
    }

    #[test]
    fn test_lease_deadline_saturates() {
        let mut queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));
        let assigned = queue.dequeue(i64::MAX - 1, 1).unwrap();
        assert_eq!(assigned.lease_expires_at, i64::MAX);
        assert!(queue.update("a", i64::MAX, 1));
        assert_eq!(queue.get("a").unwrap().lease_expires_at, i64::MAX);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Advance(i64),
        Dequeue,
        Renew(prop::sample::Index),
        Fail(prop::sample::Index),
        Evict(prop::sample::Index),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..2 * LEASE).prop_map(Op::Advance),
            Just(Op::Dequeue),
            any::<prop::sample::Index>().prop_map(Op::Renew),
            any::<prop::sample::Index>().prop_map(Op::Fail),
            any::<prop::sample::Index>().prop_map(Op::Evict),
        ]
    }

    fn status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Initial),
            Just(JobStatus::InProgress),
            Just(JobStatus::Cancelled),
        ]
    }

    proptest! {
        #[test]
        fn fencing_is_monotonic(assigned in 1u64..1_000, other in 0u64..2_000, now in 0i64..100_000) {
            let mut queue = JobQueue::new(LEASE);
            queue.enqueue(job("j", 0));
            queue.dequeue(now, assigned).unwrap();

            let accepted = queue.update("j", now, other);
            prop_assert_eq!(accepted, other >= assigned);
            let evicted = queue.evict("j", other).is_some();
            prop_assert_eq!(evicted, other >= assigned);
        }

        #[test]
        fn dequeue_follows_priority(
            jobs in proptest::collection::vec((status(), 0i64..1_000), 1..20),
            now in 0i64..2_000,
        ) {
            let mut queue = JobQueue::new(LEASE);
            for (i, (status, lease_expires_at)) in jobs.iter().enumerate() {
                let mut j = job(&format!("{i:03}"), 0);
                j.status = *status;
                j.lease_expires_at = *lease_expires_at;
                j.token = 1;
                queue.enqueue(j);
            }

            let mut expected: Vec<_> = queue
                .iter()
                .filter(|j| j.is_assignable(now))
                .map(|j| j.key())
                .collect();
            expected.sort();

            let mut assigned = Vec::new();
            while let Some(j) = queue.dequeue(now, 2) {
                assigned.push(j.name);
            }
            let expected: Vec<_> = expected.into_iter().map(|(_, _, name)| name).collect();
            prop_assert_eq!(assigned, expected);
            prop_assert!(queue.iter().all(|j| !j.is_assignable(now)));
        }

        #[test]
        fn stale_owners_are_fenced_across_reassignments(ops in proptest::collection::vec(op(), 1..80)) {
            let mut queue = JobQueue::new(LEASE);
            queue.enqueue(job("j", 0));
            let mut now = 0i64;
            let mut next_token = 1u64;
            // Tokens handed out so far, oldest first
            let mut issued: Vec<u64> = Vec::new();
            let pick = |issued: &Vec<u64>, index: &prop::sample::Index| {
                if issued.is_empty() { 0 } else { *index.get(issued) }
            };

            for op in ops {
                let Some(current) = queue.get("j").cloned() else {
                    break;
                };
                let owns = |token: u64| current.status == JobStatus::InProgress && token >= current.token;
                match op {
                    Op::Advance(ms) => now += ms,
                    Op::Dequeue => {
                        let token = next_token;
                        next_token += 1;
                        match queue.dequeue(now, token) {
                            Some(assigned) => {
                                prop_assert!(current.is_assignable(now));
                                prop_assert_eq!(assigned.token, token);
                                prop_assert_eq!(assigned.lease_expires_at, now + LEASE);
                                issued.push(token);
                            }
                            None => prop_assert!(!current.is_assignable(now)),
                        }
                    }
                    Op::Renew(index) => {
                        let token = pick(&issued, &index);
                        prop_assert_eq!(queue.update("j", now, token), owns(token));
                    }
                    Op::Fail(index) => {
                        let token = pick(&issued, &index);
                        prop_assert_eq!(queue.fail("j", token, 3).is_some(), owns(token));
                    }
                    Op::Evict(index) => {
                        let token = pick(&issued, &index);
                        let allowed = current.status != JobStatus::Initial && token >= current.token;
                        prop_assert_eq!(queue.evict("j", token).is_some(), allowed);
                    }
                }
                // Only the latest lease holder changes the job
                if let (Some(after), Some(latest)) = (queue.get("j"), issued.last()) {
                    prop_assert!(after.token == *latest);
                }
            }
        }

        #[test]
        fn expired_lease_is_reassigned(t0 in 0i64..1_000_000, extra in 0i64..1_000_000) {
            let mut queue = JobQueue::new(LEASE);
            queue.enqueue(job("j", 0));
            queue.dequeue(t0, 1).unwrap();

            let now = t0 + LEASE + extra;
            let job = queue.dequeue(now, 2).unwrap();
            prop_assert_eq!(job.token, 2);
            prop_assert_eq!(job.lease_expires_at, now + LEASE);
            prop_assert!(!queue.update("j", now, 1));
        }
    }
}
