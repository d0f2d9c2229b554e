//! Process-wide transaction counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct TransactionStats {
    begins: AtomicU64,
    commits: AtomicU64,
    commit_changes: AtomicU64,
    commit_time_nanos: AtomicU64,
    conflicts: AtomicU64,
    not_colocated: AtomicU64,
    other_failures: AtomicU64,
    rollbacks: AtomicU64,
    rollback_changes: AtomicU64,
    expired: AtomicU64,
    in_progress: AtomicU64,
    suspended: AtomicU64,
    degraded_commits: AtomicU64,
    markers_placed: AtomicU64,
    reservation_timeouts: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub begins: u64,
    pub commits: u64,
    pub commit_changes: u64,
    pub commit_time: Duration,
    pub conflicts: u64,
    pub not_colocated: u64,
    pub other_failures: u64,
    pub rollbacks: u64,
    pub rollback_changes: u64,
    pub expired: u64,
    pub in_progress: u64,
    pub suspended: u64,
    pub degraded_commits: u64,
    pub markers_placed: u64,
    /// Non-transactional writes that gave up waiting for a marker.
    pub reservation_timeouts: u64,
}

impl TransactionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self) {
        self.begins.fetch_add(1, Ordering::Relaxed);
        self.in_progress.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn commit(&self, changes: usize, elapsed: Duration, degraded: bool) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.commit_changes
            .fetch_add(changes as u64, Ordering::Relaxed);
        self.commit_time_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if degraded {
            self.degraded_commits.fetch_add(1, Ordering::Relaxed);
        }
        self.end();
    }

    pub(crate) fn conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        self.end();
    }

    pub(crate) fn not_colocated(&self) {
        self.not_colocated.fetch_add(1, Ordering::Relaxed);
        self.end();
    }

    /// A commit that failed for a reason other than conflict or colocation.
    pub(crate) fn failure(&self) {
        self.other_failures.fetch_add(1, Ordering::Relaxed);
        self.end();
    }

    pub(crate) fn rollback(&self, changes: usize) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.rollback_changes
            .fetch_add(changes as u64, Ordering::Relaxed);
        self.end();
    }

    pub(crate) fn expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn suspended(&self) {
        self.suspended.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn resumed(&self) {
        self.suspended.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn markers_placed(&self, count: usize) {
        self.markers_placed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn reservation_timeout(&self) {
        self.reservation_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn end(&self) {
        self.in_progress.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            begins: self.begins.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_changes: self.commit_changes.load(Ordering::Relaxed),
            commit_time: Duration::from_nanos(self.commit_time_nanos.load(Ordering::Relaxed)),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            not_colocated: self.not_colocated.load(Ordering::Relaxed),
            other_failures: self.other_failures.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            rollback_changes: self.rollback_changes.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            in_progress: self.in_progress.load(Ordering::Relaxed),
            suspended: self.suspended.load(Ordering::Relaxed),
            degraded_commits: self.degraded_commits.load(Ordering::Relaxed),
            markers_placed: self.markers_placed.load(Ordering::Relaxed),
            reservation_timeouts: self.reservation_timeouts.load(Ordering::Relaxed),
        }
    }
}
