//! Coordinator statistics.
//!
//! All counters are atomic and can be read while transactions are in
//! flight. Counters only grow; the active-transaction gauge is read from
//! the coordinator's table when a snapshot is taken.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live transaction counters.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    started: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
    stale_reclaimed: AtomicU64,
    operations_applied: AtomicU64,
    compensations_run: AtomicU64,
    sync_enqueued: AtomicU64,
    sync_enqueue_failures: AtomicU64,
}

impl CoordinatorStats {
    /// Creates a zeroed stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_reclaimed(&self) {
        self.stale_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self) {
        self.operations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compensation(&self) {
        self.compensations_run.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync_enqueued(&self) {
        self.sync_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync_enqueue_failure(&self) {
        self.sync_enqueue_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of every counter.
    pub fn snapshot(&self, active: usize) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale_reclaimed: self.stale_reclaimed.load(Ordering::Relaxed),
            operations_applied: self.operations_applied.load(Ordering::Relaxed),
            compensations_run: self.compensations_run.load(Ordering::Relaxed),
            sync_enqueued: self.sync_enqueued.load(Ordering::Relaxed),
            sync_enqueue_failures: self.sync_enqueue_failures.load(Ordering::Relaxed),
            active,
        }
    }
}

/// A point-in-time copy of [`CoordinatorStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatsSnapshot {
    /// Transactions begun.
    pub started: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions rolled back (including stale reclaims).
    pub rolled_back: u64,
    /// Transactions whose compensation failed.
    pub failed: u64,
    /// Transactions reclaimed by the staleness sweep.
    pub stale_reclaimed: u64,
    /// Forward operations applied.
    pub operations_applied: u64,
    /// Compensations that ran successfully.
    pub compensations_run: u64,
    /// Index changes handed to the sink.
    pub sync_enqueued: u64,
    /// Index changes the sink refused.
    pub sync_enqueue_failures: u64,
    /// Transactions currently pending.
    pub active: usize,
}
