//! Transaction coordinator.

use crate::adapter::{PrimaryStore, WriteContext};
use crate::cancel::Cancellation;
use crate::change::{ChangeSink, IndexChange};
use crate::config::CoordinatorConfig;
use crate::error::{AdapterError, CoreError, CoreResult};
use crate::stats::{CoordinatorStats, CoordinatorStatsSnapshot};
use crate::transaction::state::{
    Operation, OperationStatus, StoreCommand, Transaction, TransactionInfo, TransactionStatus,
};
use crate::types::{IsolationLevel, TransactionId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type Entry = Arc<Mutex<Transaction>>;

const IRREVERSIBLE: &str = "no compensation; effect is irreversible";

/// Result of `commit`, `execute`, `rollback` or a stale reclaim.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    /// Transaction id.
    pub id: TransactionId,
    /// Status after the call.
    pub status: TransactionStatus,
    /// Index of the forward operation that failed, if any.
    pub failed_operation: Option<usize>,
    /// The failure that ended the transaction: the forward error for a
    /// rollback, `CompensationFailure` for `Failed`.
    pub error: Option<CoreError>,
    /// Compensations that ran successfully.
    pub compensated: usize,
    /// Index changes accepted by the sink.
    pub sync_enqueued: usize,
    /// Index changes the sink refused.
    pub sync_enqueue_failures: usize,
}

impl TransactionOutcome {
    fn new(id: TransactionId, status: TransactionStatus) -> Self {
        Self {
            id,
            status,
            failed_operation: None,
            error: None,
            compensated: 0,
            sync_enqueued: 0,
            sync_enqueue_failures: 0,
        }
    }

    /// Returns true if the transaction committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.status == TransactionStatus::Committed
    }
}

/// Result of a staleness sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    /// Pending transactions examined.
    pub scanned: usize,
    /// Transactions reclaimed and rolled back.
    pub rolled_back: Vec<TransactionId>,
    /// Transactions reclaimed whose compensation failed.
    pub failed: Vec<TransactionId>,
    /// Stale transactions skipped because a commit owned them.
    pub skipped_in_flight: usize,
    /// True if the sweep stopped early on cancellation.
    pub cancelled: bool,
}

impl CleanupSummary {
    /// Total transactions reclaimed.
    #[must_use]
    pub fn reclaimed(&self) -> usize {
        self.rolled_back.len() + self.failed.len()
    }
}

#[derive(Debug, Default)]
struct History {
    order: VecDeque<TransactionId>,
    entries: HashMap<TransactionId, TransactionInfo>,
}

/// Groups primary store writes into compensable units.
///
/// The coordinator provides:
/// - Ordered application of each transaction's operations
/// - Reverse-order compensation on the first failure
/// - Index change emission for committed, index-relevant operations
/// - Reclamation of transactions abandoned before commit
///
/// ## Locking
///
/// The active table lock is held only to insert, look up or remove an
/// entry. Each transaction has its own mutex, and an in-flight call marks
/// the entry claimed so no lock is held across a store call. Unrelated
/// transactions commit concurrently.
pub struct TransactionCoordinator {
    store: Arc<dyn PrimaryStore>,
    sink: Option<Arc<dyn ChangeSink>>,
    config: CoordinatorConfig,
    active: RwLock<HashMap<TransactionId, Entry>>,
    history: RwLock<History>,
    stats: CoordinatorStats,
}

impl TransactionCoordinator {
    /// Creates a coordinator over a primary store.
    pub fn new(store: Arc<dyn PrimaryStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            sink: None,
            config,
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(History::default()),
            stats: CoordinatorStats::new(),
        }
    }

    /// Routes index changes of committed transactions to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Begins a new transaction. No store effects happen yet.
    pub fn begin(
        &self,
        isolation: IsolationLevel,
        metadata: BTreeMap<String, String>,
    ) -> TransactionId {
        let id = TransactionId::new();
        let txn = Transaction::new(id, isolation, metadata);
        self.active.write().insert(id, Arc::new(Mutex::new(txn)));
        self.stats.record_start();
        debug!(txn = %id, ?isolation, "transaction started");
        id
    }

    /// Begins a transaction with the configured default isolation and no metadata.
    pub fn begin_default(&self) -> TransactionId {
        self.begin(self.config.default_isolation, BTreeMap::new())
    }

    /// Appends an operation to a pending transaction.
    ///
    /// Returns the operation's index.
    pub fn add_operation(&self, id: TransactionId, operation: Operation) -> CoreResult<usize> {
        let entry = self.entry(id)?;
        let idx = entry.lock().push(operation)?;
        Ok(idx)
    }

    /// Appends an operation and applies it immediately.
    ///
    /// On success the transaction stays `Pending` with the operation
    /// `Applied`. On failure every applied operation is compensated and the
    /// transaction ends `RolledBack` or `Failed`.
    pub async fn execute(
        &self,
        id: TransactionId,
        operation: Operation,
    ) -> CoreResult<TransactionOutcome> {
        let entry = self.entry(id)?;
        let (idx, action, ctx) = {
            let action = operation.action().clone();
            let mut txn = entry.lock();
            let idx = txn.push(operation)?;
            txn.claim()?;
            (idx, action, txn.context())
        };

        if let Err(err) = self.apply_one(&entry, idx, &action, &ctx).await {
            return Ok(self.abort(id, &entry, &ctx, Some((idx, err))).await);
        }

        entry.lock().release();
        Ok(TransactionOutcome::new(id, TransactionStatus::Pending))
    }

    /// Commits a transaction.
    ///
    /// Pending operations are applied in declaration order. The first
    /// failure compensates every applied operation in reverse order. A
    /// committed transaction hands its index changes to the sink; a sink
    /// failure is logged and counted but never fails the commit.
    pub async fn commit(&self, id: TransactionId) -> CoreResult<TransactionOutcome> {
        let entry = self.entry(id)?;
        let (actions, ctx) = {
            let mut txn = entry.lock();
            txn.claim()?;
            (txn.pending_actions(), txn.context())
        };

        for (idx, action) in &actions {
            if let Err(err) = self.apply_one(&entry, *idx, action, &ctx).await {
                return Ok(self.abort(id, &entry, &ctx, Some((*idx, err))).await);
            }
        }

        let changes = {
            let mut txn = entry.lock();
            txn.finish(TransactionStatus::Committed);
            txn.index_changes()
        };
        self.stats.record_commit();

        let mut outcome = TransactionOutcome::new(id, TransactionStatus::Committed);
        (outcome.sync_enqueued, outcome.sync_enqueue_failures) = self.emit(id, changes);
        self.retire(id, &entry);

        info!(
            txn = %id,
            operations = actions.len(),
            sync_enqueued = outcome.sync_enqueued,
            "transaction committed"
        );
        Ok(outcome)
    }

    /// Rolls back a pending transaction, compensating applied operations.
    pub async fn rollback(&self, id: TransactionId) -> CoreResult<TransactionOutcome> {
        let entry = self.entry(id)?;
        let ctx = {
            let mut txn = entry.lock();
            txn.claim()?;
            txn.context()
        };
        Ok(self.abort(id, &entry, &ctx, None).await)
    }

    /// Returns a snapshot of an active or recently finished transaction.
    pub fn status(&self, id: TransactionId) -> Option<TransactionInfo> {
        let entry = self.active.read().get(&id).cloned();
        match entry {
            Some(entry) => Some(entry.lock().info()),
            None => self.history.read().entries.get(&id).cloned(),
        }
    }

    /// Reclaims pending transactions older than `max_age`.
    ///
    /// Applied operations are compensated and the transaction ends
    /// `RolledBack` (or `Failed`). Transactions owned by an in-flight
    /// commit are skipped. Cancellation is checked between batches.
    pub async fn cleanup_stale(&self, max_age: Duration, cancel: &Cancellation) -> CleanupSummary {
        let now = Instant::now();
        let candidates: Vec<(TransactionId, Entry)> = self
            .active
            .read()
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        let mut summary = CleanupSummary::default();
        for batch in candidates.chunks(self.config.cleanup_batch_size.max(1)) {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            for (id, entry) in batch {
                let ctx = {
                    let mut txn = entry.lock();
                    if txn.status() != TransactionStatus::Pending {
                        continue;
                    }
                    summary.scanned += 1;
                    if txn.age(now) <= max_age {
                        continue;
                    }
                    if txn.is_claimed() {
                        summary.skipped_in_flight += 1;
                        continue;
                    }
                    if txn.claim().is_err() {
                        continue;
                    }
                    txn.context()
                };

                warn!(txn = %id, ?max_age, "reclaiming stale transaction");
                let outcome = self.abort(*id, entry, &ctx, None).await;
                self.stats.record_stale_reclaimed();
                match outcome.status {
                    TransactionStatus::Failed => summary.failed.push(*id),
                    _ => summary.rolled_back.push(*id),
                }
            }
        }

        if summary.reclaimed() > 0 {
            info!(
                rolled_back = summary.rolled_back.len(),
                failed = summary.failed.len(),
                "stale transaction sweep finished"
            );
        }
        summary
    }

    /// Returns the number of pending transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Returns a snapshot of the coordinator counters.
    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.stats.snapshot(self.active_count())
    }

    fn entry(&self, id: TransactionId) -> CoreResult<Entry> {
        if let Some(entry) = self.active.read().get(&id) {
            return Ok(Arc::clone(entry));
        }
        match self.history.read().entries.get(&id) {
            Some(info) => Err(CoreError::invalid_state(format!(
                "{id} is {:?}, expected Pending",
                info.status
            ))),
            None => Err(CoreError::transaction_not_found(id)),
        }
    }

    async fn apply_one(
        &self,
        entry: &Entry,
        idx: usize,
        action: &StoreCommand,
        ctx: &WriteContext,
    ) -> Result<(), AdapterError> {
        match action
            .apply(self.store.as_ref(), ctx, self.config.adapter_timeout)
            .await
        {
            Ok(()) => {
                entry
                    .lock()
                    .set_operation_status(idx, OperationStatus::Applied, None);
                self.stats.record_applied();
                debug!(op = idx, key = %action.key(), "operation applied");
                Ok(())
            }
            Err(err) => {
                entry.lock().set_operation_status(
                    idx,
                    OperationStatus::Failed,
                    Some(err.to_string()),
                );
                warn!(op = idx, key = %action.key(), error = %err, "operation failed");
                Err(err)
            }
        }
    }

    /// Compensates applied operations in reverse order and retires the entry.
    ///
    /// The caller must hold the entry's claim.
    async fn abort(
        &self,
        id: TransactionId,
        entry: &Entry,
        ctx: &WriteContext,
        cause: Option<(usize, AdapterError)>,
    ) -> TransactionOutcome {
        let applied = entry.lock().applied_in_reverse();

        let mut compensated = 0;
        let mut compensation_error = None;
        for (idx, compensation) in applied {
            let Some(command) = compensation else {
                error!(
                    txn = %id,
                    op = idx,
                    "applied operation has no compensation; manual intervention required"
                );
                entry.lock().set_operation_status(
                    idx,
                    OperationStatus::Failed,
                    Some(IRREVERSIBLE.into()),
                );
                compensation_error
                    .get_or_insert_with(|| CoreError::compensation_failure(id, idx, IRREVERSIBLE));
                continue;
            };

            match command
                .apply(self.store.as_ref(), ctx, self.config.adapter_timeout)
                .await
            {
                Ok(()) => {
                    entry
                        .lock()
                        .set_operation_status(idx, OperationStatus::Compensated, None);
                    self.stats.record_compensation();
                    compensated += 1;
                }
                Err(err) => {
                    error!(
                        txn = %id,
                        op = idx,
                        key = %command.key(),
                        error = %err,
                        "compensation failed; manual intervention required"
                    );
                    entry.lock().set_operation_status(
                        idx,
                        OperationStatus::Failed,
                        Some(format!("compensation: {err}")),
                    );
                    compensation_error.get_or_insert_with(|| {
                        CoreError::compensation_failure(id, idx, err.to_string())
                    });
                }
            }
        }

        let status = if compensation_error.is_some() {
            self.stats.record_failure();
            TransactionStatus::Failed
        } else {
            self.stats.record_rollback();
            TransactionStatus::RolledBack
        };
        entry.lock().finish(status);
        self.retire(id, entry);

        let mut outcome = TransactionOutcome::new(id, status);
        outcome.compensated = compensated;
        outcome.failed_operation = cause.as_ref().map(|(idx, _)| *idx);
        outcome.error = compensation_error.or(cause.map(|(_, err)| CoreError::Adapter(err)));

        info!(txn = %id, ?status, compensated, "transaction aborted");
        outcome
    }

    /// Hands index changes to the sink. Returns (accepted, refused).
    fn emit(&self, id: TransactionId, changes: Vec<IndexChange>) -> (usize, usize) {
        let Some(sink) = &self.sink else {
            return (0, 0);
        };

        let mut accepted = 0;
        let mut refused = 0;
        for change in changes {
            let key = change.key.clone();
            match sink.push(change) {
                Ok(()) => {
                    self.stats.record_sync_enqueued();
                    accepted += 1;
                }
                Err(err) => {
                    self.stats.record_sync_enqueue_failure();
                    refused += 1;
                    warn!(
                        txn = %id,
                        key = %key,
                        error = %err,
                        "index change not queued; the next consistency audit will repair it"
                    );
                }
            }
        }
        (accepted, refused)
    }

    /// Moves a finished transaction from the active table to history.
    ///
    /// History is written first so lookups always find the transaction.
    fn retire(&self, id: TransactionId, entry: &Entry) {
        let info = entry.lock().info();
        {
            let mut history = self.history.write();
            history.order.push_back(id);
            history.entries.insert(id, info);
            while history.order.len() > self.config.history_limit {
                if let Some(old) = history.order.pop_front() {
                    history.entries.remove(&old);
                }
            }
        }
        self.active.write().remove(&id);
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("active_count", &self.active_count())
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}
