//! Transaction state.

use crate::adapter::{with_timeout, PrimaryStore, WriteContext, PRIMARY};
use crate::change::IndexChange;
use crate::error::{AdapterResult, CoreError, CoreResult};
use crate::types::{Document, EntityKey, IsolationLevel, TransactionId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime};

/// Status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Open; operations may be added.
    Pending,
    /// Every operation applied.
    Committed,
    /// An operation failed and every applied operation was compensated.
    RolledBack,
    /// A compensation failed; the store needs manual attention.
    Failed,
}

impl TransactionStatus {
    /// Returns true for `Committed`, `RolledBack` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Status of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Not yet applied.
    Pending,
    /// Forward action succeeded.
    Applied,
    /// Compensation succeeded after the action was applied.
    Compensated,
    /// Forward action or its compensation failed.
    Failed,
}

/// A single command against the primary store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum StoreCommand {
    /// Insert or replace a document.
    Write {
        /// Target document.
        key: EntityKey,
        /// New body.
        data: Document,
    },
    /// Delete a document.
    Delete {
        /// Target document.
        key: EntityKey,
    },
}

impl StoreCommand {
    /// Returns the document this command targets.
    #[must_use]
    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Write { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Returns the index change that mirrors this command.
    #[must_use]
    pub fn index_change(&self) -> IndexChange {
        match self {
            Self::Write { key, data } => IndexChange::upsert(key.clone(), data.clone()),
            Self::Delete { key } => IndexChange::delete(key.clone()),
        }
    }

    /// Applies the command under a time budget.
    pub(crate) async fn apply(
        &self,
        store: &dyn PrimaryStore,
        ctx: &WriteContext,
        budget: Duration,
    ) -> AdapterResult<()> {
        match self {
            Self::Write { key, data } => {
                with_timeout(PRIMARY, "write", budget, store.write(key, data, ctx)).await
            }
            Self::Delete { key } => {
                with_timeout(PRIMARY, "delete", budget, store.delete(key, ctx)).await
            }
        }
    }
}

/// A forward action with an optional compensating action.
///
/// # Example
///
/// ```rust
/// use listsync_core::{EntityKey, Operation};
/// use serde_json::json;
///
/// let key = EntityKey::new("listing", "L1");
/// let op = Operation::write(key.clone(), json!({"title": "Bike"}))
///     .compensate_with_delete()
///     .indexed();
/// assert!(op.is_indexed());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    action: StoreCommand,
    compensation: Option<StoreCommand>,
    indexed: bool,
}

impl Operation {
    /// Creates an operation from a forward command.
    #[must_use]
    pub fn new(action: StoreCommand) -> Self {
        Self {
            action,
            compensation: None,
            indexed: false,
        }
    }

    /// Creates a write operation.
    #[must_use]
    pub fn write(key: EntityKey, data: Document) -> Self {
        Self::new(StoreCommand::Write { key, data })
    }

    /// Creates a delete operation.
    #[must_use]
    pub fn delete(key: EntityKey) -> Self {
        Self::new(StoreCommand::Delete { key })
    }

    /// Sets the compensating command.
    #[must_use]
    pub fn with_compensation(mut self, compensation: StoreCommand) -> Self {
        self.compensation = Some(compensation);
        self
    }

    /// Compensates by deleting the action's target document.
    #[must_use]
    pub fn compensate_with_delete(self) -> Self {
        let key = self.action.key().clone();
        self.with_compensation(StoreCommand::Delete { key })
    }

    /// Compensates by restoring the given previous body.
    #[must_use]
    pub fn compensate_with_restore(self, previous: Document) -> Self {
        let key = self.action.key().clone();
        self.with_compensation(StoreCommand::Write {
            key,
            data: previous,
        })
    }

    /// Marks the operation as index-relevant.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Returns the forward command.
    #[must_use]
    pub fn action(&self) -> &StoreCommand {
        &self.action
    }

    /// Returns the compensating command, if any.
    #[must_use]
    pub fn compensation(&self) -> Option<&StoreCommand> {
        self.compensation.as_ref()
    }

    /// Returns true if a commit should mirror this operation into the index.
    #[must_use]
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }
}

#[derive(Debug)]
pub(crate) struct OperationRecord {
    pub(crate) op: Operation,
    pub(crate) status: OperationStatus,
    pub(crate) error: Option<String>,
}

/// A transaction as held in the coordinator's active table.
#[derive(Debug)]
pub(crate) struct Transaction {
    id: TransactionId,
    status: TransactionStatus,
    isolation: IsolationLevel,
    operations: Vec<OperationRecord>,
    started_at: Instant,
    created_at: SystemTime,
    metadata: BTreeMap<String, String>,
    /// Owned by an in-flight commit, execute, rollback or sweep.
    claimed: bool,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        isolation: IsolationLevel,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            status: TransactionStatus::Pending,
            isolation,
            operations: Vec::new(),
            started_at: Instant::now(),
            created_at: SystemTime::now(),
            metadata,
            claimed: false,
        }
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        self.status
    }

    pub(crate) fn context(&self) -> WriteContext {
        WriteContext::transactional(self.id, self.isolation)
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Ensures the transaction is pending and not owned by another call.
    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        match self.status {
            TransactionStatus::Pending if self.claimed => Err(CoreError::invalid_state(format!(
                "{} is being committed or rolled back",
                self.id
            ))),
            TransactionStatus::Pending => Ok(()),
            other => Err(CoreError::invalid_state(format!(
                "{} is {other:?}, expected Pending",
                self.id
            ))),
        }
    }

    pub(crate) fn push(&mut self, op: Operation) -> CoreResult<usize> {
        self.ensure_open()?;
        self.operations.push(OperationRecord {
            op,
            status: OperationStatus::Pending,
            error: None,
        });
        Ok(self.operations.len() - 1)
    }

    pub(crate) fn claim(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        self.claimed = true;
        Ok(())
    }

    pub(crate) fn release(&mut self) {
        self.claimed = false;
    }

    /// Forward commands still waiting to be applied, in declaration order.
    pub(crate) fn pending_actions(&self) -> Vec<(usize, StoreCommand)> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, rec)| rec.status == OperationStatus::Pending)
            .map(|(idx, rec)| (idx, rec.op.action.clone()))
            .collect()
    }

    /// Applied operations in reverse application order.
    pub(crate) fn applied_in_reverse(&self) -> Vec<(usize, Option<StoreCommand>)> {
        self.operations
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, rec)| rec.status == OperationStatus::Applied)
            .map(|(idx, rec)| (idx, rec.op.compensation.clone()))
            .collect()
    }

    pub(crate) fn index_changes(&self) -> Vec<IndexChange> {
        self.operations
            .iter()
            .filter(|rec| rec.op.indexed && rec.status == OperationStatus::Applied)
            .map(|rec| rec.op.action.index_change())
            .collect()
    }

    pub(crate) fn set_operation_status(
        &mut self,
        idx: usize,
        status: OperationStatus,
        error: Option<String>,
    ) {
        if let Some(rec) = self.operations.get_mut(idx) {
            rec.status = status;
            if error.is_some() {
                rec.error = error;
            }
        }
    }

    pub(crate) fn finish(&mut self, status: TransactionStatus) {
        self.status = status;
        self.claimed = false;
    }

    pub(crate) fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            status: self.status,
            isolation: self.isolation,
            created_at: self.created_at,
            age: self.started_at.elapsed(),
            metadata: self.metadata.clone(),
            operations: self
                .operations
                .iter()
                .map(|rec| OperationInfo {
                    action: rec.op.action.clone(),
                    has_compensation: rec.op.compensation.is_some(),
                    indexed: rec.op.indexed,
                    status: rec.status,
                    error: rec.error.clone(),
                })
                .collect(),
        }
    }
}

/// Read-only view of one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationInfo {
    /// Forward command.
    pub action: StoreCommand,
    /// Whether a compensation was declared.
    pub has_compensation: bool,
    /// Whether the operation is index-relevant.
    pub indexed: bool,
    /// Current status.
    pub status: OperationStatus,
    /// Last failure message.
    pub error: Option<String>,
}

/// Read-only view of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionInfo {
    /// Transaction id.
    pub id: TransactionId,
    /// Current status.
    pub status: TransactionStatus,
    /// Declared isolation.
    pub isolation: IsolationLevel,
    /// Wall-clock creation time.
    pub created_at: SystemTime,
    /// Age when this view was taken.
    pub age: Duration,
    /// Caller-supplied context.
    pub metadata: BTreeMap<String, String>,
    /// Operations in declaration order.
    pub operations: Vec<OperationInfo>,
}

impl TransactionInfo {
    /// Returns the status of every operation in declaration order.
    #[must_use]
    pub fn operation_statuses(&self) -> Vec<OperationStatus> {
        self.operations.iter().map(|op| op.status).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_txn() -> Transaction {
        Transaction::new(
            TransactionId::new(),
            IsolationLevel::ReadCommitted,
            BTreeMap::new(),
        )
    }

    fn listing(id: &str) -> EntityKey {
        EntityKey::new("listing", id)
    }

    #[test]
    fn new_transaction_is_pending() {
        let txn = create_txn();
        assert_eq!(txn.status(), TransactionStatus::Pending);
        assert!(txn.ensure_open().is_ok());
        assert!(!txn.status().is_terminal());
    }

    #[test]
    fn push_records_pending_operation() {
        let mut txn = create_txn();
        let idx = txn.push(Operation::write(listing("L1"), json!({}))).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(txn.pending_actions().len(), 1);
        assert_eq!(txn.info().operation_statuses(), vec![OperationStatus::Pending]);
    }

    #[test]
    fn cannot_push_after_finish() {
        let mut txn = create_txn();
        txn.finish(TransactionStatus::Committed);
        let result = txn.push(Operation::delete(listing("L1")));
        assert!(matches!(result, Err(CoreError::InvalidState { .. })));
    }

    #[test]
    fn cannot_push_while_claimed() {
        let mut txn = create_txn();
        txn.claim().unwrap();
        assert!(txn.push(Operation::delete(listing("L1"))).is_err());
        assert!(txn.claim().is_err());
        txn.release();
        assert!(txn.push(Operation::delete(listing("L1"))).is_ok());
    }

    #[test]
    fn applied_in_reverse_skips_unapplied() {
        let mut txn = create_txn();
        for id in ["a", "b", "c"] {
            txn.push(Operation::write(listing(id), json!({})).compensate_with_delete())
                .unwrap();
        }
        txn.set_operation_status(0, OperationStatus::Applied, None);
        txn.set_operation_status(1, OperationStatus::Applied, None);
        txn.set_operation_status(2, OperationStatus::Failed, Some("boom".into()));

        let order: Vec<usize> = txn.applied_in_reverse().into_iter().map(|(i, _)| i).collect();
        assert_eq!(order, vec![1, 0]);
        assert_eq!(txn.info().operations[2].error.as_deref(), Some("boom"));
    }

    #[test]
    fn index_changes_only_for_indexed_applied() {
        let mut txn = create_txn();
        txn.push(Operation::write(listing("L1"), json!({"t": 1})).indexed())
            .unwrap();
        txn.push(Operation::write(EntityKey::new("audit", "A1"), json!({})))
            .unwrap();
        txn.set_operation_status(0, OperationStatus::Applied, None);
        txn.set_operation_status(1, OperationStatus::Applied, None);

        let changes = txn.index_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, listing("L1"));
    }

    #[test]
    fn restore_compensation_targets_same_key() {
        let op = Operation::write(listing("L1"), json!({"v": 2}))
            .compensate_with_restore(json!({"v": 1}));
        assert_eq!(
            op.compensation(),
            Some(&StoreCommand::Write {
                key: listing("L1"),
                data: json!({"v": 1}),
            })
        );
    }
}
