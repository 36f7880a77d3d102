//! Store adapter contracts.
//!
//! The primary store and the search index are external services. This
//! module defines the request/response surface listsync consumes from
//! them, plus [`with_timeout`], which every call site uses so a hung
//! adapter surfaces as [`AdapterError::Timeout`] rather than blocking
//! forever.

mod memory;

pub use memory::{MemoryPrimaryStore, MemorySearchIndex};

use crate::error::{AdapterError, AdapterResult};
use crate::types::{Document, EntityKey, IsolationLevel, TransactionId};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Adapter name used in errors for the primary store.
pub const PRIMARY: &str = "primary";

/// Adapter name used in errors for the search index.
pub const INDEX: &str = "index";

/// Context handed to the primary store with every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteContext {
    /// Owning transaction, if the write is transactional.
    pub transaction: Option<TransactionId>,
    /// Declared isolation intent.
    pub isolation: IsolationLevel,
}

impl WriteContext {
    /// Context for a write made inside a transaction.
    pub fn transactional(transaction: TransactionId, isolation: IsolationLevel) -> Self {
        Self {
            transaction: Some(transaction),
            isolation,
        }
    }

    /// Context for a write made outside any transaction.
    pub fn standalone() -> Self {
        Self {
            transaction: None,
            isolation: IsolationLevel::default(),
        }
    }
}

/// The authoritative relational store.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Reads one document. `Ok(None)` if it does not exist.
    async fn read(&self, key: &EntityKey) -> AdapterResult<Option<Document>>;

    /// Inserts or replaces one document.
    async fn write(&self, key: &EntityKey, data: &Document, ctx: &WriteContext)
        -> AdapterResult<()>;

    /// Deletes one document. Deleting a missing document succeeds.
    async fn delete(&self, key: &EntityKey, ctx: &WriteContext) -> AdapterResult<()>;

    /// Lists every id of one entity type.
    async fn list_all_ids(&self, entity_type: &str) -> AdapterResult<Vec<String>>;
}

/// The secondary full-text search index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Inserts or replaces one document.
    async fn upsert(&self, key: &EntityKey, document: &Document) -> AdapterResult<()>;

    /// Removes one document. Removing a missing document succeeds.
    async fn delete(&self, key: &EntityKey) -> AdapterResult<()>;

    /// Lists every indexed id of one entity type.
    async fn list_all_ids(&self, entity_type: &str) -> AdapterResult<Vec<String>>;

    /// Checks that the index is reachable.
    async fn health_check(&self) -> AdapterResult<()>;
}

/// Runs an adapter call under a time budget.
///
/// An elapsed budget is reported as [`AdapterError::Timeout`], never as success.
pub async fn with_timeout<T, F>(
    adapter: &'static str,
    operation: &'static str,
    budget: Duration,
    call: F,
) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout {
            adapter,
            operation,
            elapsed: budget,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_is_reported_as_failure() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        };
        let result: AdapterResult<()> =
            with_timeout(INDEX, "upsert", Duration::from_millis(5), slow).await;

        assert!(matches!(
            result,
            Err(AdapterError::Timeout {
                adapter: "index",
                operation: "upsert",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let result = with_timeout(PRIMARY, "read", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn write_context_constructors() {
        let txn = TransactionId::new();
        let ctx = WriteContext::transactional(txn, IsolationLevel::Serializable);
        assert_eq!(ctx.transaction, Some(txn));
        assert_eq!(WriteContext::standalone().transaction, None);
    }
}
