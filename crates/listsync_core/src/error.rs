//! Error types for listsync core.

use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Result type for adapter calls.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Failure reported by (or on behalf of) an external store adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// The call did not finish within its time budget.
    #[error("{adapter} {operation} timed out after {elapsed:?}")]
    Timeout {
        /// Adapter name ("primary" or "index").
        adapter: &'static str,
        /// Operation that timed out.
        operation: &'static str,
        /// Budget that elapsed.
        elapsed: Duration,
    },

    /// The backing service could not be reached.
    #[error("{adapter} unavailable: {message}")]
    Unavailable {
        /// Adapter name.
        adapter: &'static str,
        /// Error message.
        message: String,
    },

    /// The backing service refused the request.
    #[error("{adapter} rejected request: {message}")]
    Rejected {
        /// Adapter name.
        adapter: &'static str,
        /// Error message.
        message: String,
    },
}

impl AdapterError {
    /// Creates an unavailable error.
    pub fn unavailable(adapter: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            adapter,
            message: message.into(),
        }
    }

    /// Creates a rejected error.
    pub fn rejected(adapter: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            adapter,
            message: message.into(),
        }
    }

    /// Returns true if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable { .. })
    }
}

/// Errors that can occur in listsync core operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Operation attempted on a transaction in the wrong status.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// No active or recent transaction with this id.
    #[error("transaction not found: {id}")]
    TransactionNotFound {
        /// The transaction id that was looked up.
        id: String,
    },

    /// A compensation failed; the store is in an unknown state.
    #[error("compensation failed in {transaction} at operation {operation}: {message}")]
    CompensationFailure {
        /// Transaction id.
        transaction: String,
        /// Index of the operation whose compensation failed.
        operation: usize,
        /// Underlying failure.
        message: String,
    },

    /// External adapter failure.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// A long-running scan was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The change queue is at capacity.
    #[error("change queue full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// The change queue no longer accepts work.
    #[error("change queue closed")]
    QueueClosed,
}

impl CoreError {
    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a transaction not found error.
    pub fn transaction_not_found(id: impl ToString) -> Self {
        Self::TransactionNotFound { id: id.to_string() }
    }

    /// Creates a compensation failure error.
    pub fn compensation_failure(
        transaction: impl ToString,
        operation: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::CompensationFailure {
            transaction: transaction.to_string(),
            operation,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_adapter_errors() {
        let timeout = AdapterError::Timeout {
            adapter: "index",
            operation: "upsert",
            elapsed: Duration::from_millis(5),
        };
        assert!(timeout.is_retryable());
        assert!(AdapterError::unavailable("index", "connection refused").is_retryable());
        assert!(!AdapterError::rejected("index", "mapping conflict").is_retryable());
    }

    #[test]
    fn error_display() {
        let err = CoreError::compensation_failure("txn-1", 2, "delete failed");
        assert_eq!(
            err.to_string(),
            "compensation failed in txn-1 at operation 2: delete failed"
        );

        let err: CoreError = AdapterError::unavailable("primary", "down").into();
        assert!(err.to_string().contains("primary unavailable"));
    }
}
