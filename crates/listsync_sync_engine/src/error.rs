//! Error types for the sync engine.

use listsync_core::{AdapterError, CoreError, EntityKey};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Core error (queue full, invalid state, ...).
    #[error("core error: {0}")]
    Core(CoreError),

    /// Store adapter error.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// A task exhausted its retry budget.
    #[error("dead letter for {key} after {attempts} attempts: {message}")]
    DeadLetter {
        /// Target document.
        key: EntityKey,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        message: String,
    },

    /// A scan was cancelled.
    #[error("sync operation cancelled")]
    Cancelled,

    /// Configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The worker pool is already running.
    #[error("sync service already running")]
    AlreadyRunning,
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Cancelled => SyncError::Cancelled,
            other => SyncError::Core(other),
        }
    }
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Adapter(err) | SyncError::Core(CoreError::Adapter(err)) => {
                err.is_retryable()
            }
            SyncError::Core(CoreError::QueueFull { .. }) => true,
            _ => false,
        }
    }
}
