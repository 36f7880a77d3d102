//! # listsync Core
//!
//! Transaction coordination over a primary store, and the adapter
//! contracts shared with the index sync engine.
//!
//! This crate provides:
//! - Primary store and search index adapter traits with per-call timeouts
//! - In-memory adapters for tests and simulation
//! - The transaction coordinator (ordered apply, reverse compensation,
//!   stale transaction reclamation)
//! - The [`ChangeSink`] seam through which committed changes reach the
//!   sync engine
//!
//! ## Key Invariants
//!
//! - Operations within a transaction apply strictly in declaration order
//! - Compensation runs only for applied operations, in reverse order
//! - The primary store is authoritative; index propagation never fails a commit
//! - No lock is held across an adapter call

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod cancel;
mod change;
mod config;
mod error;
mod stats;
mod transaction;
mod types;

pub use adapter::{
    with_timeout, MemoryPrimaryStore, MemorySearchIndex, PrimaryStore, SearchIndex, WriteContext,
    INDEX, PRIMARY,
};
pub use cancel::Cancellation;
pub use change::{ChangeRecorder, ChangeSink, IndexChange};
pub use config::CoordinatorConfig;
pub use error::{AdapterError, AdapterResult, CoreError, CoreResult};
pub use stats::{CoordinatorStats, CoordinatorStatsSnapshot};
pub use transaction::{
    CleanupSummary, Operation, OperationInfo, OperationStatus, StoreCommand, TransactionCoordinator,
    TransactionInfo, TransactionOutcome, TransactionStatus,
};
pub use types::{ChangeKind, Document, EntityKey, IsolationLevel, TransactionId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
