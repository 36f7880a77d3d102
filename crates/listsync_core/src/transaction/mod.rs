//! Transaction coordination.
//!
//! A transaction is an ordered list of operations against the primary
//! store. Each operation pairs a forward command with an optional
//! compensating command; when a later operation fails, earlier ones are
//! compensated in reverse order.

mod coordinator;
mod state;

pub use coordinator::{CleanupSummary, TransactionCoordinator, TransactionOutcome};
pub use state::{
    Operation, OperationInfo, OperationStatus, StoreCommand, TransactionInfo, TransactionStatus,
};
