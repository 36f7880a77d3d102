//! # listsync Sync Engine
//!
//! Asynchronous propagation of committed primary store changes into the
//! search index.
//!
//! This crate provides:
//! - A coalescing change queue with per-key exclusion
//! - Sync workers with exponential backoff retry and a dead-letter list
//! - A consistency auditor that diffs both stores and repairs drift
//! - [`SyncService`], the operator surface over all of the above
//!
//! ## Architecture
//!
//! ```text
//! commit ──► ChangeSink (ChangeQueue) ──► WorkerPool ──► SearchIndex
//!                    ▲
//!     ConsistencyAuditor (repair / full sync)
//! ```
//!
//! ## Key Invariants
//!
//! - The primary store is authoritative; the index is eventually consistent
//! - At most one in-flight task per entity key
//! - Queued changes for one key coalesce, last write wins
//! - A task that exhausts its retries is dead-lettered, never retried again

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auditor;
mod config;
mod error;
mod queue;
mod service;
mod worker;

pub use auditor::{
    AuditFailure, ConsistencyAuditor, ConsistencyReport, FullSyncSummary, RepairSummary,
};
pub use config::{EngineConfig, RetryConfig};
pub use error::{SyncError, SyncResult};
pub use queue::{
    ChangeQueue, EnqueueOutcome, QueueStats, RetryDisposition, SyncTask, TaskId, TaskStatus,
};
pub use service::{HealthReport, RepairReport, SyncService, SyncStats};
pub use worker::{SyncWorker, TaskOutcome, WorkerHealth, WorkerPool};
