//! Sync workers: apply queued changes to the search index.

use crate::config::RetryConfig;
use crate::error::SyncError;
use crate::queue::{ChangeQueue, RetryDisposition, SyncTask};
use listsync_core::{
    with_timeout, AdapterError, AdapterResult, Cancellation, ChangeKind, SearchIndex, INDEX,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened to a processed task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Applied to the index.
    Synced,
    /// Failed and requeued.
    Retrying {
        /// Failed attempts so far.
        attempt: u32,
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// Failed, and a newer change for the key is already queued.
    Superseded,
    /// Exhausted its retries.
    DeadLettered(SyncError),
}

/// Snapshot of worker health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    /// Waiting tasks.
    pub queue_size: usize,
    /// Tasks being applied.
    pub processing: usize,
    /// Dead letters retained.
    pub dead_letters: usize,
    /// Most recent index failure, cleared by the next success.
    pub last_error: Option<String>,
}

/// Applies tasks from a [`ChangeQueue`] to a [`SearchIndex`].
///
/// One worker may be driven by many tokio tasks at once; see [`WorkerPool`].
pub struct SyncWorker {
    queue: Arc<ChangeQueue>,
    index: Arc<dyn SearchIndex>,
    retry: RetryConfig,
    index_timeout: Duration,
    last_error: RwLock<Option<String>>,
}

impl SyncWorker {
    /// Creates a worker.
    pub fn new(
        queue: Arc<ChangeQueue>,
        index: Arc<dyn SearchIndex>,
        retry: RetryConfig,
        index_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            index,
            retry,
            index_timeout,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the queue this worker drains.
    pub fn queue(&self) -> &Arc<ChangeQueue> {
        &self.queue
    }

    /// Applies one dequeued task and settles it with the queue.
    pub async fn process(&self, mut task: SyncTask) -> TaskOutcome {
        let result = self.apply(&task).await;

        let err = match result {
            Ok(()) => {
                debug!(task = task.id, key = %task.key, change = %task.change, "synced");
                self.queue.complete(&task);
                *self.last_error.write() = None;
                return TaskOutcome::Synced;
            }
            Err(err) => err,
        };

        task.attempt += 1;
        let message = err.to_string();
        *self.last_error.write() = Some(message.clone());

        if task.attempt < self.retry.max_attempts {
            let attempt = task.attempt;
            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                task = task.id,
                key = %task.key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "index sync failed, retrying"
            );
            return match self.queue.retry(task, message, delay) {
                RetryDisposition::Requeued => TaskOutcome::Retrying { attempt, delay },
                RetryDisposition::Superseded => TaskOutcome::Superseded,
            };
        }

        error!(
            target: "listsync::dead_letter",
            task = task.id,
            key = %task.key,
            change = %task.change,
            attempts = task.attempt,
            error = %err,
            "index sync gave up"
        );
        let dead = SyncError::DeadLetter {
            key: task.key.clone(),
            attempts: task.attempt,
            message: message.clone(),
        };
        self.queue.dead_letter(task, message);
        TaskOutcome::DeadLettered(dead)
    }

    /// Processes every task that is eligible right now.
    ///
    /// Returns the number of tasks processed. Tasks waiting on a retry
    /// deadline are left in the queue.
    pub async fn process_available(&self) -> usize {
        let mut processed = 0;
        while let Some(task) = self.queue.try_dequeue() {
            self.process(task).await;
            processed += 1;
        }
        processed
    }

    /// Processes tasks until `cancel` fires.
    pub async fn run(&self, cancel: &Cancellation) {
        while let Some(task) = self.queue.dequeue_next(cancel).await {
            self.process(task).await;
        }
    }

    /// Returns a health snapshot.
    pub fn health(&self) -> WorkerHealth {
        let stats = self.queue.stats();
        WorkerHealth {
            queue_size: stats.queue_size,
            processing: stats.processing,
            dead_letters: stats.dead_letters,
            last_error: self.last_error.read().clone(),
        }
    }

    async fn apply(&self, task: &SyncTask) -> AdapterResult<()> {
        match task.change {
            ChangeKind::Upsert => {
                let Some(document) = task.payload.as_ref() else {
                    return Err(AdapterError::rejected(INDEX, "upsert without payload"));
                };
                with_timeout(
                    INDEX,
                    "upsert",
                    self.index_timeout,
                    self.index.upsert(&task.key, document),
                )
                .await
            }
            ChangeKind::Delete => {
                with_timeout(
                    INDEX,
                    "delete",
                    self.index_timeout,
                    self.index.delete(&task.key),
                )
                .await
            }
        }
    }
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("retry", &self.retry)
            .field("index_timeout", &self.index_timeout)
            .finish_non_exhaustive()
    }
}

/// A set of tokio tasks driving one [`SyncWorker`].
#[derive(Debug)]
pub struct WorkerPool {
    cancel: Cancellation,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` worker tasks on the current tokio runtime.
    pub fn spawn(worker: Arc<SyncWorker>, count: usize) -> Self {
        let cancel = Cancellation::new();
        let handles = (0..count)
            .map(|slot| {
                let worker = Arc::clone(&worker);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    debug!(slot, "sync worker started");
                    worker.run(&cancel).await;
                    debug!(slot, "sync worker stopped");
                })
            })
            .collect();

        info!(workers = count, "sync worker pool started");
        Self { cancel, handles }
    }

    /// Returns the number of worker tasks.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if the pool has no worker tasks.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancels every worker and waits for them to finish their current task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let count = self.handles.len();
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "sync worker task ended abnormally");
            }
        }
        info!(workers = count, "sync worker pool stopped");
    }
}
