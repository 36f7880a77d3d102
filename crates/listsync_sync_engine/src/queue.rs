//! Ordered, coalescing queue of index sync tasks.
//!
//! ## Invariants
//!
//! - At most one waiting task per entity key. A new change for a key that
//!   already has a waiting task replaces its kind and payload (last write
//!   wins) and keeps its queue position.
//! - At most one in-flight task per entity key. A change for a key whose
//!   task is being processed waits until that task is released.
//! - Tasks for different keys are dequeued oldest first.
//!
//! The queue lock guards in-memory bookkeeping only and is never held
//! across an await point or an adapter call.

use listsync_core::{
    Cancellation, ChangeKind, ChangeSink, CoreError, CoreResult, Document, EntityKey, IndexChange,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Identifier of a sync task.
pub type TaskId = u64;

/// Status of a sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be processed.
    Queued,
    /// Held by a worker.
    Processing,
    /// Applied to the index.
    Synced,
    /// Failed; waiting for its backoff deadline.
    FailedRetryable,
    /// Exhausted its retries.
    Dead,
}

/// One pending index change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncTask {
    /// Task id.
    pub id: TaskId,
    /// Target document.
    pub key: EntityKey,
    /// Upsert or delete.
    pub change: ChangeKind,
    /// Document body for upserts.
    pub payload: Option<Document>,
    /// Failed attempts so far.
    pub attempt: u32,
    /// Current status.
    pub status: TaskStatus,
    /// Last failure message.
    pub last_error: Option<String>,
    /// When the task was first queued.
    #[serde(skip)]
    pub enqueued_at: Instant,
    /// Earliest time a retry may run.
    #[serde(skip)]
    pub not_before: Option<Instant>,
}

/// What `enqueue` did with a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new task was queued.
    Queued(TaskId),
    /// The change replaced a waiting task's contents.
    Coalesced(TaskId),
}

impl EnqueueOutcome {
    /// Returns the affected task id.
    pub fn task_id(self) -> TaskId {
        match self {
            Self::Queued(id) | Self::Coalesced(id) => id,
        }
    }
}

/// What `retry` did with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Requeued with a backoff deadline.
    Requeued,
    /// Dropped because a newer change for the key is already waiting.
    Superseded,
}

/// Queue counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Waiting tasks (queued or waiting to retry).
    pub queue_size: usize,
    /// Waiting tasks that failed before.
    pub retrying: usize,
    /// Tasks held by workers.
    pub processing: usize,
    /// Dead letters retained.
    pub dead_letters: usize,
    /// New tasks created.
    pub enqueued_total: u64,
    /// Changes merged into a waiting task.
    pub coalesced_total: u64,
    /// Tasks applied to the index.
    pub synced_total: u64,
    /// Retries scheduled.
    pub retries_total: u64,
    /// Tasks dead-lettered.
    pub dead_lettered_total: u64,
    /// Failed tasks dropped in favour of a newer change.
    pub superseded_total: u64,
    /// Changes refused (queue full or closed).
    pub rejected_total: u64,
    /// Tasks discarded by `drain`.
    pub drained_total: u64,
    /// Dead letters evicted past the retention limit.
    pub dead_letters_evicted_total: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: TaskId,
    next_seq: u64,
    /// Waiting tasks by id.
    tasks: HashMap<TaskId, SyncTask>,
    /// Waiting task ids by queue position.
    order: BTreeMap<u64, TaskId>,
    /// Queue position of each waiting task.
    positions: HashMap<TaskId, u64>,
    /// Waiting task per key.
    waiting: HashMap<EntityKey, TaskId>,
    /// In-flight task per key.
    in_flight: HashMap<EntityKey, TaskId>,
    dead: VecDeque<SyncTask>,
    closed: bool,
    stats: QueueStats,
}

impl QueueState {
    fn insert_waiting(&mut self, task: SyncTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, task.id);
        self.positions.insert(task.id, seq);
        self.waiting.insert(task.key.clone(), task.id);
        self.tasks.insert(task.id, task);
    }

    fn take_waiting(&mut self, id: TaskId) -> Option<SyncTask> {
        let task = self.tasks.remove(&id)?;
        if let Some(seq) = self.positions.remove(&id) {
            self.order.remove(&seq);
        }
        self.waiting.remove(&task.key);
        Some(task)
    }

    fn release(&mut self, task: &SyncTask) {
        if self.in_flight.get(&task.key) == Some(&task.id) {
            self.in_flight.remove(&task.key);
        }
    }

    fn is_eligible(&self, task: &SyncTask, now: Instant) -> bool {
        !self.in_flight.contains_key(&task.key) && task.not_before.map_or(true, |at| at <= now)
    }
}

/// A coalescing work queue of index sync tasks.
///
/// # Example
///
/// ```rust
/// use listsync_core::{EntityKey, IndexChange};
/// use listsync_sync_engine::ChangeQueue;
/// use serde_json::json;
///
/// let queue = ChangeQueue::new(1024, 16);
/// let key = EntityKey::new("listing", "L1");
/// queue.enqueue(IndexChange::upsert(key.clone(), json!({"v": 1}))).unwrap();
/// queue.enqueue(IndexChange::upsert(key, json!({"v": 2}))).unwrap();
///
/// assert_eq!(queue.size(), 1);
/// let task = queue.try_dequeue().unwrap();
/// assert_eq!(task.payload, Some(json!({"v": 2})));
/// ```
#[derive(Debug)]
pub struct ChangeQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dead_letter_limit: usize,
}

impl ChangeQueue {
    /// Creates a queue holding at most `capacity` waiting tasks and
    /// retaining at most `dead_letter_limit` dead letters.
    pub fn new(capacity: usize, dead_letter_limit: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
            dead_letter_limit,
        }
    }

    /// Adds a change, coalescing with a waiting task for the same key.
    pub fn enqueue(&self, change: IndexChange) -> CoreResult<EnqueueOutcome> {
        let IndexChange { key, kind, payload } = change;
        let mut state = self.state.lock();

        if state.closed {
            state.stats.rejected_total += 1;
            return Err(CoreError::QueueClosed);
        }

        if let Some(&id) = state.waiting.get(&key) {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.change = kind;
                task.payload = payload;
                state.stats.coalesced_total += 1;
                debug!(task = id, key = %key, %kind, "coalesced sync task");
                return Ok(EnqueueOutcome::Coalesced(id));
            }
        }

        if state.tasks.len() >= self.capacity {
            state.stats.rejected_total += 1;
            return Err(CoreError::QueueFull {
                capacity: self.capacity,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        state.insert_waiting(SyncTask {
            id,
            key,
            change: kind,
            payload,
            attempt: 0,
            status: TaskStatus::Queued,
            last_error: None,
            enqueued_at: Instant::now(),
            not_before: None,
        });
        state.stats.enqueued_total += 1;
        drop(state);

        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Queued(id))
    }

    /// Takes the oldest eligible task, marking it `Processing`.
    ///
    /// A task is eligible when no task for its key is in flight and its
    /// retry deadline, if any, has passed.
    pub fn try_dequeue(&self) -> Option<SyncTask> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let id = state
            .order
            .values()
            .copied()
            .find(|id| {
                state
                    .tasks
                    .get(id)
                    .is_some_and(|task| state.is_eligible(task, now))
            })?;

        let mut task = state.take_waiting(id)?;
        task.status = TaskStatus::Processing;
        state.in_flight.insert(task.key.clone(), task.id);
        Some(task)
    }

    /// Waits for the next eligible task.
    ///
    /// Returns `None` once `cancel` fires. Safe to call from many workers.
    pub async fn dequeue_next(&self, cancel: &Cancellation) -> Option<SyncTask> {
        loop {
            // Registered before checking so a concurrent enqueue is not missed.
            let notified = self.notify.notified();
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(task) = self.try_dequeue() {
                return Some(task);
            }

            match self.next_retry_deadline() {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at.into()) => {}
                        _ = cancel.cancelled() => return None,
                    }
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = cancel.cancelled() => return None,
                    }
                }
            }
        }
    }

    /// Releases a successfully applied task.
    pub fn complete(&self, task: &SyncTask) {
        let mut state = self.state.lock();
        state.release(task);
        state.stats.synced_total += 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Requeues a failed task to run after `delay`.
    ///
    /// If a newer change for the key is already waiting, the failed task is
    /// dropped instead: the newer change carries the latest state.
    pub fn retry(&self, mut task: SyncTask, error: String, delay: Duration) -> RetryDisposition {
        let mut state = self.state.lock();
        state.release(&task);

        let disposition = if state.waiting.contains_key(&task.key) {
            state.stats.superseded_total += 1;
            RetryDisposition::Superseded
        } else {
            task.status = TaskStatus::FailedRetryable;
            task.last_error = Some(error);
            task.not_before = Some(Instant::now() + delay);
            state.insert_waiting(task);
            state.stats.retries_total += 1;
            RetryDisposition::Requeued
        };
        drop(state);

        self.notify.notify_waiters();
        disposition
    }

    /// Moves a task that exhausted its retries to the dead-letter list.
    pub fn dead_letter(&self, mut task: SyncTask, error: String) {
        let mut state = self.state.lock();
        state.release(&task);
        task.status = TaskStatus::Dead;
        task.last_error = Some(error);
        task.not_before = None;
        state.dead.push_back(task);
        let mut evicted = Vec::new();
        while state.dead.len() > self.dead_letter_limit {
            if let Some(old) = state.dead.pop_front() {
                evicted.push(old);
            }
        }
        state.stats.dead_lettered_total += 1;
        state.stats.dead_letters_evicted_total += evicted.len() as u64;
        drop(state);
        self.notify.notify_waiters();

        for old in evicted {
            warn!(
                target: "listsync::dead_letter",
                task = old.id,
                key = %old.key,
                attempts = old.attempt,
                error = old.last_error.as_deref().unwrap_or_default(),
                limit = self.dead_letter_limit,
                "dead letter evicted past retention limit"
            );
        }
    }

    /// Returns the number of waiting tasks.
    pub fn size(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Returns the number of in-flight tasks.
    pub fn processing(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Returns true if nothing is waiting or in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.tasks.is_empty() && state.in_flight.is_empty()
    }

    /// Returns a copy of the waiting tasks in queue order.
    pub fn pending(&self) -> Vec<SyncTask> {
        let state = self.state.lock();
        state
            .order
            .values()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    /// Returns the retained dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<SyncTask> {
        self.state.lock().dead.iter().cloned().collect()
    }

    /// Clears the dead-letter list, returning how many were removed.
    pub fn clear_dead_letters(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.dead.len();
        state.dead.clear();
        count
    }

    /// Discards every waiting task. In-flight tasks are unaffected.
    ///
    /// Operator escape hatch; normal flow never drains.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.tasks.len();
        state.tasks.clear();
        state.order.clear();
        state.positions.clear();
        state.waiting.clear();
        state.stats.drained_total += count as u64;
        count
    }

    /// Stops accepting new changes.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Returns a snapshot of the queue counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.queue_size = state.tasks.len();
        stats.retrying = state
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::FailedRetryable)
            .count();
        stats.processing = state.in_flight.len();
        stats.dead_letters = state.dead.len();
        stats
    }

    fn next_retry_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        state
            .tasks
            .values()
            .filter(|task| !state.in_flight.contains_key(&task.key))
            .filter_map(|task| task.not_before)
            .min()
    }
}

impl ChangeSink for ChangeQueue {
    fn push(&self, change: IndexChange) -> CoreResult<()> {
        self.enqueue(change).map(|_| ())
    }
}
