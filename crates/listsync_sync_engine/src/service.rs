//! Administrative surface over the coordinator, queue, workers and auditor.

use crate::auditor::{ConsistencyAuditor, ConsistencyReport, FullSyncSummary, RepairSummary};
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::{ChangeQueue, QueueStats, SyncTask};
use crate::worker::{SyncWorker, WorkerHealth, WorkerPool};
use listsync_core::{
    with_timeout, Cancellation, CleanupSummary, CoordinatorConfig, CoordinatorStatsSnapshot,
    PrimaryStore, SearchIndex, TransactionCoordinator, INDEX,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Combined queue and transaction statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Change queue counters.
    pub queue: QueueStats,
    /// Transaction coordinator counters.
    pub transactions: CoordinatorStatsSnapshot,
    /// Worker tasks currently running.
    pub workers_running: usize,
    /// Most recent index failure.
    pub last_error: Option<String>,
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// True when the index is reachable and nothing is dead-lettered.
    pub healthy: bool,
    /// Index health check result.
    pub index_reachable: bool,
    /// Index health check failure.
    pub index_error: Option<String>,
    /// Worker tasks currently running.
    pub workers_running: usize,
    /// Worker and queue health.
    pub worker: WorkerHealth,
}

/// An audit followed by the repair it triggered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairReport {
    /// What the audit found.
    pub report: ConsistencyReport,
    /// What the repair enqueued.
    pub repair: RepairSummary,
}

struct Running {
    pool: WorkerPool,
    scheduler: Option<(Cancellation, JoinHandle<()>)>,
}

/// The sync pipeline and its operator controls.
///
/// Owns the transaction coordinator, whose committed index changes flow
/// into the change queue drained by the worker pool.
///
/// # Example
///
/// ```rust,ignore
/// let service = SyncService::new(
///     EngineConfig::default(),
///     CoordinatorConfig::default(),
///     primary,
///     index,
/// )?;
/// service.start()?;
///
/// let coordinator = service.coordinator();
/// let txn = coordinator.begin_default();
/// coordinator.add_operation(txn, Operation::write(key, doc).compensate_with_delete().indexed())?;
/// coordinator.commit(txn).await?;
///
/// service.shutdown().await;
/// ```
pub struct SyncService {
    config: EngineConfig,
    index: Arc<dyn SearchIndex>,
    queue: Arc<ChangeQueue>,
    coordinator: Arc<TransactionCoordinator>,
    worker: Arc<SyncWorker>,
    auditor: Arc<ConsistencyAuditor>,
    last_audit: Arc<RwLock<Option<ConsistencyReport>>>,
    running: Mutex<Option<Running>>,
}

impl SyncService {
    /// Wires the pipeline together. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: EngineConfig,
        coordinator_config: CoordinatorConfig,
        primary: Arc<dyn PrimaryStore>,
        index: Arc<dyn SearchIndex>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let queue = Arc::new(ChangeQueue::new(
            config.max_queue_len,
            config.dead_letter_limit,
        ));
        let coordinator = Arc::new(
            TransactionCoordinator::new(Arc::clone(&primary), coordinator_config)
                .with_sink(queue.clone()),
        );
        let worker = Arc::new(SyncWorker::new(
            Arc::clone(&queue),
            Arc::clone(&index),
            config.retry.clone(),
            config.index_timeout,
        ));
        let auditor = Arc::new(ConsistencyAuditor::new(
            primary,
            Arc::clone(&index),
            Arc::clone(&queue),
            &config,
        ));

        Ok(Self {
            config,
            index,
            queue,
            coordinator,
            worker,
            auditor,
            last_audit: Arc::new(RwLock::new(None)),
            running: Mutex::new(None),
        })
    }

    /// Returns the transaction coordinator.
    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    /// Returns the change queue.
    pub fn queue(&self) -> &Arc<ChangeQueue> {
        &self.queue
    }

    /// Returns the sync worker.
    pub fn worker(&self) -> &Arc<SyncWorker> {
        &self.worker
    }

    /// Returns the consistency auditor.
    pub fn auditor(&self) -> &Arc<ConsistencyAuditor> {
        &self.auditor
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns true between [`start`](Self::start) and [`shutdown`](Self::shutdown).
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawns the worker pool and, if configured, the audit scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> SyncResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let pool = WorkerPool::spawn(Arc::clone(&self.worker), self.config.worker_count);
        let scheduler = self.config.audit_interval.map(|interval| {
            let cancel = Cancellation::new();
            let handle = tokio::spawn(scheduled_audits(
                Arc::clone(&self.auditor),
                Arc::clone(&self.last_audit),
                interval,
                self.config.auto_repair,
                cancel.clone(),
            ));
            (cancel, handle)
        });

        info!(
            workers = self.config.worker_count,
            audit_interval_ms = self.config.audit_interval.map(|i| i.as_millis() as u64),
            auto_repair = self.config.auto_repair,
            "sync service started"
        );
        *running = Some(Running { pool, scheduler });
        Ok(())
    }

    /// Stops the scheduler and the workers.
    ///
    /// Waiting tasks stay queued and are picked up by the next `start`.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        if let Some((cancel, handle)) = running.scheduler {
            cancel.cancel();
            if let Err(err) = handle.await {
                warn!(error = %err, "audit scheduler ended abnormally");
            }
        }
        running.pool.shutdown().await;
        info!(queued = self.queue.size(), "sync service stopped");
    }

    /// Re-enqueues every primary document of every configured entity type.
    pub async fn trigger_full_sync(&self) -> FullSyncSummary {
        self.auditor.full_resync(&Cancellation::new()).await
    }

    /// Runs a consistency audit.
    pub async fn run_consistency_check(&self) -> SyncResult<ConsistencyReport> {
        let report = self.auditor.audit(&Cancellation::new()).await?;
        *self.last_audit.write() = Some(report.clone());
        Ok(report)
    }

    /// Runs an audit and enqueues repairs for the drift it finds.
    pub async fn repair_inconsistencies(&self) -> SyncResult<RepairReport> {
        let report = self.run_consistency_check().await?;
        let repair = self.auditor.repair(&report, &Cancellation::new()).await;
        Ok(RepairReport { report, repair })
    }

    /// Returns the most recent audit report.
    pub fn last_audit(&self) -> Option<ConsistencyReport> {
        self.last_audit.read().clone()
    }

    /// Returns queue and transaction statistics.
    pub fn get_sync_stats(&self) -> SyncStats {
        SyncStats {
            queue: self.queue.stats(),
            transactions: self.coordinator.stats(),
            workers_running: self.workers_running(),
            last_error: self.worker.health().last_error,
        }
    }

    /// Discards every waiting task, returning how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let dropped = self.queue.drain();
        warn!(dropped, "sync queue cleared");
        dropped
    }

    /// Reclaims pending transactions older than `max_age`.
    pub async fn cleanup_stale_transactions(&self, max_age: Duration) -> CleanupSummary {
        self.coordinator
            .cleanup_stale(max_age, &Cancellation::new())
            .await
    }

    /// Returns the retained dead letters.
    pub fn dead_letters(&self) -> Vec<SyncTask> {
        self.queue.dead_letters()
    }

    /// Checks index reachability and worker health.
    pub async fn health_check(&self) -> HealthReport {
        let index = with_timeout(
            INDEX,
            "health_check",
            self.config.index_timeout,
            self.index.health_check(),
        )
        .await;
        let worker = self.worker.health();
        let index_error = index.err().map(|err| err.to_string());

        HealthReport {
            healthy: index_error.is_none() && worker.dead_letters == 0,
            index_reachable: index_error.is_none(),
            index_error,
            workers_running: self.workers_running(),
            worker,
        }
    }

    /// Waits until the queue has nothing waiting or in flight.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queue.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn workers_running(&self) -> usize {
        self.running.lock().as_ref().map_or(0, |r| r.pool.len())
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("config", &self.config)
            .field("queue", &self.queue.stats())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn scheduled_audits(
    auditor: Arc<ConsistencyAuditor>,
    last_audit: Arc<RwLock<Option<ConsistencyReport>>>,
    interval: Duration,
    auto_repair: bool,
    cancel: Cancellation,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let report = match auditor.audit(&cancel).await {
            Ok(report) => report,
            Err(SyncError::Cancelled) => return,
            Err(err) => {
                warn!(error = %err, "scheduled audit failed");
                continue;
            }
        };

        if auto_repair && !report.is_consistent() {
            let summary = auditor.repair(&report, &cancel).await;
            if summary.cancelled {
                return;
            }
        }
        *last_audit.write() = Some(report);
    }
}
