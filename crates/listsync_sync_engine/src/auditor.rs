//! Consistency auditor: diffs primary and index id sets and repairs drift.
//!
//! Audits compare plain id sets per entity type. The two listings are not
//! taken atomically, so a report can show drift caused by writes racing
//! the audit; such drift is advisory and settles on the next run.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::ChangeQueue;
use listsync_core::{
    with_timeout, AdapterResult, Cancellation, EntityKey, IndexChange, PrimaryStore, SearchIndex,
    INDEX, PRIMARY,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// An entity type the audit could not compare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditFailure {
    /// Entity type being listed.
    pub entity_type: String,
    /// Adapter that failed.
    pub adapter: &'static str,
    /// Failure message.
    pub message: String,
}

/// Result of comparing the primary store with the search index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    /// Entity types compared.
    pub entity_types: Vec<String>,
    /// Ids found in the primary store.
    pub primary_count: usize,
    /// Ids found in the index.
    pub index_count: usize,
    /// In the primary store but not the index.
    pub missing_in_index: Vec<EntityKey>,
    /// In the index but not the primary store.
    pub extra_in_index: Vec<EntityKey>,
    /// Entity types skipped because a listing failed.
    pub errors: Vec<AuditFailure>,
    /// When the audit finished.
    pub checked_at: SystemTime,
}

impl ConsistencyReport {
    fn new(entity_types: Vec<String>) -> Self {
        Self {
            entity_types,
            primary_count: 0,
            index_count: 0,
            missing_in_index: Vec::new(),
            extra_in_index: Vec::new(),
            errors: Vec::new(),
            checked_at: SystemTime::now(),
        }
    }

    /// True if every entity type was compared and no drift was found.
    pub fn is_consistent(&self) -> bool {
        self.is_complete() && self.missing_in_index.is_empty() && self.extra_in_index.is_empty()
    }

    /// True if every entity type was compared.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of drifted ids.
    pub fn drift(&self) -> usize {
        self.missing_in_index.len() + self.extra_in_index.len()
    }
}

/// Result of repairing a report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    /// Upserts enqueued for missing ids.
    pub upserts_enqueued: usize,
    /// Deletes enqueued for extra ids.
    pub deletes_enqueued: usize,
    /// Ids left alone: vanished or reappeared in the primary store, or unreadable.
    pub unresolved: Vec<EntityKey>,
    /// Changes the queue refused.
    pub enqueue_failures: usize,
    /// Whether the repair stopped early.
    pub cancelled: bool,
}

/// Result of re-enqueueing every primary document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FullSyncSummary {
    /// Upserts enqueued.
    pub enqueued: usize,
    /// Documents that could not be read or vanished during the scan.
    pub skipped: usize,
    /// Changes the queue refused.
    pub enqueue_failures: usize,
    /// Entity types that could not be listed.
    pub errors: Vec<AuditFailure>,
    /// Whether the scan stopped early.
    pub cancelled: bool,
}

/// Compares the primary store with the search index.
pub struct ConsistencyAuditor {
    primary: Arc<dyn PrimaryStore>,
    index: Arc<dyn SearchIndex>,
    queue: Arc<ChangeQueue>,
    entity_types: Vec<String>,
    primary_timeout: Duration,
    index_timeout: Duration,
    batch_size: usize,
}

impl ConsistencyAuditor {
    /// Creates an auditor over the entity types in `config`.
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        index: Arc<dyn SearchIndex>,
        queue: Arc<ChangeQueue>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            primary,
            index,
            queue,
            entity_types: config.entity_types.clone(),
            primary_timeout: config.primary_timeout,
            index_timeout: config.index_timeout,
            batch_size: config.audit_batch_size.max(1),
        }
    }

    /// Lists both stores and reports the difference.
    ///
    /// A listing failure for one entity type is recorded in
    /// [`ConsistencyReport::errors`] and the audit moves on. Returns
    /// [`SyncError::Cancelled`] if `cancel` fires mid-scan.
    pub async fn audit(&self, cancel: &Cancellation) -> SyncResult<ConsistencyReport> {
        let mut report = ConsistencyReport::new(self.entity_types.clone());

        for entity_type in &self.entity_types {
            cancel.check()?;

            let primary_ids = match self.list_primary(entity_type).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(
                        entity_type = %entity_type,
                        error = %err,
                        "audit could not list primary store"
                    );
                    report.errors.push(failure(entity_type, PRIMARY, err.to_string()));
                    continue;
                }
            };
            let index_ids = match self.list_index(entity_type).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(entity_type = %entity_type, error = %err, "audit could not list index");
                    report.errors.push(failure(entity_type, INDEX, err.to_string()));
                    continue;
                }
            };

            report.primary_count += primary_ids.len();
            report.index_count += index_ids.len();

            let missing = self.difference(entity_type, &primary_ids, &index_ids, cancel)?;
            let extra = self.difference(entity_type, &index_ids, &primary_ids, cancel)?;
            debug!(
                entity_type = %entity_type,
                missing = missing.len(),
                extra = extra.len(),
                "audited entity type"
            );
            report.missing_in_index.extend(missing);
            report.extra_in_index.extend(extra);
        }

        report.checked_at = SystemTime::now();
        info!(
            primary = report.primary_count,
            index = report.index_count,
            missing = report.missing_in_index.len(),
            extra = report.extra_in_index.len(),
            failed_types = report.errors.len(),
            "consistency audit finished"
        );
        Ok(report)
    }

    /// Enqueues the changes that bring the index back in line with `report`.
    ///
    /// Missing ids are re-read from the primary store and enqueued as
    /// upserts. Extra ids are enqueued as deletes after confirming they are
    /// still absent from the primary store. Safe to run more than once.
    pub async fn repair(&self, report: &ConsistencyReport, cancel: &Cancellation) -> RepairSummary {
        let mut summary = RepairSummary::default();

        for (n, key) in report.missing_in_index.iter().enumerate() {
            if n % self.batch_size == 0 && cancel.is_cancelled() {
                summary.cancelled = true;
                return summary;
            }
            match self.read_primary(key).await {
                Ok(Some(document)) => {
                    match self.queue.enqueue(IndexChange::upsert(key.clone(), document)) {
                        Ok(_) => summary.upserts_enqueued += 1,
                        Err(err) => {
                            warn!(key = %key, error = %err, "repair could not enqueue upsert");
                            summary.enqueue_failures += 1;
                        }
                    }
                }
                Ok(None) => {
                    debug!(key = %key, "missing id vanished from primary store");
                    summary.unresolved.push(key.clone());
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "repair could not read primary document");
                    summary.unresolved.push(key.clone());
                }
            }
        }

        for (n, key) in report.extra_in_index.iter().enumerate() {
            if n % self.batch_size == 0 && cancel.is_cancelled() {
                summary.cancelled = true;
                return summary;
            }
            match self.read_primary(key).await {
                Ok(None) => match self.queue.enqueue(IndexChange::delete(key.clone())) {
                    Ok(_) => summary.deletes_enqueued += 1,
                    Err(err) => {
                        warn!(key = %key, error = %err, "repair could not enqueue delete");
                        summary.enqueue_failures += 1;
                    }
                },
                Ok(Some(_)) => {
                    // Written since the audit; the commit path carries it.
                    debug!(key = %key, "extra id reappeared in primary store");
                    summary.unresolved.push(key.clone());
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "repair could not confirm extra id");
                    summary.unresolved.push(key.clone());
                }
            }
        }

        info!(
            upserts = summary.upserts_enqueued,
            deletes = summary.deletes_enqueued,
            unresolved = summary.unresolved.len(),
            enqueue_failures = summary.enqueue_failures,
            "repair enqueued"
        );
        summary
    }

    /// Enqueues an upsert for every document in the primary store.
    pub async fn full_resync(&self, cancel: &Cancellation) -> FullSyncSummary {
        let mut summary = FullSyncSummary::default();

        'types: for entity_type in &self.entity_types {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let ids = match self.list_primary(entity_type).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(
                        entity_type = %entity_type,
                        error = %err,
                        "full sync could not list primary store"
                    );
                    summary.errors.push(failure(entity_type, PRIMARY, err.to_string()));
                    continue;
                }
            };

            for (n, id) in ids.into_iter().enumerate() {
                if n % self.batch_size == 0 && cancel.is_cancelled() {
                    summary.cancelled = true;
                    break 'types;
                }
                let key = EntityKey::new(entity_type.as_str(), id);
                match self.read_primary(&key).await {
                    Ok(Some(document)) => {
                        match self.queue.enqueue(IndexChange::upsert(key, document)) {
                            Ok(_) => summary.enqueued += 1,
                            Err(err) => {
                                warn!(error = %err, "full sync could not enqueue upsert");
                                summary.enqueue_failures += 1;
                            }
                        }
                    }
                    Ok(None) => summary.skipped += 1,
                    Err(err) => {
                        warn!(key = %key, error = %err, "full sync could not read document");
                        summary.skipped += 1;
                    }
                }
            }
        }

        info!(
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            enqueue_failures = summary.enqueue_failures,
            cancelled = summary.cancelled,
            "full sync enqueued"
        );
        summary
    }

    async fn list_primary(&self, entity_type: &str) -> AdapterResult<BTreeSet<String>> {
        with_timeout(
            PRIMARY,
            "list_all_ids",
            self.primary_timeout,
            self.primary.list_all_ids(entity_type),
        )
        .await
        .map(|ids| ids.into_iter().collect())
    }

    async fn list_index(&self, entity_type: &str) -> AdapterResult<BTreeSet<String>> {
        with_timeout(
            INDEX,
            "list_all_ids",
            self.index_timeout,
            self.index.list_all_ids(entity_type),
        )
        .await
        .map(|ids| ids.into_iter().collect())
    }

    async fn read_primary(
        &self,
        key: &EntityKey,
    ) -> AdapterResult<Option<listsync_core::Document>> {
        with_timeout(PRIMARY, "read", self.primary_timeout, self.primary.read(key)).await
    }

    /// Ids in `left` but not `right`, checking `cancel` every batch.
    fn difference(
        &self,
        entity_type: &str,
        left: &BTreeSet<String>,
        right: &BTreeSet<String>,
        cancel: &Cancellation,
    ) -> SyncResult<Vec<EntityKey>> {
        let mut keys = Vec::new();
        for (n, id) in left.iter().enumerate() {
            if n % self.batch_size == 0 {
                cancel.check()?;
            }
            if !right.contains(id) {
                keys.push(EntityKey::new(entity_type, id.as_str()));
            }
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for ConsistencyAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyAuditor")
            .field("entity_types", &self.entity_types)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

fn failure(entity_type: &str, adapter: &'static str, message: String) -> AuditFailure {
    AuditFailure {
        entity_type: entity_type.to_string(),
        adapter,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use listsync_core::{MemoryPrimaryStore, MemorySearchIndex};
    use serde_json::json;

    struct Fixture {
        primary: Arc<MemoryPrimaryStore>,
        index: Arc<MemorySearchIndex>,
        queue: Arc<ChangeQueue>,
        auditor: ConsistencyAuditor,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let primary = Arc::new(MemoryPrimaryStore::new());
        let index = Arc::new(MemorySearchIndex::new());
        let queue = Arc::new(ChangeQueue::new(1024, 16));
        let auditor =
            ConsistencyAuditor::new(primary.clone(), index.clone(), Arc::clone(&queue), &config);
        Fixture {
            primary,
            index,
            queue,
            auditor,
        }
    }

    fn listing(id: &str) -> EntityKey {
        EntityKey::new("listing", id)
    }

    #[tokio::test]
    async fn identical_sets_are_consistent() {
        let fx = fixture(EngineConfig::default());
        for id in ["a", "b", "c"] {
            fx.primary.insert(listing(id), json!({}));
            fx.index.insert(listing(id), json!({}));
        }

        let report = fx.auditor.audit(&Cancellation::new()).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.primary_count, 3);
        assert_eq!(report.index_count, 3);
        assert_eq!(report.drift(), 0);
    }

    #[tokio::test]
    async fn reports_missing_and_extra() {
        let fx = fixture(EngineConfig::default());
        fx.primary.insert(listing("a"), json!({}));
        fx.primary.insert(listing("x"), json!({}));
        fx.index.insert(listing("a"), json!({}));
        fx.index.insert(listing("ghost"), json!({}));

        let report = fx.auditor.audit(&Cancellation::new()).await.unwrap();
        assert!(!report.is_consistent());
        assert!(report.is_complete());
        assert_eq!(report.missing_in_index, vec![listing("x")]);
        assert_eq!(report.extra_in_index, vec![listing("ghost")]);
    }

    #[tokio::test]
    async fn listing_failure_is_recorded_not_fatal() {
        let fx = fixture(EngineConfig::new(["listing", "user"]));
        fx.primary.insert(EntityKey::new("user", "u1"), json!({}));
        fx.index.set_available(false);

        let report = fx.auditor.audit(&Cancellation::new()).await.unwrap();
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|e| e.adapter == INDEX));
        assert!(!report.is_complete());
        assert!(!report.is_consistent());
    }

    #[tokio::test]
    async fn cancelled_audit_returns_error() {
        let fx = fixture(EngineConfig::default());
        fx.primary.insert(listing("a"), json!({}));
        let cancel = Cancellation::new();
        cancel.cancel();

        assert_eq!(fx.auditor.audit(&cancel).await, Err(SyncError::Cancelled));
    }

    #[tokio::test]
    async fn repair_enqueues_upserts_and_deletes() {
        let fx = fixture(EngineConfig::default());
        fx.primary.insert(listing("x"), json!({"title": "lamp"}));
        fx.index.insert(listing("ghost"), json!({}));

        let report = fx.auditor.audit(&Cancellation::new()).await.unwrap();
        let summary = fx.auditor.repair(&report, &Cancellation::new()).await;
        assert_eq!(summary.upserts_enqueued, 1);
        assert_eq!(summary.deletes_enqueued, 1);
        assert!(summary.unresolved.is_empty());

        let pending = fx.queue.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].key, listing("x"));
        assert_eq!(pending[0].payload, Some(json!({"title": "lamp"})));
        assert_eq!(pending[1].key, listing("ghost"));
    }

    #[tokio::test]
    async fn repair_skips_ids_that_changed_since_audit() {
        let fx = fixture(EngineConfig::default());
        fx.primary.insert(listing("x"), json!({}));
        fx.index.insert(listing("ghost"), json!({}));
        let report = fx.auditor.audit(&Cancellation::new()).await.unwrap();

        fx.primary.remove(&listing("x"));
        fx.primary.insert(listing("ghost"), json!({}));

        let summary = fx.auditor.repair(&report, &Cancellation::new()).await;
        assert_eq!(summary.upserts_enqueued, 0);
        assert_eq!(summary.deletes_enqueued, 0);
        assert_eq!(summary.unresolved, vec![listing("x"), listing("ghost")]);
        assert_eq!(fx.queue.size(), 0);
    }

    #[tokio::test]
    async fn full_resync_enqueues_every_document() {
        let fx = fixture(EngineConfig::new(["listing", "user"]));
        fx.primary.insert(listing("a"), json!({}));
        fx.primary.insert(listing("b"), json!({}));
        fx.primary.insert(EntityKey::new("user", "u1"), json!({}));

        let summary = fx.auditor.full_resync(&Cancellation::new()).await;
        assert_eq!(summary.enqueued, 3);
        assert_eq!(fx.queue.size(), 3);
        assert!(!summary.cancelled);
    }
}
