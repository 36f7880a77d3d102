//! End-to-end tests: coordinator commits flowing through the queue and
//! workers into the index, with the auditor catching what gets lost.

use listsync_core::{
    Cancellation, CoordinatorConfig, EntityKey, Operation, TransactionStatus,
};
use listsync_sync_engine::{EngineConfig, RetryConfig, SyncService, TaskStatus};
use listsync_testkit::{FaultyPrimaryStore, FlakySearchIndex};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DRAIN: Duration = Duration::from_secs(5);

struct Harness {
    primary: Arc<FaultyPrimaryStore>,
    index: Arc<FlakySearchIndex>,
    service: SyncService,
}

fn harness(config: EngineConfig) -> Harness {
    let primary = Arc::new(FaultyPrimaryStore::new());
    let index = Arc::new(FlakySearchIndex::new());
    let service = SyncService::new(
        config,
        CoordinatorConfig::default(),
        primary.clone(),
        index.clone(),
    )
    .unwrap();
    Harness {
        primary,
        index,
        service,
    }
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::new(max_attempts)
        .with_initial_delay(Duration::from_millis(2))
        .with_max_delay(Duration::from_millis(20))
}

fn listing(id: &str) -> EntityKey {
    EntityKey::new("listing", id)
}

fn audit_row(id: &str) -> EntityKey {
    EntityKey::new("audit_log", id)
}

#[tokio::test]
async fn committed_transaction_reaches_both_stores() {
    let h = harness(EngineConfig::default());
    h.service.start().unwrap();
    let coordinator = h.service.coordinator();

    let txn = coordinator.begin_default();
    coordinator
        .add_operation(
            txn,
            Operation::write(listing("L1"), json!({"title": "bike"}))
                .compensate_with_delete()
                .indexed(),
        )
        .unwrap();
    coordinator
        .add_operation(
            txn,
            Operation::write(audit_row("1"), json!({"action": "create"})).compensate_with_delete(),
        )
        .unwrap();

    let outcome = coordinator.commit(txn).await.unwrap();
    assert_eq!(outcome.status, TransactionStatus::Committed);
    assert!(h.service.wait_for_idle(DRAIN).await);

    assert_eq!(h.primary.inner().get(&listing("L1")), Some(json!({"title": "bike"})));
    assert!(h.primary.inner().get(&audit_row("1")).is_some());
    assert_eq!(h.index.inner().get(&listing("L1")), Some(json!({"title": "bike"})));
    // Only indexed operations reach the index.
    assert!(h.index.inner().get(&audit_row("1")).is_none());

    h.service.shutdown().await;
}

#[tokio::test]
async fn failed_second_write_rolls_back_and_enqueues_nothing() {
    let h = harness(EngineConfig::default());
    h.primary.fail_writes_to(audit_row("1"));
    let coordinator = h.service.coordinator();

    let txn = coordinator.begin_default();
    coordinator
        .add_operation(
            txn,
            Operation::write(listing("L1"), json!({}))
                .compensate_with_delete()
                .indexed(),
        )
        .unwrap();
    coordinator
        .add_operation(
            txn,
            Operation::write(audit_row("1"), json!({})).compensate_with_delete(),
        )
        .unwrap();

    let outcome = coordinator.commit(txn).await.unwrap();
    assert_eq!(outcome.status, TransactionStatus::RolledBack);
    assert_eq!(outcome.failed_operation, Some(1));
    assert_eq!(outcome.compensated, 1);
    assert_eq!(h.primary.inner().get(&listing("L1")), None);
    assert_eq!(h.service.queue().stats().enqueued_total, 0);
    assert_eq!(h.service.get_sync_stats().transactions.rolled_back, 1);
}

#[tokio::test]
async fn compensation_runs_in_reverse_order() {
    let h = harness(EngineConfig::default());
    h.primary.fail_writes_to(listing("C"));
    let coordinator = h.service.coordinator();

    let txn = coordinator.begin_default();
    for id in ["A", "B", "C"] {
        coordinator
            .add_operation(
                txn,
                Operation::write(listing(id), json!({})).compensate_with_delete(),
            )
            .unwrap();
    }

    let outcome = coordinator.commit(txn).await.unwrap();
    assert_eq!(outcome.status, TransactionStatus::RolledBack);
    assert_eq!(
        h.primary.calls(),
        vec![
            "write listing/A",
            "write listing/B",
            "write listing/C",
            "delete listing/B",
            "delete listing/A",
        ]
    );
    assert_eq!(h.primary.inner().len("listing"), 0);
}

#[tokio::test]
async fn failed_compensation_marks_transaction_failed() {
    let h = harness(EngineConfig::default());
    h.primary.fail_writes_to(listing("B"));
    h.primary.fail_deletes_of(listing("A"));
    let coordinator = h.service.coordinator();

    let txn = coordinator.begin_default();
    for id in ["A", "B"] {
        coordinator
            .add_operation(
                txn,
                Operation::write(listing(id), json!({})).compensate_with_delete(),
            )
            .unwrap();
    }

    let outcome = coordinator.commit(txn).await.unwrap();
    assert_eq!(outcome.status, TransactionStatus::Failed);
    assert!(matches!(
        outcome.error,
        Some(listsync_core::CoreError::CompensationFailure { operation: 0, .. })
    ));
    assert_eq!(
        coordinator.status(txn).map(|info| info.status),
        Some(TransactionStatus::Failed)
    );
}

#[tokio::test]
async fn updates_before_processing_coalesce_into_one_sync() {
    let h = harness(EngineConfig::default());
    let coordinator = h.service.coordinator();

    for version in 1..=2 {
        let txn = coordinator.begin_default();
        coordinator
            .add_operation(
                txn,
                Operation::write(listing("L1"), json!({"v": version})).indexed(),
            )
            .unwrap();
        assert!(coordinator.commit(txn).await.unwrap().is_committed());
    }
    assert_eq!(h.service.queue().size(), 1);

    assert_eq!(h.service.worker().process_available().await, 1);
    assert_eq!(h.index.attempts(&listing("L1")), 1);
    assert_eq!(h.index.inner().get(&listing("L1")), Some(json!({"v": 2})));
}

#[tokio::test]
async fn identical_stores_audit_consistent() {
    let h = harness(EngineConfig::new(["listing", "user"]));
    for key in [listing("a"), listing("b"), EntityKey::new("user", "u1")] {
        h.primary.inner().insert(key.clone(), json!({}));
        h.index.inner().insert(key, json!({}));
    }

    let report = h.service.run_consistency_check().await.unwrap();
    assert!(report.is_consistent());
    assert!(report.missing_in_index.is_empty());
    assert!(report.extra_in_index.is_empty());
    assert_eq!(report.primary_count, 3);
}

#[tokio::test]
async fn missing_document_is_repaired() {
    let h = harness(EngineConfig::default());
    h.primary.inner().insert(listing("x"), json!({"title": "lamp"}));

    let report = h.service.run_consistency_check().await.unwrap();
    assert_eq!(report.missing_in_index, vec![listing("x")]);

    let repaired = h.service.repair_inconsistencies().await.unwrap();
    assert_eq!(repaired.repair.upserts_enqueued, 1);
    h.service.worker().process_available().await;

    let report = h.service.run_consistency_check().await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(h.index.inner().get(&listing("x")), Some(json!({"title": "lamp"})));
}

#[tokio::test]
async fn silently_lost_write_is_detected_and_repaired() {
    let h = harness(EngineConfig::default());
    h.service.start().unwrap();
    h.index.set_drop_writes(true);

    let coordinator = h.service.coordinator();
    let txn = coordinator.begin_default();
    coordinator
        .add_operation(txn, Operation::write(listing("L1"), json!({})).indexed())
        .unwrap();
    coordinator.commit(txn).await.unwrap();
    assert!(h.service.wait_for_idle(DRAIN).await);

    let report = h.service.run_consistency_check().await.unwrap();
    assert_eq!(report.missing_in_index, vec![listing("L1")]);

    h.index.set_drop_writes(false);
    h.service.repair_inconsistencies().await.unwrap();
    assert!(h.service.wait_for_idle(DRAIN).await);
    assert!(h.service.run_consistency_check().await.unwrap().is_consistent());

    h.service.shutdown().await;
}

#[tokio::test]
async fn exhausted_task_is_dead_lettered_and_never_retried() {
    let h = harness(EngineConfig::default().with_retry(fast_retry(3)));
    h.index.fail_key(listing("L1"));
    h.service.start().unwrap();

    let coordinator = h.service.coordinator();
    let txn = coordinator.begin_default();
    coordinator
        .add_operation(txn, Operation::write(listing("L1"), json!({})).indexed())
        .unwrap();
    coordinator.commit(txn).await.unwrap();
    assert!(h.service.wait_for_idle(DRAIN).await);

    let dead = h.service.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].key, listing("L1"));
    assert_eq!(dead[0].status, TaskStatus::Dead);
    assert_eq!(h.index.attempts(&listing("L1")), 3);

    let stats = h.service.get_sync_stats();
    assert_eq!(stats.queue.dead_lettered_total, 1);
    assert_eq!(stats.queue.dead_letters, 1);
    assert!(stats.last_error.is_some());
    assert!(!h.service.health_check().await.healthy);

    h.index.heal_key(&listing("L1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.index.attempts(&listing("L1")), 3);

    h.service.shutdown().await;
}

#[tokio::test]
async fn index_outage_recovers_through_retries() {
    let h = harness(EngineConfig::default().with_retry(fast_retry(20)));
    h.index.fail_next(3);
    h.service.start().unwrap();

    let coordinator = h.service.coordinator();
    let txn = coordinator.begin_default();
    coordinator
        .add_operation(txn, Operation::write(listing("L1"), json!({"v": 1})).indexed())
        .unwrap();
    coordinator.commit(txn).await.unwrap();

    assert!(h.service.wait_for_idle(DRAIN).await);
    assert_eq!(h.index.inner().get(&listing("L1")), Some(json!({"v": 1})));
    assert_eq!(h.index.attempts(&listing("L1")), 4);
    assert_eq!(h.service.get_sync_stats().queue.retries_total, 3);
    assert!(h.service.dead_letters().is_empty());

    h.service.shutdown().await;
}

#[tokio::test]
async fn deleted_listing_leaves_index() {
    let h = harness(EngineConfig::default());
    h.primary.inner().insert(listing("L1"), json!({"v": 1}));
    h.index.inner().insert(listing("L1"), json!({"v": 1}));

    let coordinator = h.service.coordinator();
    let txn = coordinator.begin_default();
    coordinator
        .add_operation(
            txn,
            Operation::delete(listing("L1"))
                .compensate_with_restore(json!({"v": 1}))
                .indexed(),
        )
        .unwrap();
    assert!(coordinator.commit(txn).await.unwrap().is_committed());

    h.service.worker().process_available().await;
    assert_eq!(h.primary.inner().get(&listing("L1")), None);
    assert_eq!(h.index.inner().get(&listing("L1")), None);
}

#[tokio::test]
async fn stale_transaction_with_applied_operation_is_compensated() {
    let h = harness(EngineConfig::default());
    let coordinator = h.service.coordinator();

    let txn = coordinator.begin_default();
    let outcome = coordinator
        .execute(
            txn,
            Operation::write(listing("draft"), json!({}))
                .compensate_with_delete()
                .indexed(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, TransactionStatus::Pending);
    assert!(h.primary.inner().get(&listing("draft")).is_some());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let summary = h
        .service
        .cleanup_stale_transactions(Duration::from_millis(10))
        .await;

    assert_eq!(summary.rolled_back, vec![txn]);
    assert_eq!(h.primary.inner().get(&listing("draft")), None);
    assert_eq!(
        coordinator.status(txn).map(|info| info.status),
        Some(TransactionStatus::RolledBack)
    );
    assert_eq!(h.service.queue().size(), 0);
}

#[tokio::test]
async fn full_sync_rebuilds_an_empty_index() {
    let h = harness(EngineConfig::default());
    for n in 0..10 {
        h.primary
            .inner()
            .insert(listing(&format!("L{n}")), json!({"n": n}));
    }

    let summary = h.service.trigger_full_sync().await;
    assert_eq!(summary.enqueued, 10);
    h.service.worker().process_available().await;

    assert_eq!(h.index.inner().len("listing"), 10);
    assert!(h.service.run_consistency_check().await.unwrap().is_consistent());
}

#[tokio::test]
async fn cancelled_repair_stops_early() {
    let h = harness(EngineConfig::default());
    h.primary.inner().insert(listing("x"), json!({}));
    let report = h.service.run_consistency_check().await.unwrap();

    let cancel = Cancellation::new();
    cancel.cancel();
    let summary = h.service.auditor().repair(&report, &cancel).await;
    assert!(summary.cancelled);
    assert_eq!(summary.upserts_enqueued, 0);
}
