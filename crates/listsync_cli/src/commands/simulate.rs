//! Simulate command implementation.

use listsync_core::{
    Cancellation, CleanupSummary, CoordinatorConfig, EntityKey, IsolationLevel, Operation,
};
use listsync_sync_engine::{
    ConsistencyReport, EngineConfig, RepairSummary, RetryConfig, SyncService, SyncStats,
};
use listsync_testkit::{FaultyPrimaryStore, FlakySearchIndex};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const LISTING: &str = "listing";
const AUDIT_LOG: &str = "audit_log";

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct Options {
    /// Listings to create.
    pub listings: usize,
    /// Every Nth listing reaches the primary store without an index change.
    pub lose_every: usize,
    /// Index writes that fail before the index recovers.
    pub fail_first: usize,
    /// Sync workers.
    pub workers: usize,
    /// Whether to repair the drift found by the first audit.
    pub repair: bool,
    /// How long to wait for the queue to drain.
    pub drain_timeout: Duration,
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulationResult {
    /// Listings requested.
    pub listings: usize,
    /// Transactions committed.
    pub committed: usize,
    /// Transactions rolled back or failed.
    pub rolled_back: usize,
    /// Listings whose index change was lost.
    pub lost_changes: usize,
    /// Whether the queue drained before the audit.
    pub drained: bool,
    /// Staleness sweep result.
    pub cleanup: CleanupSummary,
    /// Audit after the initial drain.
    pub initial_audit: ConsistencyReport,
    /// Repair enqueued for the initial audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairSummary>,
    /// Audit after the repair drained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_audit: Option<ConsistencyReport>,
    /// Pipeline statistics at the end.
    pub stats: SyncStats,
}

impl SimulationResult {
    fn final_report(&self) -> &ConsistencyReport {
        self.final_audit.as_ref().unwrap_or(&self.initial_audit)
    }
}

/// Runs the simulate command.
pub async fn run(options: &Options, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = simulate(options).await?;

    // Output
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    if options.repair && !result.final_report().is_consistent() {
        return Err("index still inconsistent after repair".into());
    }
    Ok(())
}

async fn simulate(options: &Options) -> Result<SimulationResult, Box<dyn std::error::Error>> {
    let primary = Arc::new(FaultyPrimaryStore::new());
    let index = Arc::new(FlakySearchIndex::new());

    let config = EngineConfig::new([LISTING])
        .with_worker_count(options.workers)
        .with_retry(
            RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(200)),
        );
    let service = SyncService::new(
        config,
        CoordinatorConfig::default(),
        primary.clone(),
        index.clone(),
    )?;

    index.fail_next(options.fail_first);
    service.start()?;
    let coordinator = service.coordinator();

    let mut committed = 0;
    let mut rolled_back = 0;
    let mut lost_changes = 0;

    for n in 0..options.listings {
        let key = EntityKey::new(LISTING, format!("L{n:05}"));
        let document = json!({
            "title": format!("Listing {n}"),
            "price": 1_000 + 5 * n as u64,
        });

        if options.lose_every > 0 && n % options.lose_every == options.lose_every - 1 {
            // Written, but the process "crashed" before the change was queued.
            primary.inner().insert(key, document);
            lost_changes += 1;
            continue;
        }

        let txn = coordinator.begin(IsolationLevel::ReadCommitted, metadata("seed"));
        let audit_row = EntityKey::new(AUDIT_LOG, format!("create-{}", key.id));
        coordinator.add_operation(
            txn,
            Operation::write(audit_row, json!({ "action": "create", "listing": key.id }))
                .compensate_with_delete(),
        )?;
        coordinator.add_operation(
            txn,
            Operation::write(key, document)
                .compensate_with_delete()
                .indexed(),
        )?;
        if coordinator.commit(txn).await?.is_committed() {
            committed += 1;
        } else {
            rolled_back += 1;
        }
    }

    // A transaction whose second write is refused rolls back its first.
    let rejected = EntityKey::new(LISTING, "rejected");
    let rejected_row = EntityKey::new(AUDIT_LOG, "create-rejected");
    primary.fail_writes_to(rejected_row.clone());
    let txn = coordinator.begin(IsolationLevel::Serializable, metadata("rejected"));
    coordinator.add_operation(
        txn,
        Operation::write(rejected, json!({ "title": "never visible" }))
            .compensate_with_delete()
            .indexed(),
    )?;
    coordinator.add_operation(
        txn,
        Operation::write(rejected_row, json!({ "action": "create" })).compensate_with_delete(),
    )?;
    if !coordinator.commit(txn).await?.is_committed() {
        rolled_back += 1;
    }

    // A transaction abandoned after applying one write is reclaimed.
    let abandoned = coordinator.begin(IsolationLevel::ReadCommitted, metadata("abandoned"));
    coordinator
        .execute(
            abandoned,
            Operation::write(
                EntityKey::new(LISTING, "abandoned"),
                json!({ "title": "abandoned draft" }),
            )
            .compensate_with_delete()
            .indexed(),
        )
        .await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let cleanup = service
        .cleanup_stale_transactions(Duration::from_millis(1))
        .await;

    let drained = service.wait_for_idle(options.drain_timeout).await;
    let initial_audit = service.run_consistency_check().await?;
    info!(
        missing = initial_audit.missing_in_index.len(),
        extra = initial_audit.extra_in_index.len(),
        "initial audit"
    );

    let (repair, final_audit) = if options.repair {
        let repair = service
            .auditor()
            .repair(&initial_audit, &Cancellation::new())
            .await;
        service.wait_for_idle(options.drain_timeout).await;
        let final_audit = service.run_consistency_check().await?;
        (Some(repair), Some(final_audit))
    } else {
        (None, None)
    };

    let stats = service.get_sync_stats();
    service.shutdown().await;

    Ok(SimulationResult {
        listings: options.listings,
        committed,
        rolled_back,
        lost_changes,
        drained,
        cleanup,
        initial_audit,
        repair,
        final_audit,
        stats,
    })
}

fn metadata(step: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("source".to_string(), "simulate".to_string()),
        ("step".to_string(), step.to_string()),
    ])
}

fn print_text_output(result: &SimulationResult) {
    println!("Simulation");
    println!("==========");
    println!("Listings:           {}", result.listings);
    println!("Committed:          {}", result.committed);
    println!("Rolled back:        {}", result.rolled_back);
    println!("Lost index changes: {}", result.lost_changes);
    println!("Stale reclaimed:    {}", result.cleanup.reclaimed());
    println!("Queue drained:      {}", if result.drained { "yes" } else { "no" });

    println!();
    print_report("Initial audit", &result.initial_audit);

    if let Some(repair) = &result.repair {
        println!();
        println!("Repair:");
        println!("  Upserts enqueued: {}", repair.upserts_enqueued);
        println!("  Deletes enqueued: {}", repair.deletes_enqueued);
        println!("  Unresolved:       {}", repair.unresolved.len());
    }

    if let Some(report) = &result.final_audit {
        println!();
        print_report("Final audit", report);
    }

    let queue = &result.stats.queue;
    println!();
    println!("Queue:");
    println!("  Synced:        {}", queue.synced_total);
    println!("  Coalesced:     {}", queue.coalesced_total);
    println!("  Retries:       {}", queue.retries_total);
    println!("  Dead letters:  {}", queue.dead_letters);
    if let Some(error) = &result.stats.last_error {
        println!("  Last error:    {error}");
    }

    println!();
    if result.final_report().is_consistent() {
        println!("✓ Index consistent with primary store");
    } else {
        println!("✗ Index drifted from primary store");
    }
}

fn print_report(title: &str, report: &ConsistencyReport) {
    println!("{title}:");
    println!("  Primary ids:      {}", report.primary_count);
    println!("  Index ids:        {}", report.index_count);
    println!("  Missing in index: {}", report.missing_in_index.len());
    println!("  Extra in index:   {}", report.extra_in_index.len());
    for failure in &report.errors {
        println!(
            "  Failed:           {} ({}: {})",
            failure.entity_type, failure.adapter, failure.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Options {
        Options {
            listings: 20,
            lose_every: 5,
            fail_first: 2,
            workers: 2,
            repair: true,
            drain_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn simulation_repairs_lost_changes() {
        let result = simulate(&options()).await.unwrap();

        assert_eq!(result.lost_changes, 4);
        assert_eq!(result.committed, 16);
        assert_eq!(result.rolled_back, 1);
        assert_eq!(result.cleanup.reclaimed(), 1);
        assert!(result.drained);
        assert_eq!(result.initial_audit.missing_in_index.len(), 4);
        assert_eq!(result.repair.as_ref().map(|r| r.upserts_enqueued), Some(4));
        assert!(result.final_audit.as_ref().is_some_and(|r| r.is_consistent()));
    }

    #[tokio::test]
    async fn simulation_without_repair_reports_drift() {
        let options = Options {
            repair: false,
            ..options()
        };
        let result = simulate(&options).await.unwrap();

        assert!(!result.initial_audit.is_consistent());
        assert!(result.repair.is_none());
        assert!(result.final_audit.is_none());
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("final_audit").is_none());
    }
}
