//! Fault-injecting store adapters.
//!
//! Both adapters wrap the in-memory adapters from `listsync_core` and can
//! be told to fail, slow down or silently lose work.

use async_trait::async_trait;
use listsync_core::{
    AdapterError, AdapterResult, Document, EntityKey, MemoryPrimaryStore, MemorySearchIndex,
    PrimaryStore, SearchIndex, WriteContext, INDEX, PRIMARY,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A primary store that fails on command and records every call.
#[derive(Debug, Default)]
pub struct FaultyPrimaryStore {
    inner: MemoryPrimaryStore,
    failing_writes: RwLock<HashSet<EntityKey>>,
    failing_deletes: RwLock<HashSet<EntityKey>>,
    failing_types: RwLock<HashSet<String>>,
    fail_reads: AtomicBool,
    fail_listing: AtomicBool,
    latency: RwLock<Duration>,
    calls: Mutex<Vec<String>>,
}

impl FaultyPrimaryStore {
    /// Creates a store with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &MemoryPrimaryStore {
        &self.inner
    }

    /// Makes every write to `key` fail.
    pub fn fail_writes_to(&self, key: EntityKey) {
        self.failing_writes.write().insert(key);
    }

    /// Makes every delete of `key` fail. Compensating deletes included.
    pub fn fail_deletes_of(&self, key: EntityKey) {
        self.failing_deletes.write().insert(key);
    }

    /// Makes every write and delete of one entity type fail.
    pub fn fail_entity_type(&self, entity_type: impl Into<String>) {
        self.failing_types.write().insert(entity_type.into());
    }

    /// Makes reads fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes `list_all_ids` fail.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.failing_writes.write().clear();
        self.failing_deletes.write().clear();
        self.failing_types.write().clear();
        self.fail_reads.store(false, Ordering::SeqCst);
        self.fail_listing.store(false, Ordering::SeqCst);
        *self.latency.write() = Duration::ZERO;
    }

    /// Returns the mutation log, e.g. `["write listing/A", "delete listing/A"]`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn mutation_fails(&self, failing: &RwLock<HashSet<EntityKey>>, key: &EntityKey) -> bool {
        failing.read().contains(key) || self.failing_types.read().contains(&key.entity_type)
    }

    async fn delay(&self) {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl PrimaryStore for FaultyPrimaryStore {
    async fn read(&self, key: &EntityKey) -> AdapterResult<Option<Document>> {
        self.delay().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AdapterError::unavailable(PRIMARY, "injected read failure"));
        }
        self.inner.read(key).await
    }

    async fn write(
        &self,
        key: &EntityKey,
        data: &Document,
        ctx: &WriteContext,
    ) -> AdapterResult<()> {
        self.calls.lock().push(format!("write {key}"));
        self.delay().await;
        if self.mutation_fails(&self.failing_writes, key) {
            return Err(AdapterError::unavailable(
                PRIMARY,
                format!("injected write failure for {key}"),
            ));
        }
        self.inner.write(key, data, ctx).await
    }

    async fn delete(&self, key: &EntityKey, ctx: &WriteContext) -> AdapterResult<()> {
        self.calls.lock().push(format!("delete {key}"));
        self.delay().await;
        if self.mutation_fails(&self.failing_deletes, key) {
            return Err(AdapterError::unavailable(
                PRIMARY,
                format!("injected delete failure for {key}"),
            ));
        }
        self.inner.delete(key, ctx).await
    }

    async fn list_all_ids(&self, entity_type: &str) -> AdapterResult<Vec<String>> {
        self.delay().await;
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(AdapterError::unavailable(PRIMARY, "injected listing failure"));
        }
        self.inner.list_all_ids(entity_type).await
    }
}

/// A search index that fails, stalls or loses writes on command.
#[derive(Debug, Default)]
pub struct FlakySearchIndex {
    inner: MemorySearchIndex,
    fail_next: AtomicUsize,
    failing_keys: RwLock<HashSet<EntityKey>>,
    drop_writes: AtomicBool,
    latency: RwLock<Duration>,
    attempts: Mutex<HashMap<EntityKey, u32>>,
}

impl FlakySearchIndex {
    /// Creates an index with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the wrapped index.
    pub fn inner(&self) -> &MemorySearchIndex {
        &self.inner
    }

    /// Fails the next `count` upserts or deletes.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fails every upsert or delete of `key`.
    pub fn fail_key(&self, key: EntityKey) {
        self.failing_keys.write().insert(key);
    }

    /// Stops failing `key`.
    pub fn heal_key(&self, key: &EntityKey) {
        self.failing_keys.write().remove(key);
    }

    /// Takes the whole index offline, failing every call.
    pub fn set_offline(&self, offline: bool) {
        self.inner.set_available(!offline);
    }

    /// Acknowledges upserts and deletes without applying them.
    pub fn set_drop_writes(&self, drop: bool) {
        self.drop_writes.store(drop, Ordering::SeqCst);
    }

    /// Delays every upsert or delete by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Upsert and delete calls made for `key`, failed ones included.
    pub fn attempts(&self, key: &EntityKey) -> u32 {
        self.attempts.lock().get(key).copied().unwrap_or(0)
    }

    /// Upsert and delete calls made in total.
    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().values().sum()
    }

    /// Records the attempt and decides whether it is applied.
    ///
    /// `Ok(true)` applies, `Ok(false)` drops silently.
    async fn admit(&self, operation: &str, key: &EntityKey) -> AdapterResult<bool> {
        *self.attempts.lock().entry(key.clone()).or_insert(0) += 1;

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let key_fails = self.failing_keys.read().contains(key);
        if injected || key_fails {
            return Err(AdapterError::unavailable(
                INDEX,
                format!("injected {operation} failure for {key}"),
            ));
        }
        Ok(!self.drop_writes.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl SearchIndex for FlakySearchIndex {
    async fn upsert(&self, key: &EntityKey, document: &Document) -> AdapterResult<()> {
        if self.admit("upsert", key).await? {
            self.inner.upsert(key, document).await
        } else {
            Ok(())
        }
    }

    async fn delete(&self, key: &EntityKey) -> AdapterResult<()> {
        if self.admit("delete", key).await? {
            self.inner.delete(key).await
        } else {
            Ok(())
        }
    }

    async fn list_all_ids(&self, entity_type: &str) -> AdapterResult<Vec<String>> {
        self.inner.list_all_ids(entity_type).await
    }

    async fn health_check(&self) -> AdapterResult<()> {
        self.inner.health_check().await
    }
}
