//! In-memory adapters for tests and simulation.

use super::{PrimaryStore, SearchIndex, WriteContext, INDEX};
use crate::error::{AdapterError, AdapterResult};
use crate::types::{Document, EntityKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

type Collections = BTreeMap<String, BTreeMap<String, Document>>;

fn ids_of(collections: &Collections, entity_type: &str) -> Vec<String> {
    collections
        .get(entity_type)
        .map(|docs| docs.keys().cloned().collect())
        .unwrap_or_default()
}

/// An in-memory primary store.
///
/// # Example
///
/// ```rust
/// use listsync_core::{EntityKey, MemoryPrimaryStore};
/// use serde_json::json;
///
/// let store = MemoryPrimaryStore::new();
/// store.insert(EntityKey::new("listing", "L1"), json!({"title": "Bike"}));
/// assert_eq!(store.len("listing"), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryPrimaryStore {
    data: RwLock<Collections>,
    writes: RwLock<Vec<WriteContext>>,
}

impl MemoryPrimaryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a document directly, bypassing transactions.
    pub fn insert(&self, key: EntityKey, data: Document) {
        self.data
            .write()
            .entry(key.entity_type)
            .or_default()
            .insert(key.id, data);
    }

    /// Removes a document directly.
    pub fn remove(&self, key: &EntityKey) -> Option<Document> {
        self.data
            .write()
            .get_mut(&key.entity_type)
            .and_then(|docs| docs.remove(&key.id))
    }

    /// Returns a copy of one document.
    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<Document> {
        self.data
            .read()
            .get(&key.entity_type)
            .and_then(|docs| docs.get(&key.id))
            .cloned()
    }

    /// Returns the number of documents of one entity type.
    #[must_use]
    pub fn len(&self, entity_type: &str) -> usize {
        self.data.read().get(entity_type).map_or(0, BTreeMap::len)
    }

    /// Returns the write contexts seen so far, in call order.
    #[must_use]
    pub fn write_contexts(&self) -> Vec<WriteContext> {
        self.writes.read().clone()
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn read(&self, key: &EntityKey) -> AdapterResult<Option<Document>> {
        Ok(self.get(key))
    }

    async fn write(
        &self,
        key: &EntityKey,
        data: &Document,
        ctx: &WriteContext,
    ) -> AdapterResult<()> {
        self.writes.write().push(*ctx);
        self.insert(key.clone(), data.clone());
        Ok(())
    }

    async fn delete(&self, key: &EntityKey, ctx: &WriteContext) -> AdapterResult<()> {
        self.writes.write().push(*ctx);
        self.remove(key);
        Ok(())
    }

    async fn list_all_ids(&self, entity_type: &str) -> AdapterResult<Vec<String>> {
        Ok(ids_of(&self.data.read(), entity_type))
    }
}

/// An in-memory search index.
///
/// Can be switched offline to simulate an outage.
#[derive(Debug)]
pub struct MemorySearchIndex {
    docs: RwLock<Collections>,
    available: AtomicBool,
}

impl Default for MemorySearchIndex {
    fn default() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemorySearchIndex {
    /// Creates an empty, available index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles availability. While unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Inserts a document directly.
    pub fn insert(&self, key: EntityKey, document: Document) {
        self.docs
            .write()
            .entry(key.entity_type)
            .or_default()
            .insert(key.id, document);
    }

    /// Removes a document directly.
    pub fn remove(&self, key: &EntityKey) -> Option<Document> {
        self.docs
            .write()
            .get_mut(&key.entity_type)
            .and_then(|docs| docs.remove(&key.id))
    }

    /// Returns a copy of one indexed document.
    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<Document> {
        self.docs
            .read()
            .get(&key.entity_type)
            .and_then(|docs| docs.get(&key.id))
            .cloned()
    }

    /// Returns the number of indexed documents of one entity type.
    #[must_use]
    pub fn len(&self, entity_type: &str) -> usize {
        self.docs.read().get(entity_type).map_or(0, BTreeMap::len)
    }

    fn ensure_available(&self) -> AdapterResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::unavailable(INDEX, "index offline"))
        }
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn upsert(&self, key: &EntityKey, document: &Document) -> AdapterResult<()> {
        self.ensure_available()?;
        self.insert(key.clone(), document.clone());
        Ok(())
    }

    async fn delete(&self, key: &EntityKey) -> AdapterResult<()> {
        self.ensure_available()?;
        self.remove(key);
        Ok(())
    }

    async fn list_all_ids(&self, entity_type: &str) -> AdapterResult<Vec<String>> {
        self.ensure_available()?;
        Ok(ids_of(&self.docs.read(), entity_type))
    }

    async fn health_check(&self) -> AdapterResult<()> {
        self.ensure_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn primary_write_read_delete() {
        let store = MemoryPrimaryStore::new();
        let key = EntityKey::new("listing", "L1");
        let ctx = WriteContext::standalone();

        store.write(&key, &json!({"price": 10}), &ctx).await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), Some(json!({"price": 10})));
        assert_eq!(store.list_all_ids("listing").await.unwrap(), vec!["L1"]);

        store.delete(&key, &ctx).await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), None);
        assert_eq!(store.write_contexts().len(), 2);
    }

    #[tokio::test]
    async fn index_outage() {
        let index = MemorySearchIndex::new();
        let key = EntityKey::new("listing", "L1");

        index.set_available(false);
        assert!(index.upsert(&key, &json!({})).await.is_err());
        assert!(index.health_check().await.is_err());

        index.set_available(true);
        index.upsert(&key, &json!({})).await.unwrap();
        assert_eq!(index.len("listing"), 1);
        assert!(index.list_all_ids("other").await.unwrap().is_empty());
    }
}
