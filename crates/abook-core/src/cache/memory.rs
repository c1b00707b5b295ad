// # Memory Contact Cache
//
// In-memory implementation of ContactCache.
//
// ## Purpose
//
// Provides a cache that doesn't persist across restarts. Every start then
// begins with an empty contact set and waits for the full query.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use async_trait::async_trait;

use crate::model::AppContactId;
use crate::traits::contact_cache::{CachedContact, ContactCache, ContactCacheFactory};
use crate::Error;

/// In-memory contact cache
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryContactCache {
    inner: Arc<RwLock<HashMap<AppContactId, CachedContact>>>,
}

impl MemoryContactCache {
    /// Create a new empty memory cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache pre-populated with entries
    pub fn with_contacts(contacts: impl IntoIterator<Item = CachedContact>) -> Self {
        let map = contacts.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Get the number of cached contacts
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Check if the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl ContactCache for MemoryContactCache {
    async fn load_all(&self) -> Result<Vec<CachedContact>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.values().cloned().collect())
    }

    async fn get(&self, id: &AppContactId) -> Result<Option<CachedContact>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn save(&self, contact: &CachedContact) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.insert(contact.id.clone(), contact.clone());
        Ok(())
    }

    async fn remove(&self, id: &AppContactId) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.remove(id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<AppContactId>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.keys().cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        // Nothing buffered
        Ok(())
    }
}

/// Factory for [`MemoryContactCache`]
pub struct MemoryContactCacheFactory;

#[async_trait]
impl ContactCacheFactory for MemoryContactCacheFactory {
    async fn create(&self, _config: &serde_json::Value) -> Result<Box<dyn ContactCache>, Error> {
        Ok(Box::new(MemoryContactCache::new()))
    }
}
