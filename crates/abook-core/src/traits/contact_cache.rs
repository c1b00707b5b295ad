// # Contact Cache Trait
//
// Defines the interface for persisting the last-seen native property set of
// every contact.
//
// ## Purpose
//
// The cache lets the bridge recreate contacts as `Unresolved` before the
// native store has answered. Contacts that the first full query does not
// confirm are purged afterwards.
//
// ## Implementations
//
// - In-memory: `MemoryContactCache`
// - File-based JSON with backup recovery: `FileContactCache`

use async_trait::async_trait;

use crate::model::{AppContactId, NativeProperties};

/// Cached state of one contact
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CachedContact {
    /// Stable contact id
    pub id: AppContactId,
    /// Domain-side favorite flag
    #[serde(default)]
    pub favorite: bool,
    /// Last seen native property set
    pub persistent_data: NativeProperties,
    /// Time the entry was last written
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

impl CachedContact {
    /// Create a cache entry stamped with the current time
    pub fn new(id: AppContactId, favorite: bool, persistent_data: NativeProperties) -> Self {
        Self {
            id,
            favorite,
            persistent_data,
            last_updated: chrono::Utc::now(),
        }
    }
}

/// Trait for contact cache implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
///
/// # Responsibilities
///
/// The cache stores what it is given. Deciding what changed, and when a
/// cached contact is stale, belongs to the synchronization controller.
#[async_trait]
pub trait ContactCache: Send + Sync {
    /// Load every cached contact
    async fn load_all(&self) -> Result<Vec<CachedContact>, crate::Error>;

    /// Get a single cached contact
    async fn get(&self, id: &AppContactId) -> Result<Option<CachedContact>, crate::Error>;

    /// Create or replace a cached contact
    async fn save(&self, contact: &CachedContact) -> Result<(), crate::Error>;

    /// Remove a cached contact (no error if absent)
    async fn remove(&self, id: &AppContactId) -> Result<(), crate::Error>;

    /// List all cached contact ids
    async fn list_ids(&self) -> Result<Vec<AppContactId>, crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}

/// Helper trait for constructing contact caches from configuration
#[async_trait]
pub trait ContactCacheFactory: Send + Sync {
    /// Create a ContactCache instance from configuration
    ///
    /// # Parameters
    ///
    /// - `config`: Serialized [`crate::config::CacheConfig`]
    async fn create(&self, config: &serde_json::Value)
    -> Result<Box<dyn ContactCache>, crate::Error>;
}
