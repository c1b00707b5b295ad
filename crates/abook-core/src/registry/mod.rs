//! Backend registry
//!
//! Native store backends and contact caches register named factories here;
//! the daemon picks one of each from configuration instead of branching on
//! the platform.
//!
//! ## Registration
//!
//! ```rust,ignore
//! // In abook-backend-rpc
//! pub fn register(registry: &BackendRegistry) {
//!     registry.register_store("rpc", Box::new(RpcNativeStoreFactory));
//! }
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{FileContactCacheFactory, MemoryContactCacheFactory};
use crate::config::{BridgeConfig, CacheConfig};
use crate::error::{Error, Result};
use crate::traits::{ContactCache, ContactCacheFactory, NativeStore, NativeStoreFactory};

/// Registry of native store and contact cache factories
///
/// Interior mutability allows registration through a shared reference.
#[derive(Default)]
pub struct BackendRegistry {
    stores: RwLock<HashMap<String, Arc<dyn NativeStoreFactory>>>,
    caches: RwLock<HashMap<String, Arc<dyn ContactCacheFactory>>>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `memory` and `file` caches
    pub fn with_builtin_caches() -> Self {
        let registry = Self::new();
        registry.register_cache("memory", Box::new(MemoryContactCacheFactory));
        registry.register_cache("file", Box::new(FileContactCacheFactory));
        registry
    }

    /// Register a native store factory
    ///
    /// # Parameters
    ///
    /// - `name`: Backend type name (e.g., "rpc", "local")
    /// - `factory`: Factory object for creating store instances
    pub fn register_store(&self, name: impl Into<String>, factory: Box<dyn NativeStoreFactory>) {
        self.stores.write().insert(name.into(), Arc::from(factory));
    }

    /// Register a contact cache factory
    pub fn register_cache(&self, name: impl Into<String>, factory: Box<dyn ContactCacheFactory>) {
        self.caches.write().insert(name.into(), Arc::from(factory));
    }

    /// Create the native store selected by `config.backend`
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<dyn NativeStore>)`: Created store
    /// - `Err(Error)`: If the backend type is not registered or creation fails
    pub async fn create_store(&self, config: &BridgeConfig) -> Result<Arc<dyn NativeStore>> {
        let backend_type = config.backend.type_name();
        let factory = self
            .stores
            .read()
            .get(backend_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown backend type: {}", backend_type)))?;

        factory.create(config).await
    }

    /// Create the contact cache selected by `config`
    pub async fn create_cache(&self, config: &CacheConfig) -> Result<Box<dyn ContactCache>> {
        let cache_type = config.type_name();
        let factory = self
            .caches
            .read()
            .get(cache_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown cache type: {}", cache_type)))?;

        let config_json = serde_json::to_value(config)?;
        factory.create(&config_json).await
    }

    /// List registered backend types
    pub fn list_stores(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    /// List registered cache types
    pub fn list_caches(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    /// Check if a backend type is registered
    pub fn has_store(&self, name: &str) -> bool {
        self.stores.read().contains_key(name)
    }

    /// Check if a cache type is registered
    pub fn has_cache(&self, name: &str) -> bool {
        self.caches.read().contains_key(name)
    }
}
