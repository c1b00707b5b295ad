// # File Contact Cache
//
// File-based implementation of ContactCache with crash recovery.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of the previous cache file
// - Recovery: Falls back to backup if corruption detected
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "contacts": [
//     {
//       "id": "5b0e9f6c-3c1f-4d8e-9d55-0d1f3e6f2a11",
//       "favorite": false,
//       "persistent_data": [
//         { "property": "display_name", "value": "Alice" },
//         { "property": "emails", "value": ["alice@example.com", "a@work.example"] }
//       ],
//       "last_updated": "2025-01-09T12:00:00Z"
//     }
//   ]
// }
// ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::CacheConfig;
use crate::model::AppContactId;
use crate::traits::contact_cache::{CachedContact, ContactCache, ContactCacheFactory};

/// Cache file format version
const CACHE_FILE_VERSION: &str = "1.0";

/// File-based contact cache with crash recovery
///
/// Every mutation is written through immediately; `flush()` only writes when
/// an earlier write failed and left the cache dirty.
#[derive(Debug)]
pub struct FileContactCache {
    path: PathBuf,
    state: Arc<RwLock<CacheState>>,
}

#[derive(Debug)]
struct CacheState {
    contacts: BTreeMap<AppContactId, CachedContact>,
    dirty: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CacheFileFormat {
    version: String,
    contacts: Vec<CachedContact>,
}

impl FileContactCache {
    /// Create or load a file contact cache
    ///
    /// Creates parent directories when needed. A corrupt file is replaced by
    /// its backup; if both are unreadable the cache starts empty.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let contacts = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(CacheState {
                contacts,
                dirty: false,
            })),
        })
    }

    async fn load_with_recovery(
        path: &Path,
    ) -> Result<BTreeMap<AppContactId, CachedContact>, Error> {
        match Self::load(path).await {
            Ok(contacts) => {
                tracing::debug!("Loaded contact cache: {} contacts", contacts.len());
                Ok(contacts)
            }
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Contact cache appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No cache backup found. Starting with empty cache.");
                    return Ok(BTreeMap::new());
                }

                match Self::load(&backup_path).await {
                    Ok(contacts) => {
                        tracing::info!("Recovered contact cache from backup: {} contacts", contacts.len());
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!(
                                "Failed to restore cache file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(contacts)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Cache backup also unreadable: {}. Starting with empty cache.",
                            backup_err
                        );
                        Ok(BTreeMap::new())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load(path: &Path) -> Result<BTreeMap<AppContactId, CachedContact>, Error> {
        if !path.exists() {
            tracing::debug!("Contact cache does not exist yet: {}", path.display());
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::contact_cache(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let file: CacheFileFormat = serde_json::from_str(&content)?;

        if file.version != CACHE_FILE_VERSION {
            tracing::warn!(
                "Contact cache version mismatch: expected {}, got {}. Attempting to load anyway.",
                CACHE_FILE_VERSION,
                file.version
            );
        }

        Ok(file
            .contacts
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect())
    }

    /// Write the cache atomically, keeping the previous file as backup
    async fn write(&self) -> Result<(), Error> {
        let json = {
            let guard = self.state.read().await;
            let file = CacheFileFormat {
                version: CACHE_FILE_VERSION.to_string(),
                contacts: guard.contacts.values().cloned().collect(),
            };
            serde_json::to_string_pretty(&file)?
        };

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::contact_cache(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await?;
            file.flush().await?;
        }

        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await
        {
            tracing::warn!("Failed to back up contact cache: {}", e);
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::contact_cache(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        self.state.write().await.dirty = false;
        tracing::trace!("Contact cache written: {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl ContactCache for FileContactCache {
    async fn load_all(&self) -> Result<Vec<CachedContact>, Error> {
        let guard = self.state.read().await;
        Ok(guard.contacts.values().cloned().collect())
    }

    async fn get(&self, id: &AppContactId) -> Result<Option<CachedContact>, Error> {
        let guard = self.state.read().await;
        Ok(guard.contacts.get(id).cloned())
    }

    async fn save(&self, contact: &CachedContact) -> Result<(), Error> {
        {
            let mut guard = self.state.write().await;
            guard.contacts.insert(contact.id.clone(), contact.clone());
            guard.dirty = true;
        }
        self.write().await
    }

    async fn remove(&self, id: &AppContactId) -> Result<(), Error> {
        {
            let mut guard = self.state.write().await;
            if guard.contacts.remove(id).is_none() {
                return Ok(());
            }
            guard.dirty = true;
        }
        self.write().await
    }

    async fn list_ids(&self) -> Result<Vec<AppContactId>, Error> {
        let guard = self.state.read().await;
        Ok(guard.contacts.keys().cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        let dirty = self.state.read().await.dirty;
        if dirty { self.write().await } else { Ok(()) }
    }
}

/// Factory for [`FileContactCache`]
pub struct FileContactCacheFactory;

#[async_trait]
impl ContactCacheFactory for FileContactCacheFactory {
    async fn create(&self, config: &serde_json::Value) -> Result<Box<dyn ContactCache>, Error> {
        match serde_json::from_value::<CacheConfig>(config.clone())? {
            CacheConfig::File { path } => Ok(Box::new(FileContactCache::new(path).await?)),
            other => Err(Error::config(format!(
                "File cache factory cannot build a '{}' cache",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NativeProperties, PropertyId, PropertyValue};
    use tempfile::tempdir;

    fn entry(name: &str) -> CachedContact {
        CachedContact::new(
            AppContactId::mint(),
            false,
            NativeProperties::new()
                .with(PropertyId::DisplayName, PropertyValue::text(name))
                .with(
                    PropertyId::Emails,
                    PropertyValue::list([format!("{}@example.com", name.to_lowercase())]),
                ),
        )
    }

    #[tokio::test]
    async fn test_file_cache_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contacts.json");

        let cache = FileContactCache::new(&path).await.unwrap();
        assert!(cache.load_all().await.unwrap().is_empty());

        let alice = entry("Alice");
        cache.save(&alice).await.unwrap();
        assert!(path.exists());

        let reopened = FileContactCache::new(&path).await.unwrap();
        assert_eq!(reopened.get(&alice.id).await.unwrap(), Some(alice));
    }

    #[tokio::test]
    async fn test_file_cache_corruption_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contacts.json");

        let cache = FileContactCache::new(&path).await.unwrap();
        let alice = entry("Alice");
        let bob = entry("Bob");
        cache.save(&alice).await.unwrap();
        // Second write leaves the first state in the backup
        cache.save(&bob).await.unwrap();
        assert!(FileContactCache::backup_path(&path).exists());

        fs::write(&path, b"{ not json").await.unwrap();

        let recovered = FileContactCache::new(&path).await.unwrap();
        let ids = recovered.list_ids().await.unwrap();
        assert_eq!(ids, vec![alice.id.clone()]);
    }

    #[tokio::test]
    async fn test_factory_rejects_other_cache_types() {
        let config = serde_json::to_value(CacheConfig::Memory).unwrap();
        assert!(FileContactCacheFactory.create(&config).await.is_err());
    }
}
