// # Local Native Store Backend
//
// This crate adapts an in-process, synchronous address book API to the
// async `NativeStore` trait.
//
// ## Threading
//
// Native calls block, so every call runs on tokio's blocking pool. Change
// callbacks may fire on any thread; they are forwarded into a broadcast
// channel that backs `NativeStore::watch`.
//
// ## Usage
//
// ```rust,ignore
// let registry = BackendRegistry::with_builtin_caches();
// abook_backend_local::register(&registry, Arc::new(InMemoryAddressBook::new()));
// ```

mod memory;

pub use memory::InMemoryAddressBook;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use abook_core::config::{BackendConfig, BridgeConfig};
use abook_core::model::{ChangeKind, NativeChange, NativeRecordId, PropertyId, PropertyValue};
use abook_core::traits::{ChangeStream, NativeStore, NativeStoreFactory};
use abook_core::{BackendRegistry, Error, Result};

/// Callbacks a native address book fires when records change
pub trait ChangeObserver: Send + Sync {
    /// A record was created
    fn inserted(&self, id: &str);
    /// A record was modified
    fn updated(&self, id: &str);
    /// A record was removed
    fn deleted(&self, id: &str);
}

/// Synchronous, callback-based native address book
///
/// Calls may block and may be made from any thread.
pub trait NativeAddressBook: Send + Sync {
    /// Report every record matching `filter`, then return
    fn enumerate(&self, filter: &str, on_record: &mut dyn FnMut(&str)) -> Result<()>;

    /// Read `properties` of a record, aligned with the request
    fn read(&self, id: &str, properties: &[PropertyId]) -> Result<Vec<PropertyValue>>;

    /// Write one property; `false` when the book refuses
    fn write(&self, id: &str, property: PropertyId, value: &PropertyValue) -> bool;

    /// Create an empty record
    fn create(&self) -> Option<String>;

    /// Delete a record
    fn remove(&self, id: &str) -> bool;

    /// Register for change callbacks
    fn observe(&self, observer: Arc<dyn ChangeObserver>);

    /// Whether two handles name the same record
    fn same_record(&self, a: &str, b: &str) -> bool {
        a == b
    }

    /// Default contacts folder, if the book has folders
    fn default_folder(&self) -> Option<String> {
        None
    }
}

/// Forwards callbacks into the change channel
struct BroadcastObserver {
    changes: broadcast::Sender<NativeChange>,
    closed: Arc<AtomicBool>,
}

impl BroadcastObserver {
    fn forward(&self, id: &str, kind: ChangeKind) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        debug!("Native change {:?} for {}", kind, id);
        let _ = self.changes.send(NativeChange::new(id, kind));
    }
}

impl ChangeObserver for BroadcastObserver {
    fn inserted(&self, id: &str) {
        self.forward(id, ChangeKind::Inserted);
    }

    fn updated(&self, id: &str) {
        self.forward(id, ChangeKind::Updated);
    }

    fn deleted(&self, id: &str) {
        self.forward(id, ChangeKind::Deleted);
    }
}

/// [`NativeStore`] over an in-process [`NativeAddressBook`]
pub struct LocalNativeStore {
    book: Arc<dyn NativeAddressBook>,
    changes: broadcast::Sender<NativeChange>,
    closed: Arc<AtomicBool>,
}

impl LocalNativeStore {
    /// Wrap `book`; `capacity` bounds the change backlog of slow watchers
    pub fn new(book: Arc<dyn NativeAddressBook>, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        book.observe(Arc::new(BroadcastObserver {
            changes: changes.clone(),
            closed: Arc::clone(&closed),
        }));
        Self {
            book,
            changes,
            closed,
        }
    }

    /// Run a native call on the blocking pool
    async fn call<T, F>(&self, name: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn NativeAddressBook) -> Result<T> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let book = Arc::clone(&self.book);
        tokio::task::spawn_blocking(move || f(book.as_ref()))
            .await
            .map_err(|e| Error::native_store(format!("{} did not complete: {}", name, e)))?
    }
}

#[async_trait]
impl NativeStore for LocalNativeStore {
    async fn query(
        &self,
        filter: &str,
        on_record: &mut (dyn FnMut(NativeRecordId) + Send),
    ) -> Result<usize> {
        let filter = filter.to_string();
        let ids = self
            .call("enumerate", move |book| {
                let mut ids = Vec::new();
                book.enumerate(&filter, &mut |id| ids.push(NativeRecordId::new(id)))?;
                Ok(ids)
            })
            .await?;

        let count = ids.len();
        for id in ids {
            on_record(id);
        }
        Ok(count)
    }

    async fn get_properties(
        &self,
        id: &NativeRecordId,
        properties: &[PropertyId],
    ) -> Result<Vec<PropertyValue>> {
        let id = id.clone();
        let properties = properties.to_vec();
        self.call("read", move |book| book.read(id.as_str(), &properties))
            .await
    }

    async fn set_property(
        &self,
        id: &NativeRecordId,
        property: PropertyId,
        value: &PropertyValue,
    ) -> Result<bool> {
        let record = id.clone();
        let value = value.clone();
        let written = self
            .call("write", move |book| {
                Ok(book.write(record.as_str(), property, &value))
            })
            .await?;
        if !written {
            warn!("Address book refused {:?} for {}", property, id);
        }
        Ok(written)
    }

    async fn create_record(&self) -> Result<Option<NativeRecordId>> {
        self.call("create", |book| Ok(book.create().map(NativeRecordId::new)))
            .await
    }

    async fn delete_record(&self, id: &NativeRecordId) -> Result<bool> {
        let id = id.clone();
        self.call("remove", move |book| Ok(book.remove(id.as_str())))
            .await
    }

    fn watch(&self) -> ChangeStream {
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(|change| match change {
            Ok(change) => Some(change),
            Err(e) => {
                warn!("Change stream lagged: {}", e);
                None
            }
        });
        Box::pin(stream)
    }

    async fn compare_ids(&self, a: &NativeRecordId, b: &NativeRecordId) -> Result<bool> {
        let (a, b) = (a.clone(), b.clone());
        self.call("same_record", move |book| Ok(book.same_record(a.as_str(), b.as_str())))
            .await
    }

    async fn default_folder(&self) -> Result<Option<String>> {
        self.call("default_folder", |book| Ok(book.default_folder()))
            .await
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("Local backend closed");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

/// Factory for [`LocalNativeStore`] over a given address book
pub struct LocalNativeStoreFactory {
    book: Arc<dyn NativeAddressBook>,
}

impl LocalNativeStoreFactory {
    /// Create a factory serving `book`
    pub fn new(book: Arc<dyn NativeAddressBook>) -> Self {
        Self { book }
    }
}

#[async_trait]
impl NativeStoreFactory for LocalNativeStoreFactory {
    async fn create(&self, config: &BridgeConfig) -> Result<Arc<dyn NativeStore>> {
        match &config.backend {
            BackendConfig::Local => Ok(Arc::new(LocalNativeStore::new(
                Arc::clone(&self.book),
                config.sync.event_channel_capacity,
            ))),
            other => Err(Error::config(format!(
                "Local factory cannot build a '{}' backend",
                other.type_name()
            ))),
        }
    }
}

/// Register the local backend under `local`, serving `book`
pub fn register(registry: &BackendRegistry, book: Arc<dyn NativeAddressBook>) {
    registry.register_store("local", Box::new(LocalNativeStoreFactory::new(book)));
}
