//! Test doubles and common utilities for contract tests
//!
//! - [`FakeNativeStore`]: in-memory native store with call counters,
//!   failure injection and a broadcast-driven change stream
//! - [`CountingCache`]: memory cache counting saves and removals
//! - [`Running`]: a controller running on a background task

#![allow(dead_code)]

use abook_core::cache::MemoryContactCache;
use abook_core::error::{Error, Result};
use abook_core::model::{
    AppContactId, ChangeKind, NativeChange, NativeProperties, NativeRecordId, PropertyId,
    PropertyValue,
};
use abook_core::sync::{SyncController, SyncEvent};
use abook_core::traits::{CachedContact, ChangeStream, ContactCache, NativeStore};
use abook_core::BridgeConfig;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

/// Quiet period used by contract tests
pub const QUIET_MS: u64 = 50;

/// Configuration with short timers
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::new();
    config.coalescer.quiet_period_ms = QUIET_MS;
    config.sync.drain_poll_ms = 20;
    config
}

/// Native properties of a named record without an embedded id
pub fn named(name: &str) -> NativeProperties {
    NativeProperties::new().with(PropertyId::DisplayName, PropertyValue::text(name))
}

/// Native properties of a named record carrying `id`
pub fn named_with_id(name: &str, id: &AppContactId) -> NativeProperties {
    named(name).with(PropertyId::AppId, PropertyValue::text(id.as_str()))
}

#[derive(Default)]
struct StoreState {
    records: BTreeMap<NativeRecordId, NativeProperties>,
    next_id: usize,
    failing_gets: HashSet<NativeRecordId>,
    refused_properties: HashSet<PropertyId>,
    refuse_create: bool,
    reverse_query: bool,
    written: Vec<(NativeRecordId, PropertyId)>,
}

/// In-memory native store
///
/// Clones share records, counters and the change channel.
#[derive(Clone)]
pub struct FakeNativeStore {
    state: Arc<Mutex<StoreState>>,
    changes: broadcast::Sender<NativeChange>,
    query_calls: Arc<AtomicUsize>,
    get_calls: Arc<AtomicUsize>,
    set_calls: Arc<AtomicUsize>,
    create_calls: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
    compare_calls: Arc<AtomicUsize>,
    shut_down: Arc<AtomicBool>,
}

impl FakeNativeStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            changes,
            query_calls: Arc::new(AtomicUsize::new(0)),
            get_calls: Arc::new(AtomicUsize::new(0)),
            set_calls: Arc::new(AtomicUsize::new(0)),
            create_calls: Arc::new(AtomicUsize::new(0)),
            delete_calls: Arc::new(AtomicUsize::new(0)),
            compare_calls: Arc::new(AtomicUsize::new(0)),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add a record without notifying
    pub fn put(&self, id: &str, props: NativeProperties) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(NativeRecordId::new(id), props);
    }

    /// Remove a record without notifying
    pub fn take(&self, id: &str) -> Option<NativeProperties> {
        self.state.lock().unwrap().records.remove(&NativeRecordId::new(id))
    }

    /// Current properties of a record
    pub fn record(&self, id: &str) -> Option<NativeProperties> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&NativeRecordId::new(id))
            .cloned()
    }

    pub fn record_ids(&self) -> Vec<NativeRecordId> {
        self.state.lock().unwrap().records.keys().cloned().collect()
    }

    /// Deliver a change notification to every watcher
    pub fn notify(&self, id: &str, kind: ChangeKind) {
        let _ = self.changes.send(NativeChange::new(id, kind));
    }

    /// Make `get_properties` fail for a record
    pub fn fail_get(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_gets
            .insert(NativeRecordId::new(id));
    }

    /// Make `set_property` return `false` for a property
    pub fn refuse_property(&self, property: PropertyId) {
        self.state.lock().unwrap().refused_properties.insert(property);
    }

    /// Make `create_record` return `None`
    pub fn refuse_create(&self) {
        self.state.lock().unwrap().refuse_create = true;
    }

    /// Enumerate records in reverse order
    pub fn reverse_query(&self, reverse: bool) {
        self.state.lock().unwrap().reverse_query = reverse;
    }

    /// Properties written, in order
    pub fn written(&self) -> Vec<(NativeRecordId, PropertyId)> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn compare_calls(&self) -> usize {
        self.compare_calls.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NativeStore for FakeNativeStore {
    async fn query(
        &self,
        _filter: &str,
        on_record: &mut (dyn FnMut(NativeRecordId) + Send),
    ) -> Result<usize> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let mut ids = self.record_ids();
        if self.state.lock().unwrap().reverse_query {
            ids.reverse();
        }
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
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.failing_gets.contains(id) {
            return Err(Error::native_store(format!("cannot read {}", id)));
        }
        let record = state
            .records
            .get(id)
            .ok_or_else(|| Error::not_found(format!("record {}", id)))?;
        Ok(properties
            .iter()
            .map(|p| record.get(*p).cloned().unwrap_or_default())
            .collect())
    }

    async fn set_property(
        &self,
        id: &NativeRecordId,
        property: PropertyId,
        value: &PropertyValue,
    ) -> Result<bool> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.refused_properties.contains(&property) {
            return Ok(false);
        }
        let Some(record) = state.records.get_mut(id) else {
            return Ok(false);
        };
        record.set(property, value.clone());
        state.written.push((id.clone(), property));
        Ok(true)
    }

    async fn create_record(&self) -> Result<Option<NativeRecordId>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.refuse_create {
            return Ok(None);
        }
        state.next_id += 1;
        let id = NativeRecordId::new(format!("new{}", state.next_id));
        state.records.insert(id.clone(), NativeProperties::new());
        Ok(Some(id))
    }

    async fn delete_record(&self, id: &NativeRecordId) -> Result<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().records.remove(id).is_some())
    }

    async fn compare_ids(&self, a: &NativeRecordId, b: &NativeRecordId) -> Result<bool> {
        self.compare_calls.fetch_add(1, Ordering::SeqCst);
        Ok(a.as_str().eq_ignore_ascii_case(b.as_str()))
    }

    fn watch(&self) -> ChangeStream {
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(|change| change.ok());
        Box::pin(stream)
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "fake"
    }
}

/// Memory cache that counts writes
#[derive(Clone, Default)]
pub struct CountingCache {
    inner: MemoryContactCache,
    saves: Arc<AtomicUsize>,
    removes: Arc<AtomicUsize>,
    flushes: Arc<AtomicUsize>,
}

impl CountingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contacts(contacts: impl IntoIterator<Item = CachedContact>) -> Self {
        Self {
            inner: MemoryContactCache::with_contacts(contacts),
            ..Self::default()
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContactCache for CountingCache {
    async fn load_all(&self) -> Result<Vec<CachedContact>> {
        self.inner.load_all().await
    }

    async fn get(&self, id: &AppContactId) -> Result<Option<CachedContact>> {
        self.inner.get(id).await
    }

    async fn save(&self, contact: &CachedContact) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(contact).await
    }

    async fn remove(&self, id: &AppContactId) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(id).await
    }

    async fn list_ids(&self) -> Result<Vec<AppContactId>> {
        self.inner.list_ids().await
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush().await
    }
}

/// A controller running on a background task
pub struct Running {
    pub controller: Arc<SyncController>,
    events: mpsc::Receiver<SyncEvent>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl Running {
    pub fn start(store: &FakeNativeStore, cache: &CountingCache) -> Self {
        Self::start_with(store, cache, test_config())
    }

    pub fn start_with(store: &FakeNativeStore, cache: &CountingCache, config: BridgeConfig) -> Self {
        let (controller, events) =
            SyncController::new(Arc::new(store.clone()), Box::new(cache.clone()), &config)
                .expect("controller construction succeeds");
        let controller = Arc::new(controller);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let runner = Arc::clone(&controller);
        let handle = tokio::spawn(async move { runner.run_with_shutdown(shutdown_rx).await });

        Self {
            controller,
            events,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Wait until the one-shot purge has run
    pub async fn wait_steady(&mut self) -> Vec<SyncEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = matches!(event, SyncEvent::ContactsPurged { .. });
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Next event, failing the test after two seconds
    pub async fn next_event(&mut self) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("event arrives in time")
            .expect("event channel open")
    }

    /// Events emitted so far without waiting
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Stop the controller and return the remaining events
    pub async fn stop(mut self) -> Vec<SyncEvent> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        (&mut self.handle)
            .await
            .expect("controller task does not panic")
            .expect("controller stops cleanly");
        self.drain_events()
    }
}

/// Sleep long enough for queued notifications to drain
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(QUIET_MS * 4)).await;
}

/// Count events matching a predicate
pub fn count(events: &[SyncEvent], predicate: impl Fn(&SyncEvent) -> bool) -> usize {
    events.iter().filter(|e| predicate(e)).count()
}
