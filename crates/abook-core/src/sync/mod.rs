//! Synchronization controller
//!
//! The SyncController keeps the domain contact set in step with one native
//! store:
//! - Recreates cached contacts as `Unresolved` on startup
//! - Runs the initial full query and feeds every record to the coalescer
//! - Resolves, reconciles and caches drained notifications
//! - Purges contacts the full query never confirmed, exactly once
//! - Writes domain edits back to the store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  NativeChange   ┌────────────┐  drained   ┌──────────────┐
//! │ NativeStore │ ──────────────▶ │ Coalescer  │ ─────────▶ │   SyncCore   │
//! └─────────────┘                 └────────────┘            └──────────────┘
//!        ▲                                                         │
//!        │ domain writes                 ┌─────────────┬──────────┼───────────┐
//!        │                               ▼             ▼          ▼           ▼
//!        └──────────────────────── IdReconciler  ReconcileEngine  Cache   SyncEvents
//! ```
//!
//! ## Controller states
//!
//! `Idle → FullQuerying → Draining → Steady`
//!
//! The purge runs only once the full query has returned and the coalescer
//! reports an empty queue with nothing in flight.
//!
//! ## Lock order
//!
//! The write gate is taken before the coalescer's queue lock, never the
//! other way around. Every path that talks to the store on behalf of a
//! contact (resolution, reconciliation, domain writes, the purge) holds the
//! write gate for the whole multi-step operation.

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::coalescer::{Coalescer, NotificationSink};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::ids::{IdReconciler, Resolution};
use crate::model::{
    AppContactId, ChangeKind, Contact, Detail, NativeProperties, NativeRecordId, PropertyId,
    PropertyValue,
};
use crate::reconcile::{ReconcileEngine, ReconcileOutcome, build_properties};
use crate::traits::{CachedContact, ContactCache, NativeStore};

/// Events emitted by the SyncController
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Controller started
    Started {
        backend: String,
        cached_contacts: usize,
    },

    /// The initial full query returned
    FullQueryCompleted { records: usize },

    /// A contact appeared
    ContactCreated {
        id: AppContactId,
        display_name: Option<String>,
    },

    /// A contact's details changed
    ContactUpdated { id: AppContactId },

    /// A contact disappeared
    ContactDeleted { id: AppContactId },

    /// Cached contacts the full query never confirmed were removed
    ContactsPurged { ids: Vec<AppContactId> },

    /// A write to the native store did not go through
    WriteRejected { contact: String, reason: String },

    /// The backend will not come back
    BackendFailed { reason: String },

    /// Controller stopped
    Stopped { reason: String },
}

/// Global controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Not started
    Idle,
    /// The initial full query is running
    FullQuerying,
    /// The full query returned; waiting for the coalescer to settle
    Draining,
    /// Purge done; only incremental notifications are processed
    Steady,
}

/// Shared state reached from both the coalescer worker and domain callers
struct SyncCore {
    store: Arc<dyn NativeStore>,
    cache: Box<dyn ContactCache>,
    ids: IdReconciler,
    engine: ReconcileEngine,
    write_gate: Mutex<()>,
    /// Records deleted through the domain whose native echo is still due
    deleted_here: SyncMutex<HashSet<NativeRecordId>>,
    state: RwLock<ControllerState>,
    drained: Notify,
    purged: AtomicBool,
    shutting_down: AtomicBool,
    backend_failed: AtomicBool,
    event_tx: mpsc::Sender<SyncEvent>,
}

/// Synchronization controller for one native store
///
/// ## Lifecycle
///
/// 1. Create with [`SyncController::new()`] (inside a tokio runtime)
/// 2. Run with [`SyncController::run_with_shutdown()`]
/// 3. Domain edits go through `create_contact`, `update_contact`,
///    `delete_contact` and `set_favorite` while it runs
/// 4. Firing the shutdown channel stops the coalescer, the store and flushes
///    the cache
pub struct SyncController {
    core: Arc<SyncCore>,
    coalescer: Coalescer,
    drain_poll: Duration,
    query_filter: String,
}

impl SyncController {
    /// Create a controller
    ///
    /// # Returns
    ///
    /// A tuple of (controller, event_receiver)
    pub fn new(
        store: Arc<dyn NativeStore>,
        cache: Box<dyn ContactCache>,
        config: &BridgeConfig,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.sync.event_channel_capacity);

        let core = Arc::new(SyncCore {
            store: Arc::clone(&store),
            cache,
            ids: IdReconciler::new(),
            engine: ReconcileEngine::new(config.layout),
            write_gate: Mutex::new(()),
            deleted_here: SyncMutex::new(HashSet::new()),
            state: RwLock::new(ControllerState::Idle),
            drained: Notify::new(),
            purged: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            backend_failed: AtomicBool::new(false),
            event_tx: tx,
        });

        let sink: Arc<dyn NotificationSink> = core.clone();
        let coalescer = Coalescer::new(store, sink, config.coalescer.quiet_period())?;

        let controller = Self {
            core,
            coalescer,
            drain_poll: config.sync.drain_poll(),
            query_filter: config.sync.query_filter.clone(),
        };

        Ok((controller, rx))
    }

    /// Run until `shutdown_rx` fires
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: The contact cache could not be loaded or flushed
    pub async fn run_with_shutdown(&self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        let cached = self.load_cache().await?;
        self.core.emit_event(SyncEvent::Started {
            backend: self.core.store.backend_name().to_string(),
            cached_contacts: cached,
        });

        match self.core.store.default_folder().await {
            Ok(Some(folder)) => info!("Default contacts folder: {}", folder),
            Ok(None) => debug!("Store reports no default contacts folder"),
            Err(e) => warn!("Failed to read default contacts folder: {}", e),
        }

        let mut changes = self.core.store.watch();

        self.core.set_state(ControllerState::FullQuerying);
        let query = self.full_query();
        tokio::pin!(query);
        let mut query_done = false;

        let mut poll = tokio::time::interval(self.drain_poll);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let waiting_for_purge = query_done && !self.core.purged.load(Ordering::SeqCst);

            tokio::select! {
                Some(change) = changes.next() => {
                    self.coalescer.add_notification(change.id, change.kind);
                }

                result = &mut query, if !query_done => {
                    query_done = true;
                    match result {
                        Ok(records) => {
                            info!("Full query returned {} records", records);
                            self.core.set_state(ControllerState::Draining);
                            self.core.emit_event(SyncEvent::FullQueryCompleted { records });
                        }
                        Err(e) => {
                            // Without a complete enumeration nothing can be
                            // declared stale
                            error!("Full query failed, skipping purge: {}", e);
                            self.core.note_failure(&e);
                            self.core.purged.store(true, Ordering::SeqCst);
                            self.core.set_state(ControllerState::Steady);
                        }
                    }
                }

                _ = poll.tick(), if waiting_for_purge => {
                    self.try_purge().await;
                }

                _ = self.core.drained.notified(), if waiting_for_purge => {
                    self.try_purge().await;
                }

                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.stop("Shutdown signal").await
    }

    /// Current controller state
    pub fn state(&self) -> ControllerState {
        *self.core.state.read()
    }

    /// Copy of a contact
    pub fn contact(&self, id: &AppContactId) -> Option<Contact> {
        self.core.engine.contact(id)
    }

    /// Copies of all contacts
    pub fn contacts(&self) -> Vec<Contact> {
        self.core.engine.contacts()
    }

    /// Native records bound to a contact
    pub fn native_ids(&self, id: &AppContactId) -> Vec<NativeRecordId> {
        self.core.ids.native_ids(id)
    }

    /// Contact a native record is bound to
    pub fn lookup(&self, native_id: &NativeRecordId) -> Option<AppContactId> {
        self.core.ids.reverse_lookup(native_id)
    }

    /// The controller's notification coalescer
    pub fn coalescer(&self) -> &Coalescer {
        &self.coalescer
    }

    /// Create a contact in the native store
    ///
    /// The record is created, its app id written first, then the details.
    /// A refused id write deletes the half-created record again.
    ///
    /// # Errors
    ///
    /// - `WriteRejected`: the store refused the record, the id or a property
    /// - `PermanentFailure`: the backend is gone
    pub async fn create_contact(&self, details: Vec<Detail>) -> Result<AppContactId> {
        let core = &self.core;
        core.ensure_writable()?;
        let _gate = core.write_gate.lock().await;

        let native_id = core
            .store
            .create_record()
            .await
            .map_err(|e| core.note_failure_err(e))?
            .ok_or_else(|| core.rejected("new contact", "the store could not create a record"))?;

        let id = AppContactId::mint();
        let id_written = core
            .store
            .set_property(&native_id, PropertyId::AppId, &PropertyValue::text(id.as_str()))
            .await
            .map_err(|e| core.note_failure_err(e))?;
        if !id_written {
            core.discard_record(&native_id).await;
            return Err(core.rejected(id.as_str(), "could not assign a contact id to the new record"));
        }
        core.ids.bind(&id, &native_id);

        core.engine.insert(Contact {
            id: id.clone(),
            details: Vec::new(),
            overflow: Vec::new(),
            resolved: true,
            favorite: false,
            persistent_data: NativeProperties::new()
                .with(PropertyId::AppId, PropertyValue::text(id.as_str())),
        });
        core.engine.apply_edit(&id, details)?;

        let props = core.engine.write_back_properties(&id).unwrap_or_default();
        match core.write_properties(&native_id, &props, &[]).await {
            Ok(true) => {}
            outcome => {
                core.ids.unbind(&id);
                core.engine.remove(&id);
                core.discard_record(&native_id).await;
                return Err(match outcome {
                    Err(e) => core.note_failure_err(e),
                    _ => core.rejected(id.as_str(), "the store refused the contact details"),
                });
            }
        }

        let contact = core.engine.contact(&id);
        if let Some(contact) = &contact {
            core.save_cached(contact).await;
        }

        info!("Created contact {} as record {}", id, native_id);
        core.emit_event(SyncEvent::ContactCreated {
            id: id.clone(),
            display_name: contact.and_then(|c| c.display_name().map(str::to_string)),
        });
        Ok(id)
    }

    /// Replace a contact's details and write them back
    ///
    /// Overflow values are written back verbatim. When the store refuses the
    /// write the local contact is rolled back to its pre-edit state.
    pub async fn update_contact(&self, id: &AppContactId, details: Vec<Detail>) -> Result<()> {
        let core = &self.core;
        core.ensure_writable()?;
        let _gate = core.write_gate.lock().await;

        let native_ids = core.ids.native_ids(id);
        if native_ids.is_empty() {
            return Err(Error::not_found(format!("no native record for contact {}", id)));
        }

        let previous = core.engine.apply_edit(id, details)?;
        let props = core.engine.write_back_properties(id).unwrap_or_default();
        let removed: Vec<PropertyId> = build_properties(core.engine.layout(), &previous)
            .iter()
            .map(|(property, _)| property)
            .filter(|property| props.get(*property).is_none())
            .collect();

        for native_id in &native_ids {
            match core.write_properties(native_id, &props, &removed).await {
                Ok(true) => {}
                Ok(false) => {
                    core.engine.restore(previous);
                    return Err(core.rejected(id.as_str(), "the store refused the contact details"));
                }
                Err(e) => {
                    core.engine.restore(previous);
                    return Err(core.note_failure_err(e));
                }
            }
        }

        if let Some(contact) = core.engine.contact(id) {
            core.save_cached(&contact).await;
        }

        debug!("Updated contact {}", id);
        core.emit_event(SyncEvent::ContactUpdated { id: id.clone() });
        Ok(())
    }

    /// Delete a contact and every native record backing it
    pub async fn delete_contact(&self, id: &AppContactId) -> Result<()> {
        let core = &self.core;
        core.ensure_writable()?;
        let _gate = core.write_gate.lock().await;

        let native_ids = core.ids.native_ids(id);
        if native_ids.is_empty() && core.engine.contact(id).is_none() {
            return Err(Error::not_found(format!("contact {}", id)));
        }

        for native_id in &native_ids {
            let deleted = core
                .store
                .delete_record(native_id)
                .await
                .map_err(|e| core.note_failure_err(e))?;
            if !deleted {
                return Err(core.rejected(id.as_str(), format!("the store refused to delete record {}", native_id)));
            }
            core.ids.unbind_native(native_id);
            core.deleted_here.lock().insert(native_id.clone());
        }

        core.ids.unbind(id);
        core.forget_contact(id).await;
        Ok(())
    }

    /// Set the domain-side favorite flag
    ///
    /// Kept in the local cache only; the native store has no such field.
    pub async fn set_favorite(&self, id: &AppContactId, favorite: bool) -> Result<()> {
        let core = &self.core;
        let _gate = core.write_gate.lock().await;

        let contact = core.engine.set_favorite(id, favorite)?;
        core.save_cached(&contact).await;
        core.emit_event(SyncEvent::ContactUpdated { id: id.clone() });
        Ok(())
    }

    async fn load_cache(&self) -> Result<usize> {
        let cached = self.core.cache.load_all().await?;
        let mut loaded = 0;
        for entry in &cached {
            if self.core.engine.load_cached(entry) {
                loaded += 1;
            }
        }
        info!("Loaded {} contacts from cache", loaded);
        Ok(loaded)
    }

    async fn full_query(&self) -> Result<usize> {
        let coalescer = &self.coalescer;
        let mut on_record = |native_id: NativeRecordId| {
            coalescer.add_notification(native_id, ChangeKind::Inserted);
        };
        self.core.store.query(&self.query_filter, &mut on_record).await
    }

    /// Run the one-shot purge if the coalescer has settled
    ///
    /// Returns `true` once the purge has run.
    async fn try_purge(&self) -> bool {
        let core = &self.core;
        if core.purged.load(Ordering::SeqCst) {
            return true;
        }

        let _gate = core.write_gate.lock().await;
        if !self.coalescer.is_settled() {
            return false;
        }
        if core.purged.swap(true, Ordering::SeqCst) {
            return true;
        }

        let stale = core.engine.unresolved_ids();
        for id in &stale {
            core.ids.unbind(id);
            core.engine.remove(id);
            if let Err(e) = core.cache.remove(id).await {
                warn!("Failed to remove purged contact {} from cache: {}", id, e);
            }
        }

        if stale.is_empty() {
            debug!("No unresolved contacts to purge");
        } else {
            info!("Purged {} contacts not found in the native store", stale.len());
        }
        core.emit_event(SyncEvent::ContactsPurged { ids: stale });
        core.set_state(ControllerState::Steady);
        true
    }

    async fn stop(&self, reason: &str) -> Result<()> {
        self.core.shutting_down.store(true, Ordering::SeqCst);
        self.coalescer.shutdown().await;

        if let Err(e) = self.core.store.shutdown().await {
            warn!("Native store did not shut down cleanly: {}", e);
        }

        self.core.emit_event(SyncEvent::Stopped {
            reason: reason.to_string(),
        });

        self.core.cache.flush().await?;
        info!("Contact cache flushed, controller stopped");
        Ok(())
    }
}

impl SyncCore {
    fn set_state(&self, state: ControllerState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Controller state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        if self.backend_failed.load(Ordering::SeqCst) {
            return Err(Error::permanent("backend is no longer available"));
        }
        Ok(())
    }

    /// Record a permanent backend failure, once
    fn note_failure(&self, e: &Error) {
        if matches!(e, Error::PermanentFailure(_)) && !self.backend_failed.swap(true, Ordering::SeqCst) {
            error!("Backend permanently failed: {}", e);
            self.emit_event(SyncEvent::BackendFailed {
                reason: e.to_string(),
            });
        }
    }

    fn note_failure_err(&self, e: Error) -> Error {
        self.note_failure(&e);
        e
    }

    fn rejected(&self, contact: &str, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        warn!("Write rejected for {}: {}", contact, reason);
        self.emit_event(SyncEvent::WriteRejected {
            contact: contact.to_string(),
            reason: reason.clone(),
        });
        Error::write_rejected(contact, reason)
    }

    /// Write every non-id property of a record
    ///
    /// Properties in `removed` are written as empty so that details the
    /// user deleted disappear from the record too. Everything else absent
    /// from `props` is left untouched.
    async fn write_properties(
        &self,
        native_id: &NativeRecordId,
        props: &NativeProperties,
        removed: &[PropertyId],
    ) -> Result<bool> {
        for property in PropertyId::ALL {
            if property == PropertyId::AppId {
                continue;
            }
            let value = match props.get(property) {
                Some(value) => value.clone(),
                None if removed.contains(&property) => PropertyValue::Empty,
                None => continue,
            };
            if !self.store.set_property(native_id, property, &value).await? {
                debug!("Store refused {} on record {}", property.wire_name(), native_id);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn discard_record(&self, native_id: &NativeRecordId) {
        match self.store.delete_record(native_id).await {
            Ok(true) => debug!("Discarded half-created record {}", native_id),
            Ok(false) => warn!("Store refused to discard half-created record {}", native_id),
            Err(e) => warn!("Failed to discard half-created record {}: {}", native_id, e),
        }
    }

    async fn save_cached(&self, contact: &Contact) {
        let entry = CachedContact::new(
            contact.id.clone(),
            contact.favorite,
            contact.persistent_data.clone(),
        );
        if let Err(e) = self.cache.save(&entry).await {
            warn!("Failed to cache contact {}: {}", contact.id, e);
        }
    }

    async fn forget_contact(&self, id: &AppContactId) {
        if self.engine.remove(id).is_none() {
            return;
        }
        if let Err(e) = self.cache.remove(id).await {
            warn!("Failed to remove contact {} from cache: {}", id, e);
        }
        info!("Deleted contact {}", id);
        self.emit_event(SyncEvent::ContactDeleted { id: id.clone() });
    }

    async fn handle_properties(&self, native_id: &NativeRecordId, mut props: NativeProperties) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(());
        }

        let resolution = self.ids.resolve(self.store.as_ref(), native_id, &props).await?;
        if let Resolution::Assigned(id) = &resolution {
            props.set(PropertyId::AppId, PropertyValue::text(id.as_str()));
        }
        let id = resolution.into_id();

        match self.engine.reconcile(&id, &props) {
            ReconcileOutcome::Created => {
                let contact = self.engine.contact(&id);
                if let Some(contact) = &contact {
                    self.save_cached(contact).await;
                }
                info!("New contact {} from record {}", id, native_id);
                self.emit_event(SyncEvent::ContactCreated {
                    id,
                    display_name: contact.and_then(|c| c.display_name().map(str::to_string)),
                });
            }
            ReconcileOutcome::Updated => {
                if let Some(contact) = self.engine.contact(&id) {
                    self.save_cached(&contact).await;
                }
                debug!("Contact {} updated from record {}", id, native_id);
                self.emit_event(SyncEvent::ContactUpdated { id });
            }
            ReconcileOutcome::Unchanged => {}
        }
        Ok(())
    }

    async fn handle_deleted(&self, native_id: &NativeRecordId) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(());
        }

        let unbound = match self.ids.unbind_native(native_id) {
            Some(unbound) => Some(unbound),
            None => {
                let echoed = self.deleted_here.lock().remove(native_id);
                if echoed {
                    debug!("Record {} deletion echoed by the store", native_id);
                    return Ok(());
                }
                match self.find_equivalent(native_id).await? {
                    Some(bound) => self.ids.unbind_native(&bound),
                    None => None,
                }
            }
        };

        match unbound {
            Some((id, true)) => self.forget_contact(&id).await,
            Some((id, false)) => {
                debug!("Record {} removed, contact {} still has other records", native_id, id)
            }
            None => debug!("Deletion of unknown record {}, ignoring", native_id),
        }
        Ok(())
    }

    /// Find a bound record naming the same native entry as `native_id`
    async fn find_equivalent(&self, native_id: &NativeRecordId) -> Result<Option<NativeRecordId>> {
        for (bound, _) in self.ids.bindings() {
            if self.store.compare_ids(&bound, native_id).await? {
                return Ok(Some(bound));
            }
        }
        Ok(None)
    }

    fn report(&self, native_id: &NativeRecordId, e: Error) {
        self.note_failure(&e);
        match &e {
            Error::WriteRejected { contact, reason } => {
                warn!("Record {} left unresolved: {}", native_id, e);
                self.emit_event(SyncEvent::WriteRejected {
                    contact: contact.clone(),
                    reason: reason.clone(),
                });
            }
            _ => warn!("Failed to process record {}: {}", native_id, e),
        }
    }

    /// Emit a sync event, dropping it when the channel is full
    fn emit_event(&self, event: SyncEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Sync event channel full or closed, dropping event");
        }
    }
}

#[async_trait]
impl NotificationSink for SyncCore {
    async fn apply_deleted(&self, native_id: &NativeRecordId) {
        if let Err(e) = self.handle_deleted(native_id).await {
            self.report(native_id, e);
        }
    }

    async fn apply_properties(&self, native_id: &NativeRecordId, kind: ChangeKind, props: NativeProperties) {
        debug!("Applying {:?} for record {}", kind, native_id);
        if let Err(e) = self.handle_properties(native_id, props).await {
            self.report(native_id, e);
        }
    }

    async fn queue_drained(&self) {
        self.drained.notify_one();
    }
}
