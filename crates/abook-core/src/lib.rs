// # abook-core
//
// Core library of the native address book synchronization bridge.
//
// ## Architecture Overview
//
// The bridge keeps an application contact list in step with a platform
// address book that is slow, unreliable and chatty:
// - **NativeStore**: Trait for querying, reading and writing the native store
// - **Coalescer**: Collapses bursts of change notifications per record
// - **IdReconciler**: Maps native records to stable application contact ids
// - **ReconcileEngine**: Order-independent diffing of contact details
// - **SyncController**: Startup full query, one-shot purge, domain writes
// - **ContactCache**: Persisted snapshots used before the store answers
// - **BackendRegistry**: Named factories for backends and caches
//
// ## Design Principles
//
// 1. **Core first**: Backends are plugins; the core depends only on traits
// 2. **Event-driven**: Change notifications arrive as async streams
// 3. **Single owner per table**: The id table, the notification queue and
//    the contact set each belong to exactly one component
// 4. **Idempotent resync**: An unchanged store produces no events

pub mod cache;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod reconcile;
pub mod registry;
pub mod sync;
pub mod traits;

// Re-export core types for convenience
pub use cache::{FileContactCache, MemoryContactCache};
pub use coalescer::{Coalescer, CoalescerStats, NotificationSink, PendingNotification};
pub use config::{BackendConfig, BridgeConfig, CacheConfig, SlotLayout};
pub use error::{Error, Result};
pub use ids::{IdReconciler, Resolution};
pub use model::{
    AppContactId, ChangeKind, Contact, Detail, DetailCategory, DetailKind, NativeChange,
    NativeProperties, NativeRecordId, OverflowDetail, PropertyId, PropertyValue,
};
pub use reconcile::{ReconcileEngine, ReconcileOutcome};
pub use registry::BackendRegistry;
pub use sync::{ControllerState, SyncController, SyncEvent};
pub use traits::{CachedContact, ChangeStream, ContactCache, NativeStore, NativeStoreFactory};
