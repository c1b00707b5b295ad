// # Native Store Trait
//
// Defines the interface to the platform-owned address book.
//
// ## Implementations
//
// - Process-isolated backend over RPC: `abook-backend-rpc` crate
// - In-process native address book: `abook-backend-local` crate
//
// ## Usage
//
// ```rust,ignore
// use abook_core::NativeStore;
// use abook_core::model::PropertyId;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let store = /* NativeStore implementation */;
//
//     let mut ids = Vec::new();
//     store.query("", &mut |id| ids.push(id)).await?;
//
//     for id in &ids {
//         let values = store.get_properties(id, &PropertyId::ALL).await?;
//         println!("{}: {:?}", id, values);
//     }
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

use crate::model::{NativeChange, NativeRecordId, PropertyId, PropertyValue};

/// Stream of raw change notifications
pub type ChangeStream = Pin<Box<dyn Stream<Item = NativeChange> + Send + 'static>>;

/// Trait for native store adapters
///
/// The store is assumed opaque and unreliable: every call may fail, and
/// change notifications may be duplicated, bursty and out of order.
///
/// # Responsibilities
///
/// Adapters execute single operations against the store and report the
/// outcome. Coalescing, id reconciliation and diffing are owned by the
/// synchronization controller; retries after a backend crash are owned by
/// the RPC transport.
///
/// # Thread Safety
///
/// Implementations must be usable from several tasks at once.
#[async_trait]
pub trait NativeStore: Send + Sync {
    /// Enumerate records matching `filter`
    ///
    /// `on_record` is invoked once per matching record; returning from this
    /// method signals completion of the enumeration.
    ///
    /// # Returns
    ///
    /// - `Ok(usize)`: Number of records reported
    /// - `Err(Error)`: Enumeration failed
    async fn query(
        &self,
        filter: &str,
        on_record: &mut (dyn FnMut(NativeRecordId) + Send),
    ) -> Result<usize, crate::Error>;

    /// Fetch the current values of `properties` for a record
    ///
    /// The returned vector is aligned with `properties`; unset properties
    /// come back as [`PropertyValue::Empty`].
    async fn get_properties(
        &self,
        id: &NativeRecordId,
        properties: &[PropertyId],
    ) -> Result<Vec<PropertyValue>, crate::Error>;

    /// Write a single property
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: Written
    /// - `Ok(false)`: The store refused the write
    /// - `Err(Error)`: The call itself failed
    async fn set_property(
        &self,
        id: &NativeRecordId,
        property: PropertyId,
        value: &PropertyValue,
    ) -> Result<bool, crate::Error>;

    /// Create an empty record
    ///
    /// Returns `Ok(None)` when the store could not create one.
    async fn create_record(&self) -> Result<Option<NativeRecordId>, crate::Error>;

    /// Delete a record
    async fn delete_record(&self, id: &NativeRecordId) -> Result<bool, crate::Error>;

    /// Watch for raw change notifications
    ///
    /// May be called more than once; every stream sees every change
    /// delivered after it was created.
    fn watch(&self) -> ChangeStream;

    /// Whether two handles name the same record
    ///
    /// Some stores hand out several encodings of the same handle.
    async fn compare_ids(
        &self,
        a: &NativeRecordId,
        b: &NativeRecordId,
    ) -> Result<bool, crate::Error> {
        Ok(a == b)
    }

    /// Identifier of the store's default contacts folder, if it has one
    async fn default_folder(&self) -> Result<Option<String>, crate::Error> {
        Ok(None)
    }

    /// Release backend resources
    async fn shutdown(&self) -> Result<(), crate::Error> {
        Ok(())
    }

    /// Backend name (for logging/debugging)
    fn backend_name(&self) -> &'static str;
}

/// Helper trait for constructing native stores from configuration
#[async_trait]
pub trait NativeStoreFactory: Send + Sync {
    /// Create a NativeStore instance from configuration
    ///
    /// # Parameters
    ///
    /// - `config`: Full bridge configuration (backends read their own section
    ///   plus transport/supervisor settings)
    async fn create(
        &self,
        config: &crate::config::BridgeConfig,
    ) -> Result<Arc<dyn NativeStore>, crate::Error>;
}
