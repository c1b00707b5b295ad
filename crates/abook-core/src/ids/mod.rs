//! Bidirectional mapping between application contact ids and native records
//!
//! An [`AppContactId`] may be backed by several native records (merged
//! duplicates), but a [`NativeRecordId`] belongs to at most one app id.
//!
//! The app id is stored inside the native record itself. On first sight of
//! a record the embedded id is adopted; when it is absent or malformed a
//! fresh id is written back before anything else touches the record, since
//! a record without an id would turn into a duplicate contact on the next
//! full sync.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{AppContactId, NativeProperties, NativeRecordId, PropertyId, PropertyValue};
use crate::traits::NativeStore;

/// How a native record was mapped to its app id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The record carried a valid app id
    Embedded(AppContactId),
    /// An app id was written into the record
    Assigned(AppContactId),
}

impl Resolution {
    /// The resolved app id
    pub fn id(&self) -> &AppContactId {
        match self {
            Resolution::Embedded(id) | Resolution::Assigned(id) => id,
        }
    }

    /// Consume into the resolved app id
    pub fn into_id(self) -> AppContactId {
        match self {
            Resolution::Embedded(id) | Resolution::Assigned(id) => id,
        }
    }
}

/// Owner of the `AppContactId ↔ {NativeRecordId}` table
#[derive(Debug, Default)]
pub struct IdReconciler {
    table: Mutex<HashMap<AppContactId, BTreeSet<NativeRecordId>>>,
}

impl IdReconciler {
    /// Create an empty reconciler
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a fetched native record to its app id
    ///
    /// A valid embedded id is bound as-is. Otherwise the id already bound to
    /// this record, or a freshly minted one, is written back to the record
    /// first and only then bound.
    ///
    /// # Errors
    ///
    /// - `WriteRejected`: the store refused the id write; nothing is bound
    /// - any error of the store call itself
    pub async fn resolve(
        &self,
        store: &dyn NativeStore,
        native_id: &NativeRecordId,
        props: &NativeProperties,
    ) -> Result<Resolution> {
        let embedded = props.raw_app_id();

        if let Some(id) = embedded.and_then(AppContactId::parse) {
            self.bind(&id, native_id);
            return Ok(Resolution::Embedded(id));
        }

        if let Some(raw) = embedded {
            warn!("Record {} carries a malformed contact id {:?}, replacing it", native_id, raw);
        }

        let id = self.reverse_lookup(native_id).unwrap_or_else(AppContactId::mint);
        let written = store
            .set_property(native_id, PropertyId::AppId, &PropertyValue::text(id.as_str()))
            .await?;
        if !written {
            return Err(Error::write_rejected(
                native_id.as_str(),
                "could not assign a contact id to the record",
            ));
        }

        debug!("Assigned contact id {} to record {}", id, native_id);
        self.bind(&id, native_id);
        Ok(Resolution::Assigned(id))
    }

    /// Find the app id a native record is bound to
    ///
    /// Linear scan over the bound sets.
    pub fn reverse_lookup(&self, native_id: &NativeRecordId) -> Option<AppContactId> {
        let table = self.table.lock();
        table
            .iter()
            .find(|(_, natives)| natives.contains(native_id))
            .map(|(id, _)| id.clone())
    }

    /// Bind a native record to an app id
    ///
    /// The record is first removed from any other app id it was bound to.
    /// Returns `true` if the binding is new.
    pub fn bind(&self, id: &AppContactId, native_id: &NativeRecordId) -> bool {
        let mut table = self.table.lock();

        let mut emptied = Vec::new();
        for (other, natives) in table.iter_mut() {
            if other != id && natives.remove(native_id) && natives.is_empty() {
                emptied.push(other.clone());
            }
        }
        for other in emptied {
            debug!("Record {} moved away from {}, which has no records left", native_id, other);
            table.remove(&other);
        }

        table.entry(id.clone()).or_default().insert(native_id.clone())
    }

    /// Remove an app id and all its bindings
    pub fn unbind(&self, id: &AppContactId) -> Option<BTreeSet<NativeRecordId>> {
        self.table.lock().remove(id)
    }

    /// Remove a single native record
    ///
    /// # Returns
    ///
    /// The app id it was bound to, and whether that app id has no records
    /// left (in which case its entry is removed too).
    pub fn unbind_native(&self, native_id: &NativeRecordId) -> Option<(AppContactId, bool)> {
        let mut table = self.table.lock();
        let id = table
            .iter()
            .find(|(_, natives)| natives.contains(native_id))
            .map(|(id, _)| id.clone())?;

        let emptied = match table.get_mut(&id) {
            Some(natives) => {
                natives.remove(native_id);
                natives.is_empty()
            }
            None => false,
        };
        if emptied {
            table.remove(&id);
        }
        Some((id, emptied))
    }

    /// Native records bound to an app id
    pub fn native_ids(&self, id: &AppContactId) -> Vec<NativeRecordId> {
        self.table
            .lock()
            .get(id)
            .map(|natives| natives.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every bound native record with its app id
    pub fn bindings(&self) -> Vec<(NativeRecordId, AppContactId)> {
        let table = self.table.lock();
        table
            .iter()
            .flat_map(|(id, natives)| natives.iter().map(move |n| (n.clone(), id.clone())))
            .collect()
    }

    /// Whether an app id has any binding
    pub fn is_bound(&self, id: &AppContactId) -> bool {
        self.table.lock().contains_key(id)
    }

    /// Number of bound app ids
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}
