//! Address book held in process memory
//!
//! Used on hosts without a platform address book and as the host-side
//! double in tests. Host edits made through [`InMemoryAddressBook::put`] and
//! [`InMemoryAddressBook::take`] fire the same callbacks a platform address
//! book would.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use abook_core::model::{NativeProperties, PropertyId, PropertyValue};
use abook_core::{Error, Result};

use crate::{ChangeObserver, NativeAddressBook};

#[derive(Default)]
struct BookState {
    records: BTreeMap<String, NativeProperties>,
    next_id: u64,
    observers: Vec<Arc<dyn ChangeObserver>>,
}

/// In-memory [`NativeAddressBook`]
#[derive(Default)]
pub struct InMemoryAddressBook {
    state: Mutex<BookState>,
}

impl InMemoryAddressBook {
    /// Create an empty address book
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a record as the host would, firing a callback
    pub fn put(&self, id: &str, props: NativeProperties) {
        let (existed, observers) = {
            let mut state = self.state.lock();
            let existed = state.records.insert(id.to_string(), props).is_some();
            (existed, state.observers.clone())
        };
        for observer in observers {
            if existed {
                observer.updated(id);
            } else {
                observer.inserted(id);
            }
        }
    }

    /// Delete a record as the host would, firing a callback
    pub fn take(&self, id: &str) -> Option<NativeProperties> {
        let (removed, observers) = {
            let mut state = self.state.lock();
            (state.records.remove(id), state.observers.clone())
        };
        if removed.is_some() {
            for observer in observers {
                observer.deleted(id);
            }
        }
        removed
    }

    /// Current properties of a record
    pub fn record(&self, id: &str) -> Option<NativeProperties> {
        self.state.lock().records.get(id).cloned()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether the book has no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches_filter(props: &NativeProperties, filter: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    let needle = filter.to_lowercase();
    props
        .text(PropertyId::DisplayName)
        .is_some_and(|name| name.to_lowercase().contains(&needle))
}

impl NativeAddressBook for InMemoryAddressBook {
    fn enumerate(&self, filter: &str, on_record: &mut dyn FnMut(&str)) -> Result<()> {
        let ids: Vec<String> = self
            .state
            .lock()
            .records
            .iter()
            .filter(|(_, props)| matches_filter(props, filter))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            on_record(id);
        }
        Ok(())
    }

    fn read(&self, id: &str, properties: &[PropertyId]) -> Result<Vec<PropertyValue>> {
        let state = self.state.lock();
        let record = state
            .records
            .get(id)
            .ok_or_else(|| Error::not_found(format!("record {}", id)))?;
        Ok(properties
            .iter()
            .map(|p| record.get(*p).cloned().unwrap_or_default())
            .collect())
    }

    fn write(&self, id: &str, property: PropertyId, value: &PropertyValue) -> bool {
        match self.state.lock().records.get_mut(id) {
            Some(record) => {
                record.set(property, value.clone());
                true
            }
            None => false,
        }
    }

    fn create(&self) -> Option<String> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("local-{}", state.next_id);
        state.records.insert(id.clone(), NativeProperties::new());
        Some(id)
    }

    fn remove(&self, id: &str) -> bool {
        self.state.lock().records.remove(id).is_some()
    }

    fn observe(&self, observer: Arc<dyn ChangeObserver>) {
        self.state.lock().observers.push(observer);
    }

    fn default_folder(&self) -> Option<String> {
        Some("Contacts".to_string())
    }
}
