//! Contact reconciliation engine
//!
//! Turns native property sets into domain details and decides whether a
//! fetched record creates, updates, or leaves a contact unchanged.
//!
//! ## Comparison
//!
//! Details are compared as sets: native stores may reorder multi-valued
//! fields between fetches, so an ordered comparison would report spurious
//! updates.
//!
//! ## Overflow
//!
//! Multi-valued properties expose only a few slots to the domain (see
//! [`SlotLayout`]). Values past those slots become [`OverflowDetail`]s and
//! are written back verbatim, so a read-modify-write cycle never drops data
//! the user did not edit. Empty entries keep their position as overflow too,
//! and a single-valued property holding structured data (a list instead of
//! text) is kept as overflow at position 0.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::config::SlotLayout;
use crate::error::{Error, Result};
use crate::model::{
    AppContactId, Contact, Detail, DetailCategory, DetailKind, NativeProperties, OverflowDetail,
    PropertyId, PropertyValue,
};
use crate::traits::CachedContact;

/// Result of reconciling one fetched record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The contact did not exist before
    Created,
    /// The contact's details changed
    Updated,
    /// The fetched details equal the cached ones
    Unchanged,
}

/// Single-valued native properties and the detail each one maps to
const SINGLE_VALUED: [(PropertyId, DetailKind, DetailCategory); 15] = [
    (PropertyId::DisplayName, DetailKind::DisplayName, DetailCategory::General),
    (PropertyId::GivenName, DetailKind::FirstName, DetailCategory::General),
    (PropertyId::MiddleName, DetailKind::MiddleName, DetailCategory::General),
    (PropertyId::Surname, DetailKind::LastName, DetailCategory::General),
    (PropertyId::Nickname, DetailKind::Nickname, DetailCategory::General),
    (PropertyId::Company, DetailKind::Organization, DetailCategory::General),
    (PropertyId::Department, DetailKind::Department, DetailCategory::General),
    (PropertyId::JobTitle, DetailKind::JobTitle, DetailCategory::Work),
    (PropertyId::HomePhone, DetailKind::Phone, DetailCategory::Home),
    (PropertyId::WorkPhone, DetailKind::Phone, DetailCategory::Work),
    (PropertyId::MobilePhone, DetailKind::Phone, DetailCategory::Mobile),
    (PropertyId::HomeAddress, DetailKind::Address, DetailCategory::Home),
    (PropertyId::WorkAddress, DetailKind::Address, DetailCategory::Work),
    (PropertyId::WebPage, DetailKind::WebPage, DetailCategory::General),
    (PropertyId::Notes, DetailKind::Note, DetailCategory::General),
];

/// Multi-valued native properties and the detail kind of their slots
const MULTI_VALUED: [(PropertyId, DetailKind); 2] = [
    (PropertyId::Emails, DetailKind::Email),
    (PropertyId::InstantMessaging, DetailKind::InstantMessaging),
];

/// Build the primary details and overflow values of a property set
///
/// Every property maps to one `(kind, category)` pair and every slot gets
/// its own category, so the result never holds two details with the same
/// pair.
pub fn build_details(
    layout: &SlotLayout,
    props: &NativeProperties,
) -> (Vec<Detail>, Vec<OverflowDetail>) {
    let mut details = Vec::new();
    let mut overflow = Vec::new();

    for (property, kind, category) in SINGLE_VALUED {
        match props.get(property) {
            Some(PropertyValue::Text(text)) if !text.is_empty() => {
                details.push(Detail::new(kind, category, text.as_str()));
            }
            Some(value) if !value.is_empty() => overflow.push(OverflowDetail {
                property,
                position: 0,
                value: value.clone(),
            }),
            _ => {}
        }
    }

    for (property, kind) in MULTI_VALUED {
        let slots = slots_for(layout, property);
        let values = match props.get(property) {
            Some(PropertyValue::List(values)) => values.clone(),
            Some(single @ PropertyValue::Text(_)) => vec![single.clone()],
            _ => continue,
        };

        for (position, value) in values.into_iter().enumerate() {
            match value {
                PropertyValue::Text(text) if position < slots && !text.is_empty() => {
                    details.push(Detail::new(kind, DetailCategory::Slot(position as u8), text));
                }
                value => overflow.push(OverflowDetail {
                    property,
                    position,
                    value,
                }),
            }
        }
    }

    (details, overflow)
}

/// Native property set that writes a contact back
///
/// Overflow values are merged into their original positions; positions
/// nobody fills are written as empty so that later entries do not move.
/// The embedded app id is not included; it is written separately and
/// first.
pub fn build_properties(layout: &SlotLayout, contact: &Contact) -> NativeProperties {
    let mut props = NativeProperties::new();

    for (property, kind, category) in SINGLE_VALUED {
        if let Some(value) = contact.detail(kind, category) {
            props.set(property, PropertyValue::text(value));
        } else if let Some(kept) = contact.overflow.iter().find(|o| o.property == property) {
            props.set(property, kept.value.clone());
        }
    }

    for (property, kind) in MULTI_VALUED {
        let slots = slots_for(layout, property);
        let mut positioned: BTreeMap<usize, PropertyValue> = BTreeMap::new();

        for detail in contact.details.iter().filter(|d| d.kind == kind) {
            if let DetailCategory::Slot(slot) = detail.category
                && (slot as usize) < slots
            {
                positioned.insert(slot as usize, PropertyValue::text(&detail.value));
            }
        }
        for extra in contact.overflow.iter().filter(|o| o.property == property) {
            // A slot edited by the user wins over a stale overflow entry
            positioned
                .entry(extra.position)
                .or_insert_with(|| extra.value.clone());
        }

        if let Some(&last) = positioned.keys().next_back() {
            let values = (0..=last)
                .map(|position| positioned.remove(&position).unwrap_or_default())
                .collect();
            props.set(property, PropertyValue::List(values));
        }
    }

    props
}

fn slots_for(layout: &SlotLayout, property: PropertyId) -> usize {
    match property {
        PropertyId::Emails => layout.email_slots,
        PropertyId::InstantMessaging => layout.im_slots,
        _ => 0,
    }
}

/// Order-independent equality of two detail lists
pub fn same_details(old: &[Detail], new: &[Detail]) -> bool {
    let old: HashSet<&Detail> = old.iter().collect();
    let new: HashSet<&Detail> = new.iter().collect();
    old.is_superset(&new) && new.is_superset(&old)
}

fn same_overflow(old: &[OverflowDetail], new: &[OverflowDetail]) -> bool {
    old.len() == new.len() && old.iter().all(|o| new.contains(o))
}

/// Keep the last detail for every `(kind, category)` pair
fn dedup_details(details: Vec<Detail>) -> Vec<Detail> {
    let mut by_key: BTreeMap<(DetailKind, DetailCategory), Detail> = BTreeMap::new();
    for detail in details {
        by_key.insert((detail.kind, detail.category), detail);
    }
    by_key.into_values().collect()
}

/// Reconciliation engine holding the cached domain contacts
///
/// The synchronization controller owns the engine; nothing else mutates the
/// contact table.
#[derive(Debug)]
pub struct ReconcileEngine {
    layout: SlotLayout,
    contacts: RwLock<HashMap<AppContactId, Contact>>,
}

impl ReconcileEngine {
    /// Create an engine with an empty contact table
    pub fn new(layout: SlotLayout) -> Self {
        Self {
            layout,
            contacts: RwLock::new(HashMap::new()),
        }
    }

    /// Slot layout used for detail construction
    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Recreate a contact from the local cache as `Unresolved`
    ///
    /// Returns `false` if the contact is already known.
    pub fn load_cached(&self, cached: &CachedContact) -> bool {
        let mut contacts = self.contacts.write();
        if contacts.contains_key(&cached.id) {
            return false;
        }

        let (details, overflow) = build_details(&self.layout, &cached.persistent_data);
        contacts.insert(
            cached.id.clone(),
            Contact {
                id: cached.id.clone(),
                details,
                overflow,
                resolved: false,
                favorite: cached.favorite,
                persistent_data: cached.persistent_data.clone(),
            },
        );
        true
    }

    /// Reconcile a freshly fetched property set with the cached contact
    ///
    /// Any successful reconcile marks the contact resolved. Details,
    /// overflow and the persisted snapshot are replaced only when they
    /// differ from the cached ones.
    pub fn reconcile(&self, id: &AppContactId, props: &NativeProperties) -> ReconcileOutcome {
        let (details, overflow) = build_details(&self.layout, props);
        let mut contacts = self.contacts.write();

        match contacts.get_mut(id) {
            None => {
                contacts.insert(
                    id.clone(),
                    Contact {
                        id: id.clone(),
                        details,
                        overflow,
                        resolved: true,
                        favorite: false,
                        persistent_data: props.clone(),
                    },
                );
                ReconcileOutcome::Created
            }
            Some(contact) => {
                let unchanged = same_details(&contact.details, &details)
                    && same_overflow(&contact.overflow, &overflow);
                contact.resolved = true;

                if unchanged {
                    debug!("Contact {} unchanged", id);
                    ReconcileOutcome::Unchanged
                } else {
                    contact.details = details;
                    contact.overflow = overflow;
                    contact.persistent_data = props.clone();
                    ReconcileOutcome::Updated
                }
            }
        }
    }

    /// Insert a contact created through the domain
    pub fn insert(&self, contact: Contact) {
        self.contacts.write().insert(contact.id.clone(), contact);
    }

    /// Replace a contact's details with a local edit
    ///
    /// # Returns
    ///
    /// The pre-edit contact, to be restored with [`ReconcileEngine::restore`]
    /// if the write-back is rejected.
    pub fn apply_edit(&self, id: &AppContactId, details: Vec<Detail>) -> Result<Contact> {
        let mut contacts = self.contacts.write();
        let contact = contacts
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("contact {}", id)))?;
        let previous = contact.clone();

        contact.details = dedup_details(details);
        let mut snapshot = build_properties(&self.layout, contact);
        if let Some(app_id) = previous.persistent_data.get(PropertyId::AppId) {
            snapshot.set(PropertyId::AppId, app_id.clone());
        }
        contact.persistent_data = snapshot;

        Ok(previous)
    }

    /// Put a pre-edit contact back
    pub fn restore(&self, previous: Contact) {
        self.contacts.write().insert(previous.id.clone(), previous);
    }

    /// Set the domain-side favorite flag
    pub fn set_favorite(&self, id: &AppContactId, favorite: bool) -> Result<Contact> {
        let mut contacts = self.contacts.write();
        let contact = contacts
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("contact {}", id)))?;
        contact.favorite = favorite;
        Ok(contact.clone())
    }

    /// Native properties that write the contact back, overflow included
    pub fn write_back_properties(&self, id: &AppContactId) -> Option<NativeProperties> {
        let contacts = self.contacts.read();
        contacts.get(id).map(|c| build_properties(&self.layout, c))
    }

    /// Remove a contact
    pub fn remove(&self, id: &AppContactId) -> Option<Contact> {
        self.contacts.write().remove(id)
    }

    /// Get a copy of a contact
    pub fn contact(&self, id: &AppContactId) -> Option<Contact> {
        self.contacts.read().get(id).cloned()
    }

    /// Copies of all contacts
    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.read().values().cloned().collect()
    }

    /// Ids of contacts the native store has not confirmed
    pub fn unresolved_ids(&self) -> Vec<AppContactId> {
        self.contacts
            .read()
            .values()
            .filter(|c| !c.resolved)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Number of contacts
    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    /// Whether no contact is known
    pub fn is_empty(&self) -> bool {
        self.contacts.read().is_empty()
    }
}
