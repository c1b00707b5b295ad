//! Data model shared by every bridge component
//!
//! - [`AppContactId`]: stable application-level contact id, persisted inside
//!   the native record
//! - [`NativeRecordId`]: backend-specific record handle (may change across
//!   backend restarts)
//! - [`PropertyId`] / [`PropertyValue`] / [`NativeProperties`]: the native
//!   property set as fetched from the store
//! - [`Detail`] / [`Contact`]: the domain view built by the reconciliation
//!   engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable application-level contact identifier
///
/// Generated once, then written into the native record so that every later
/// enumeration finds the same id again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppContactId(String);

impl AppContactId {
    /// Mint a fresh id
    pub fn mint() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Parse an id read back from a native record
    ///
    /// Only the hyphenated UUID form is accepted, in either case. Anything
    /// else is treated as corrupt so that it gets replaced rather than
    /// trusted. The id keeps the exact text found in the record.
    pub fn parse(raw: &str) -> Option<Self> {
        let uuid = Uuid::try_parse(raw).ok()?;
        let canonical = uuid.hyphenated().to_string();
        canonical
            .eq_ignore_ascii_case(raw)
            .then(|| Self(raw.to_string()))
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-specific record handle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeRecordId(String);

impl NativeRecordId {
    /// Wrap a raw native handle
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the handle as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NativeRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NativeRecordId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for NativeRecordId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Kind of a raw change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A record was created
    Inserted,
    /// A record was modified
    Updated,
    /// A record was removed
    Deleted,
}

/// Raw change notification delivered by a native store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeChange {
    /// Record the change applies to
    pub id: NativeRecordId,
    /// What happened to it
    pub kind: ChangeKind,
}

impl NativeChange {
    /// Create a change notification
    pub fn new(id: impl Into<NativeRecordId>, kind: ChangeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Native property identifiers understood by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyId {
    /// Embedded application contact id
    AppId,
    DisplayName,
    GivenName,
    MiddleName,
    Surname,
    Nickname,
    Company,
    Department,
    JobTitle,
    HomePhone,
    WorkPhone,
    MobilePhone,
    HomeAddress,
    WorkAddress,
    /// Multi-valued
    Emails,
    /// Multi-valued
    InstantMessaging,
    WebPage,
    Notes,
}

impl PropertyId {
    /// Every property the bridge reads, in wire order
    pub const ALL: [PropertyId; 18] = [
        PropertyId::AppId,
        PropertyId::DisplayName,
        PropertyId::GivenName,
        PropertyId::MiddleName,
        PropertyId::Surname,
        PropertyId::Nickname,
        PropertyId::Company,
        PropertyId::Department,
        PropertyId::JobTitle,
        PropertyId::HomePhone,
        PropertyId::WorkPhone,
        PropertyId::MobilePhone,
        PropertyId::HomeAddress,
        PropertyId::WorkAddress,
        PropertyId::Emails,
        PropertyId::InstantMessaging,
        PropertyId::WebPage,
        PropertyId::Notes,
    ];

    /// Name used on the wire and in snapshots
    pub fn wire_name(self) -> &'static str {
        match self {
            PropertyId::AppId => "app_id",
            PropertyId::DisplayName => "display_name",
            PropertyId::GivenName => "given_name",
            PropertyId::MiddleName => "middle_name",
            PropertyId::Surname => "surname",
            PropertyId::Nickname => "nickname",
            PropertyId::Company => "company",
            PropertyId::Department => "department",
            PropertyId::JobTitle => "job_title",
            PropertyId::HomePhone => "home_phone",
            PropertyId::WorkPhone => "work_phone",
            PropertyId::MobilePhone => "mobile_phone",
            PropertyId::HomeAddress => "home_address",
            PropertyId::WorkAddress => "work_address",
            PropertyId::Emails => "emails",
            PropertyId::InstantMessaging => "instant_messaging",
            PropertyId::WebPage => "web_page",
            PropertyId::Notes => "notes",
        }
    }

    /// Reverse of [`PropertyId::wire_name`]
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.wire_name() == name)
    }

    /// Whether the native store keeps a list of values for this property
    pub fn is_multi_valued(self) -> bool {
        matches!(self, PropertyId::Emails | PropertyId::InstantMessaging)
    }
}

/// Value of a single native property
///
/// Multi-valued properties arrive as lists, arbitrarily nested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Property not set
    #[default]
    Empty,
    /// Single text value
    Text(String),
    /// List of values
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Convenience constructor for text values
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Build a list of text values
    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(values.into_iter().map(|v| Self::Text(v.into())).collect())
    }

    /// Text content, if this is a non-empty text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Whether the value carries no data
    pub fn is_empty(&self) -> bool {
        match self {
            PropertyValue::Empty => true,
            PropertyValue::Text(s) => s.is_empty(),
            PropertyValue::List(items) => items.iter().all(PropertyValue::is_empty),
        }
    }
}

/// One entry of a serialized property snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Property the value belongs to
    pub property: PropertyId,
    /// Last seen value
    pub value: PropertyValue,
}

/// Property set of one native record
///
/// Serializes as an array of `{property, value}` objects; this is the
/// `persistentData` snapshot kept with every contact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<SnapshotEntry>", into = "Vec<SnapshotEntry>")]
pub struct NativeProperties {
    values: BTreeMap<PropertyId, PropertyValue>,
}

impl NativeProperties {
    /// Create an empty property set
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair the values returned by `get_properties` with the requested ids
    pub fn from_values(ids: &[PropertyId], values: Vec<PropertyValue>) -> Self {
        let mut props = Self::new();
        for (id, value) in ids.iter().zip(values) {
            props.set(*id, value);
        }
        props
    }

    /// Builder-style setter
    pub fn with(mut self, id: PropertyId, value: PropertyValue) -> Self {
        self.set(id, value);
        self
    }

    /// Set a property; empty values are dropped
    pub fn set(&mut self, id: PropertyId, value: PropertyValue) {
        if value.is_empty() {
            self.values.remove(&id);
        } else {
            self.values.insert(id, value);
        }
    }

    /// Get a property value
    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.values.get(&id)
    }

    /// Text of a single-valued property
    pub fn text(&self, id: PropertyId) -> Option<&str> {
        self.get(id).and_then(PropertyValue::as_text)
    }

    /// Raw embedded application id, if any
    pub fn raw_app_id(&self) -> Option<&str> {
        self.text(PropertyId::AppId)
    }

    /// Iterate over all set properties
    pub fn iter(&self) -> impl Iterator<Item = (PropertyId, &PropertyValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    /// Number of set properties
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no property is set
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<SnapshotEntry>> for NativeProperties {
    fn from(entries: Vec<SnapshotEntry>) -> Self {
        let mut props = Self::new();
        for entry in entries {
            props.set(entry.property, entry.value);
        }
        props
    }
}

impl From<NativeProperties> for Vec<SnapshotEntry> {
    fn from(props: NativeProperties) -> Self {
        props
            .values
            .into_iter()
            .map(|(property, value)| SnapshotEntry { property, value })
            .collect()
    }
}

/// Kind of a contact detail shown by the domain model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailKind {
    DisplayName,
    FirstName,
    MiddleName,
    LastName,
    Nickname,
    Organization,
    Department,
    JobTitle,
    Phone,
    Address,
    Email,
    InstantMessaging,
    WebPage,
    Note,
}

/// Category distinguishing details of the same kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailCategory {
    General,
    Home,
    Work,
    Mobile,
    /// Individually addressable position of a multi-valued property
    Slot(u8),
}

/// A single contact detail
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Detail {
    pub kind: DetailKind,
    pub category: DetailCategory,
    pub value: String,
}

impl Detail {
    /// Create a detail
    pub fn new(kind: DetailKind, category: DetailCategory, value: impl Into<String>) -> Self {
        Self {
            kind,
            category,
            value: value.into(),
        }
    }
}

/// Value of a multi-valued property beyond the exposed slots
///
/// Not shown in the domain's primary fields, but rewritten verbatim on every
/// write-back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowDetail {
    /// Property the value belongs to
    pub property: PropertyId,
    /// Position inside the property's value list
    pub position: usize,
    /// The preserved value
    pub value: PropertyValue,
}

/// Application-level contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Stable id
    pub id: AppContactId,
    /// Primary details (set semantics, no duplicate `(kind, category)`)
    pub details: Vec<Detail>,
    /// Values beyond the exposed slots
    pub overflow: Vec<OverflowDetail>,
    /// Whether the native store has confirmed this contact
    pub resolved: bool,
    /// Domain-side favorite flag
    pub favorite: bool,
    /// Last seen native property set
    pub persistent_data: NativeProperties,
}

impl Contact {
    /// Value of the first detail matching `(kind, category)`
    pub fn detail(&self, kind: DetailKind, category: DetailCategory) -> Option<&str> {
        self.details
            .iter()
            .find(|d| d.kind == kind && d.category == category)
            .map(|d| d.value.as_str())
    }

    /// Display name, if known
    pub fn display_name(&self) -> Option<&str> {
        self.detail(DetailKind::DisplayName, DetailCategory::General)
    }
}
