use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Open field map of an item. Spreadsheet cells are text, so values are strings.
pub type Fields = BTreeMap<String, String>;

/// Logical timestamp assigned by the engine (the backing stores have no versioning).
pub type Version = u64;

/// Well-known inventory columns.
pub mod columns {
    pub const BRAND: &str = "brand";
    pub const PRODUCT_CODE: &str = "product_code";
    pub const NAME: &str = "name";
    pub const QUANTITY: &str = "quantity";
    pub const UNIT: &str = "unit";
    pub const LOCATION: &str = "location";
    pub const RECEIVED_AT: &str = "received_at";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const NOTES: &str = "notes";
    pub const STATUS: &str = "status";
    pub const DESTINATION: &str = "destination";
    pub const SENT_AT: &str = "sent_at";
}

/// Stable composite identity of an item within the merged collection.
///
/// The `source` component namespaces ids so that two backing stores can use
/// the same local id without colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub source: String,
    pub local_id: String,
}

impl ItemKey {
    pub fn new(source: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.local_id)
    }
}

/// An inventory record as held by the Item Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub key: ItemKey,
    pub fields: Fields,
    /// Stamp of the last event that touched this item
    pub version: Version,
}

impl Item {
    pub fn new(key: ItemKey, fields: Fields, version: Version) -> Self {
        Self {
            key,
            fields,
            version,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Value of a cell, with a missing field reading as a blank cell.
pub fn cell<'a>(fields: &'a Fields, name: &str) -> &'a str {
    fields.get(name).map(String::as_str).unwrap_or("")
}

/// Returns true when every `(field, value)` of `intent` is present in `payload`.
///
/// A blank value in `intent` matches a field missing from `payload`.
pub fn is_subset(intent: &Fields, payload: &Fields) -> bool {
    intent
        .iter()
        .all(|(name, value)| cell(payload, name) == value)
}

/// A row as read from an authoritative source, keyed by its identity column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(rename = "id")]
    pub local_id: String,
    #[serde(default)]
    pub fields: Fields,
}

impl RawRow {
    pub fn new(local_id: impl Into<String>, fields: Fields) -> Self {
        Self {
            local_id: local_id.into(),
            fields,
        }
    }
}

/// Last fully-read state of one source, used as the diff baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub source: String,
    pub rows: BTreeMap<String, Fields>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build a snapshot from raw rows. Later duplicates of the same id win.
    pub fn from_rows(source: impl Into<String>, rows: Vec<RawRow>) -> Self {
        Self {
            source: source.into(),
            rows: rows.into_iter().map(|r| (r.local_id, r.fields)).collect(),
            taken_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn key(&self, local_id: &str) -> ItemKey {
        ItemKey::new(self.source.clone(), local_id)
    }
}
