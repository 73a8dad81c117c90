use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::{Fields, ItemKey, Snapshot, Version};

/// Kinds of change carried by a `ChangeEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
    Refresh,
    BulkRelocate,
    BulkSendOut,
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Confirmed mutation issued through this engine
    Local,
    /// Detected by the change poller
    Poller,
    /// Produced by the bulk orchestrator
    Bulk,
    /// Forced resync of a single identity after `NotFound`
    Resync,
}

/// Payload of a change, tagged by kind on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangePayload {
    /// Full field set of a new item
    Add { item: ItemKey, fields: Fields },
    /// Changed fields of an existing item
    Update { item: ItemKey, fields: Fields },
    Delete { item: ItemKey },
    /// Full resnapshot of one source
    Refresh { snapshot: Snapshot },
    BulkRelocate { items: Vec<ItemKey>, fields: Fields },
    BulkSendOut { items: Vec<ItemKey>, fields: Fields },
}

/// A change to the item collection.
///
/// Applying the same event twice leaves the Item Store as the first
/// application did: the store ignores any write whose `version` is not newer
/// than what it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(flatten)]
    pub payload: ChangePayload,
    pub origin: EventOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub version: Version,
    pub detected_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(payload: ChangePayload, origin: EventOrigin, version: Version) -> Self {
        Self {
            payload,
            origin,
            batch_id: None,
            version,
            detected_at: Utc::now(),
        }
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn kind(&self) -> ChangeKind {
        match &self.payload {
            ChangePayload::Add { .. } => ChangeKind::Add,
            ChangePayload::Update { .. } => ChangeKind::Update,
            ChangePayload::Delete { .. } => ChangeKind::Delete,
            ChangePayload::Refresh { .. } => ChangeKind::Refresh,
            ChangePayload::BulkRelocate { .. } => ChangeKind::BulkRelocate,
            ChangePayload::BulkSendOut { .. } => ChangeKind::BulkSendOut,
        }
    }

    /// The single item this event targets, if it targets exactly one.
    pub fn item(&self) -> Option<&ItemKey> {
        match &self.payload {
            ChangePayload::Add { item, .. }
            | ChangePayload::Update { item, .. }
            | ChangePayload::Delete { item } => Some(item),
            _ => None,
        }
    }

    /// Source touched by this event, when it touches exactly one.
    pub fn source(&self) -> Option<&str> {
        match &self.payload {
            ChangePayload::Refresh { snapshot } => Some(snapshot.source.as_str()),
            _ => self.item().map(|k| k.source.as_str()),
        }
    }
}
