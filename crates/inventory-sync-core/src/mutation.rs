use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::{Fields, ItemKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A client-originated write awaiting confirmation from the authoritative source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub item: ItemKey,
    pub kind: MutationKind,
    /// Proposed field values (empty for deletes)
    pub fields: Fields,
    /// Client or session that issued it
    pub holder: Option<String>,
    pub attempts: u32,
    pub deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
}

impl PendingMutation {
    pub fn new(item: ItemKey, kind: MutationKind, fields: Fields, deadline: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            item,
            kind,
            fields,
            holder: None,
            attempts: 0,
            deadline,
            batch_id: None,
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn is_delete(&self) -> bool {
        self.kind == MutationKind::Delete
    }
}
