use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::item::ItemKey;

/// An exclusive, time-bounded claim on one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSession {
    pub item: ItemKey,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Fields written under this session; a REFRESH leaves them alone until release.
    #[serde(default)]
    pub fields: BTreeSet<String>,
}

impl EditSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn holds_field(&self, field: &str) -> bool {
        self.fields.contains(field)
    }
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    Granted { session: EditSession },
    /// Held by someone else; carries the holder so the UI can say who.
    Conflict {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted { .. })
    }
}

/// Result of a release. Releasing a session you do not hold is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released,
    NotHolder,
}

/// Edit lock abstraction: at most one live session per item.
///
/// Sessions whose `expires_at` has passed are treated as abandoned and may be
/// reclaimed silently by the next `acquire`.
#[async_trait]
pub trait EditLockManager: Send + Sync {
    /// Attempt to open an edit session on `item` for `holder`.
    ///
    /// Re-acquiring a session you already hold succeeds and extends it.
    async fn acquire(
        &self,
        item: &ItemKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome, SyncError>;

    /// Release the session if `holder` owns it.
    async fn release(&self, item: &ItemKey, holder: &str) -> Result<ReleaseOutcome, SyncError>;

    /// Extend a held session after a successful write and record the written fields.
    ///
    /// Returns false when `holder` does not hold a live session on `item`.
    async fn touch(
        &self,
        item: &ItemKey,
        holder: &str,
        ttl: Duration,
        fields: &[String],
    ) -> Result<bool, SyncError>;

    /// The live session on `item`, if any.
    async fn current(&self, item: &ItemKey) -> Result<Option<EditSession>, SyncError>;

    /// All live sessions.
    async fn sessions(&self) -> Result<Vec<EditSession>, SyncError>;
}
