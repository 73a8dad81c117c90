use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use inventory_sync_core::{
    AcquireOutcome, EditLockManager, EditSession, ItemKey, ReleaseOutcome, SyncError,
};
use tracing::{debug, instrument};

/// In-process edit lock manager with TTL-based expiry.
///
/// Each item maps to at most one session. An expired session is not removed
/// eagerly; it is reclaimed by the next `acquire` or dropped on read.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    sessions: DashMap<ItemKey, EditSession>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1))
    }
}

#[async_trait]
impl EditLockManager for MemoryLockManager {
    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        item: &ItemKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome, SyncError> {
        let now = Utc::now();
        let expires_at = Self::expiry(now, ttl);

        match self.sessions.entry(item.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                if !existing.is_expired_at(now) {
                    if existing.holder == holder {
                        // Reentrant: extend
                        existing.expires_at = expires_at;
                        debug!("Lock on {} already held by {} (reentrant)", item, holder);
                        return Ok(AcquireOutcome::Granted {
                            session: existing.clone(),
                        });
                    }
                    debug!(
                        "Lock on {} held by {} until {} (requested by {})",
                        item, existing.holder, existing.expires_at, holder
                    );
                    return Ok(AcquireOutcome::Conflict {
                        holder: existing.holder.clone(),
                        expires_at: existing.expires_at,
                    });
                }

                debug!(
                    "Lock on {} expired (was held by {}), acquiring for {}",
                    item, existing.holder, holder
                );
                let session = EditSession {
                    item: item.clone(),
                    holder: holder.to_string(),
                    acquired_at: now,
                    expires_at,
                    fields: BTreeSet::new(),
                };
                occupied.insert(session.clone());
                Ok(AcquireOutcome::Granted { session })
            }
            Entry::Vacant(vacant) => {
                let session = EditSession {
                    item: item.clone(),
                    holder: holder.to_string(),
                    acquired_at: now,
                    expires_at,
                    fields: BTreeSet::new(),
                };
                vacant.insert(session.clone());
                debug!("Acquired lock on {} for {} (expires at {})", item, holder, expires_at);
                Ok(AcquireOutcome::Granted { session })
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(&self, item: &ItemKey, holder: &str) -> Result<ReleaseOutcome, SyncError> {
        let now = Utc::now();
        let removed = self
            .sessions
            .remove_if(item, |_, s| s.holder == holder && !s.is_expired_at(now));

        if removed.is_some() {
            debug!("Released lock on {} by {}", item, holder);
            Ok(ReleaseOutcome::Released)
        } else {
            debug!("Lock on {} not held by {} (no-op)", item, holder);
            Ok(ReleaseOutcome::NotHolder)
        }
    }

    #[instrument(skip(self, fields), level = "debug")]
    async fn touch(
        &self,
        item: &ItemKey,
        holder: &str,
        ttl: Duration,
        fields: &[String],
    ) -> Result<bool, SyncError> {
        let now = Utc::now();
        match self.sessions.get_mut(item) {
            Some(mut session) if session.holder == holder && !session.is_expired_at(now) => {
                session.expires_at = Self::expiry(now, ttl);
                session.fields.extend(fields.iter().cloned());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current(&self, item: &ItemKey) -> Result<Option<EditSession>, SyncError> {
        let now = Utc::now();
        if let Some(session) = self.sessions.get(item) {
            if !session.is_expired_at(now) {
                return Ok(Some(session.clone()));
            }
        }
        self.sessions.remove_if(item, |_, s| s.is_expired_at(now));
        Ok(None)
    }

    async fn sessions(&self) -> Result<Vec<EditSession>, SyncError> {
        let now = Utc::now();
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        let mut live: Vec<EditSession> = self.sessions.iter().map(|s| s.clone()).collect();
        live.sort_by(|a, b| a.item.cmp(&b.item));
        Ok(live)
    }
}
