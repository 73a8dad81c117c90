use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use inventory_sync_core::{is_subset, Fields, ItemKey, MutationKind, PendingMutation};
use moka::future::Cache;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct InFlight {
    mutation: PendingMutation,
    /// The poller already applied a change consistent with this mutation
    echoed: bool,
}

#[derive(Debug, Clone)]
struct Confirmed {
    kind: MutationKind,
    fields: Fields,
}

/// What to do with a mutation the source just confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The poller observed and applied it while it was in flight
    AlreadyApplied,
    ApplyLocally,
}

/// Tracks the mutations this engine originated so that the poller's view of
/// the same change is recognised instead of treated as a new external edit.
///
/// In-flight mutations live until confirmed or abandoned. Confirmed ones are
/// kept for the echo window, after which any matching observation is just an
/// ordinary external change.
pub struct PendingTracker {
    in_flight: DashMap<Uuid, InFlight>,
    confirmed: Cache<ItemKey, Confirmed>,
}

impl PendingTracker {
    pub fn new(echo_window: Duration) -> Self {
        Self {
            in_flight: DashMap::new(),
            confirmed: Cache::builder().time_to_live(echo_window).build(),
        }
    }

    pub fn register(&self, mutation: PendingMutation) {
        debug!(
            "Pending {:?} {} on {} (deadline {})",
            mutation.kind, mutation.id, mutation.item, mutation.deadline
        );
        self.in_flight.insert(
            mutation.id,
            InFlight {
                mutation,
                echoed: false,
            },
        );
    }

    /// Register `mutation` for as long as the returned guard lives.
    ///
    /// Dropping the guard before the mutation completes abandons it, so a
    /// caller that goes away mid-write leaves nothing behind.
    pub fn track(self: &Arc<Self>, mutation: PendingMutation) -> PendingGuard {
        let id = mutation.id;
        self.register(mutation);
        PendingGuard {
            tracker: Arc::clone(self),
            id,
        }
    }

    pub fn record_attempt(&self, id: Uuid, attempts: u32) {
        if let Some(mut entry) = self.in_flight.get_mut(&id) {
            entry.mutation.attempts = attempts;
        }
    }

    /// Match an external observation of `key` against what we wrote.
    ///
    /// `observed` is the row content the poller saw (`None` when the row is
    /// gone). Returns true when the observation is the echo of one of our own
    /// mutations.
    pub async fn observe(&self, key: &ItemKey, observed: Option<&Fields>) -> bool {
        let mut matched = false;
        for mut entry in self.in_flight.iter_mut() {
            if &entry.mutation.item != key || entry.echoed {
                continue;
            }
            if intent_matches(entry.mutation.kind, &entry.mutation.fields, observed) {
                debug!("Echo of in-flight mutation {} on {}", entry.mutation.id, key);
                entry.echoed = true;
                matched = true;
            }
        }
        if matched {
            return true;
        }

        if let Some(confirmed) = self.confirmed.get(key).await {
            if intent_matches(confirmed.kind, &confirmed.fields, observed) {
                debug!("Echo of confirmed mutation on {}", key);
                self.confirmed.invalidate(key).await;
                return true;
            }
        }
        false
    }

    /// Resolve a mutation the source has accepted.
    pub async fn complete(&self, mutation: &PendingMutation) -> Resolution {
        let echoed = self
            .in_flight
            .remove(&mutation.id)
            .map(|(_, entry)| entry.echoed)
            .unwrap_or(false);
        if echoed {
            return Resolution::AlreadyApplied;
        }
        self.confirmed
            .insert(
                mutation.item.clone(),
                Confirmed {
                    kind: mutation.kind,
                    fields: mutation.fields.clone(),
                },
            )
            .await;
        Resolution::ApplyLocally
    }

    /// Forget a mutation that failed for good.
    pub fn abandon(&self, id: Uuid) {
        if let Some((_, entry)) = self.in_flight.remove(&id) {
            debug!(
                "Abandoned mutation {} on {} after {} attempts",
                id, entry.mutation.item, entry.mutation.attempts
            );
        }
    }

    /// In-flight mutations, oldest deadline first.
    pub fn list(&self) -> Vec<PendingMutation> {
        let mut pending: Vec<PendingMutation> = self
            .in_flight
            .iter()
            .map(|e| e.mutation.clone())
            .collect();
        pending.sort_by(|a, b| a.deadline.cmp(&b.deadline).then(a.item.cmp(&b.item)));
        pending
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

/// Keeps one mutation registered; see [`PendingTracker::track`].
#[must_use = "dropping the guard abandons the mutation"]
pub struct PendingGuard {
    tracker: Arc<PendingTracker>,
    id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // No-op once completed
        self.tracker.abandon(self.id);
    }
}

fn intent_matches(kind: MutationKind, intent: &Fields, observed: Option<&Fields>) -> bool {
    match (kind, observed) {
        (MutationKind::Delete, None) => true,
        (MutationKind::Create | MutationKind::Update, Some(payload)) => is_subset(intent, payload),
        _ => false,
    }
}
