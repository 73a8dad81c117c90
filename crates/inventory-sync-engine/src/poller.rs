//! Change poller / diff detector.
//!
//! The backing spreadsheet has no change notifications, so each source is
//! read in full on a fixed interval and diffed against the last snapshot.

use std::sync::Arc;
use std::time::Duration;

use inventory_sync_core::{
    ChangeEvent, ChangePayload, EventOrigin, ItemKey, Snapshot, SourceAdapter, SyncError,
    Version,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::clock::VersionClock;
use crate::reconcile::Reconciler;
use crate::status::SyncStatusTracker;
use crate::store::changed_fields;
use crate::suppression::SuppressionSet;

#[derive(Debug, Default)]
struct PollState {
    /// Last trusted read; never cleared by a failed poll
    snapshot: Option<Snapshot>,
    /// Successful polls so far
    cycles: u64,
    /// Row count of a held-back shrink awaiting confirmation
    pending_shrink: Option<usize>,
}

/// Polls one authoritative source.
pub struct ChangePoller {
    source: String,
    adapter: Arc<dyn SourceAdapter>,
    clock: Arc<VersionClock>,
    suppression: SuppressionSet,
    status: Arc<SyncStatusTracker>,
    mass_delete_threshold: usize,
    refresh_every: u64,
    state: Mutex<PollState>,
}

impl ChangePoller {
    pub fn new(
        source: impl Into<String>,
        adapter: Arc<dyn SourceAdapter>,
        clock: Arc<VersionClock>,
        suppression: SuppressionSet,
        status: Arc<SyncStatusTracker>,
        mass_delete_threshold: usize,
        refresh_every: u64,
    ) -> Self {
        Self {
            source: source.into(),
            adapter,
            clock,
            suppression,
            status,
            mass_delete_threshold,
            refresh_every,
            state: Mutex::new(PollState::default()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Current diff baseline.
    pub async fn snapshot(&self) -> Option<Snapshot> {
        self.state.lock().await.snapshot.clone()
    }

    /// Run one poll cycle and return the changes it detected.
    ///
    /// A failed read is logged and yields nothing; the next tick retries.
    #[instrument(skip(self), fields(source = %self.source), level = "debug")]
    pub async fn poll_once(&self) -> Vec<ChangeEvent> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        // Stamp at read start: anything confirmed while the read is in
        // flight is newer than what the read can show.
        let version = self.clock.next();
        let next = match self.adapter.read_all(&self.source).await {
            Ok(rows) => Snapshot::from_rows(self.source.clone(), rows),
            Err(e) => {
                warn!("Poll of {} failed, keeping snapshot: {}", self.source, e);
                self.status.record_failure(&self.source, &e.to_string());
                return vec![];
            }
        };

        let Some(previous) = state.snapshot.as_ref() else {
            info!("Initial load of {} ({} rows)", self.source, next.len());
            return self.install(state, next, version);
        };

        let mut changes = Vec::new();
        let mut deletions = 0usize;
        for payload in diff_rows(previous, &next) {
            if let ChangePayload::Delete { item } = &payload {
                if self.suppression.contains(item).await {
                    debug!("Skipping suppressed delete of {}", item);
                    continue;
                }
                deletions += 1;
            }
            changes.push(payload);
        }

        let shrink =
            deletions > self.mass_delete_threshold || (next.is_empty() && deletions > 0);
        if shrink {
            if state.pending_shrink == Some(next.len()) {
                info!(
                    "Shrink of {} to {} rows confirmed by a second read",
                    self.source,
                    next.len()
                );
            } else {
                warn!(
                    "Poll of {} dropped {} rows (now {}), holding until confirmed",
                    self.source,
                    deletions,
                    next.len()
                );
                state.pending_shrink = Some(next.len());
                self.status.record_success(&self.source, previous.len(), true);
                return vec![];
            }
        }
        state.pending_shrink = None;
        state.cycles += 1;

        if self.refresh_every > 0 && state.cycles % self.refresh_every == 0 {
            debug!("Periodic full refresh of {}", self.source);
            return self.install(state, next, version);
        }

        self.status.record_success(&self.source, next.len(), false);
        state.snapshot = Some(next);
        if !changes.is_empty() {
            debug!("Poll of {} found {} changes", self.source, changes.len());
        }
        changes
            .into_iter()
            .map(|payload| ChangeEvent::new(payload, EventOrigin::Poller, version))
            .collect()
    }

    /// Read the source now and return a REFRESH of it, bypassing the shrink guard.
    #[instrument(skip(self), fields(source = %self.source), level = "debug")]
    pub async fn refresh(&self) -> Result<ChangeEvent, SyncError> {
        let mut state = self.state.lock().await;
        let version = self.clock.next();
        let rows = match self.adapter.read_all(&self.source).await {
            Ok(rows) => rows,
            Err(e) => {
                self.status.record_failure(&self.source, &e.to_string());
                return Err(e);
            }
        };
        let snapshot = Snapshot::from_rows(self.source.clone(), rows);
        state.pending_shrink = None;
        let mut events = self.install(&mut state, snapshot, version);
        events
            .pop()
            .ok_or_else(|| SyncError::Failure("refresh produced no event".to_string()))
    }

    fn install(
        &self,
        state: &mut PollState,
        snapshot: Snapshot,
        version: Version,
    ) -> Vec<ChangeEvent> {
        self.status.record_success(&self.source, snapshot.len(), false);
        state.cycles = state.cycles.max(1);
        state.snapshot = Some(snapshot.clone());
        vec![ChangeEvent::new(
            ChangePayload::Refresh { snapshot },
            EventOrigin::Poller,
            version,
        )]
    }

    /// Poll on a fixed interval until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        reconciler: Arc<Reconciler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Polling {} every {:?}", self.source, interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let events = self.poll_once().await;
                        if !events.is_empty() {
                            reconciler.apply_all(events).await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Stopped polling {}", self.source);
        })
    }
}

/// Row-level diff of two reads of the same source, in key order.
///
/// UPDATE carries only the fields that differ; a field missing from the new
/// read is reported as cleared.
pub fn diff_rows(previous: &Snapshot, next: &Snapshot) -> Vec<ChangePayload> {
    let mut changes = Vec::new();

    for (id, fields) in &next.rows {
        let item = next.key(id);
        match previous.rows.get(id) {
            None => changes.push(ChangePayload::Add {
                item,
                fields: fields.clone(),
            }),
            Some(before) => {
                let changed = changed_fields(before, fields, true);
                if !changed.is_empty() {
                    changes.push(ChangePayload::Update {
                        item,
                        fields: changed,
                    });
                }
            }
        }
    }

    for id in previous.rows.keys() {
        if !next.rows.contains_key(id) {
            changes.push(ChangePayload::Delete {
                item: ItemKey::new(previous.source.clone(), id.clone()),
            });
        }
    }

    changes
}
