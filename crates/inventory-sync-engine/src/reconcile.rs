//! Reconciliation of external change events and confirmed local mutations
//! into the Item Store.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use inventory_sync_core::{
    cell, ChangeEvent, ChangePayload, EditLockManager, EditSession, EventOrigin, Fields, ItemKey,
    MutationKind, PendingMutation, Snapshot, SourceAdapter, SyncError,
};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::clock::VersionClock;
use crate::pending::{PendingTracker, Resolution};
use crate::serial::KeyedSerializer;
use crate::store::{ItemStore, Stamp, StoreOutcome};

/// Tally of what applying one or more events did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub unchanged: usize,
    pub ignored: usize,
    /// Observations recognised as our own mutations coming back
    pub echoes: usize,
    /// Fields left at their local value because an edit session holds them
    pub preserved_fields: usize,
    /// Items missing from a REFRESH but kept because they are being edited
    pub kept_locked: usize,
}

impl ApplyReport {
    fn record(&mut self, outcome: StoreOutcome) {
        match outcome {
            StoreOutcome::Applied => self.applied += 1,
            StoreOutcome::Unchanged => self.unchanged += 1,
            StoreOutcome::Ignored => self.ignored += 1,
        }
    }

    fn absorb(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.ignored += other.ignored;
        self.echoes += other.echoes;
        self.preserved_fields += other.preserved_fields;
        self.kept_locked += other.kept_locked;
    }
}

enum RowChange {
    Replace(Fields),
    Merge(Fields),
    Remove,
}

pub struct Reconciler {
    store: Arc<ItemStore>,
    locks: Arc<dyn EditLockManager>,
    pending: Arc<PendingTracker>,
    clock: Arc<VersionClock>,
    serializer: KeyedSerializer,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<ItemStore>,
        locks: Arc<dyn EditLockManager>,
        pending: Arc<PendingTracker>,
        clock: Arc<VersionClock>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            locks,
            pending,
            clock,
            serializer: KeyedSerializer::new(),
            concurrency: concurrency.max(1),
        }
    }

    /// Apply one change event.
    ///
    /// Work for one item runs strictly in arrival order; the version check in
    /// the store discards anything older than what an item already reflects.
    #[instrument(skip(self, event), fields(kind = ?event.kind(), version = event.version), level = "debug")]
    pub async fn apply(&self, event: ChangeEvent) -> ApplyReport {
        let stamp = Stamp::of(&event);
        let external = event.origin == EventOrigin::Poller;

        match event.payload {
            ChangePayload::Add { item, fields } => {
                self.apply_row(item, RowChange::Replace(fields), stamp, external)
                    .await
            }
            ChangePayload::Update { item, fields } => {
                self.apply_row(item, RowChange::Merge(fields), stamp, external)
                    .await
            }
            ChangePayload::Delete { item } => {
                self.apply_row(item, RowChange::Remove, stamp, external)
                    .await
            }
            ChangePayload::Refresh { snapshot } => {
                self.apply_refresh(snapshot, stamp, external).await
            }
            ChangePayload::BulkRelocate { items, fields }
            | ChangePayload::BulkSendOut { items, fields } => {
                self.apply_bulk(items, fields, stamp).await
            }
        }
    }

    /// Apply a batch of events targeting distinct items, in parallel.
    pub async fn apply_all(&self, events: Vec<ChangeEvent>) -> ApplyReport {
        stream::iter(events)
            .map(|event| self.apply(event))
            .buffer_unordered(self.concurrency)
            .fold(ApplyReport::default(), |mut total, report| async move {
                total.absorb(report);
                total
            })
            .await
    }

    /// Record a mutation the source accepted and reflect it locally, unless the
    /// poller already did. Returns true when the store content changed.
    pub async fn confirm(&self, mutation: &PendingMutation) -> bool {
        self.serializer
            .run(&mutation.item, self.confirm_locally(mutation))
            .await
    }

    /// Re-read one identity from its source and apply whatever the source holds.
    #[instrument(skip(self, adapter), level = "debug")]
    pub async fn resync(
        &self,
        adapter: &dyn SourceAdapter,
        key: &ItemKey,
    ) -> Result<StoreOutcome, SyncError> {
        let version = self.clock.next();
        let rows = adapter.read_all(&key.source).await?;
        let row = rows
            .into_iter()
            .find(|r| r.local_id == key.local_id)
            .map(|r| r.fields);
        let stamp = Stamp::new(version, EventOrigin::Resync);
        debug!(
            "Resync of {}: {}",
            key,
            if row.is_some() { "present" } else { "gone" }
        );
        Ok(self
            .serializer
            .run(key, self.resync_row(key, row, stamp))
            .await)
    }

    async fn resync_row(&self, key: &ItemKey, row: Option<Fields>, stamp: Stamp) -> StoreOutcome {
        match row {
            Some(fields) => self.store.upsert(key.clone(), fields, stamp),
            None => self.store.remove(key, stamp),
        }
    }

    async fn confirm_locally(&self, mutation: &PendingMutation) -> bool {
        if self.pending.complete(mutation).await == Resolution::AlreadyApplied {
            debug!("Mutation {} on {} already applied by the poller", mutation.id, mutation.item);
            return false;
        }

        let version = self.clock.next();
        let stamp = match mutation.batch_id {
            Some(batch_id) => Stamp {
                version,
                origin: EventOrigin::Bulk,
                batch_id: Some(batch_id),
            },
            None => Stamp::new(version, EventOrigin::Local),
        };
        let key = mutation.item.clone();
        let outcome = match mutation.kind {
            MutationKind::Create => self.store.upsert(key, mutation.fields.clone(), stamp),
            MutationKind::Update => self.store.merge(key, mutation.fields.clone(), stamp),
            MutationKind::Delete => self.store.remove(&key, stamp),
        };
        outcome == StoreOutcome::Applied
    }

    async fn apply_row(
        &self,
        key: ItemKey,
        change: RowChange,
        stamp: Stamp,
        external: bool,
    ) -> ApplyReport {
        self.serializer
            .run(&key, self.change_row(&key, change, stamp, external))
            .await
    }

    async fn change_row(
        &self,
        key: &ItemKey,
        change: RowChange,
        stamp: Stamp,
        external: bool,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        if external {
            // Match on the row as it would read after the change
            let observed = match &change {
                RowChange::Replace(fields) => Some(fields.clone()),
                RowChange::Merge(fields) => {
                    let mut row = self.store.get(key).map(|i| i.fields).unwrap_or_default();
                    row.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                    Some(row)
                }
                RowChange::Remove => None,
            };
            if self.pending.observe(key, observed.as_ref()).await {
                report.echoes += 1;
            }
        }

        let outcome = match change {
            RowChange::Replace(fields) => self.store.upsert(key.clone(), fields, stamp),
            RowChange::Merge(fields) => self.store.merge(key.clone(), fields, stamp),
            RowChange::Remove => self.store.remove(key, stamp),
        };
        report.record(outcome);
        report
    }

    /// Reconcile a full snapshot of one source.
    ///
    /// Every row replaces its item, except fields the item's edit session
    /// holds, which keep their local value until release. Items of the source
    /// missing from the snapshot are removed unless they are being edited.
    async fn apply_refresh(&self, snapshot: Snapshot, stamp: Stamp, external: bool) -> ApplyReport {
        let source = snapshot.source.clone();
        let stale: Vec<ItemKey> = self
            .store
            .keys_for_source(&source)
            .into_iter()
            .filter(|key| !snapshot.rows.contains_key(&key.local_id))
            .collect();

        let rows = snapshot
            .rows
            .into_iter()
            .map(|(local_id, fields)| (ItemKey::new(source.clone(), local_id), fields));

        let mut report = stream::iter(rows)
            .map(|(key, fields)| async move {
                self.serializer
                    .run(&key, self.refresh_row(&key, fields, stamp, external))
                    .await
            })
            .buffer_unordered(self.concurrency)
            .fold(ApplyReport::default(), |mut total, report| async move {
                total.absorb(report);
                total
            })
            .await;

        for key in stale {
            let removed = self
                .serializer
                .run(&key, self.refresh_absent(&key, stamp, external))
                .await;
            report.absorb(removed);
        }

        debug!(
            "Refresh of {}: {} applied, {} unchanged, {} ignored, {} fields preserved",
            source, report.applied, report.unchanged, report.ignored, report.preserved_fields
        );
        report
    }

    async fn refresh_row(
        &self,
        key: &ItemKey,
        mut fields: Fields,
        stamp: Stamp,
        external: bool,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        if external && self.pending.observe(key, Some(&fields)).await {
            report.echoes += 1;
        }

        if let Some(session) = self.held_session(key).await {
            if let Some(current) = self.store.get(key) {
                for name in &session.fields {
                    if cell(&fields, name) == cell(&current.fields, name) {
                        continue;
                    }
                    let local = current.fields.get(name);
                    if let Some(value) = local {
                        fields.insert(name.clone(), value.clone());
                    } else {
                        fields.remove(name);
                    }
                    report.preserved_fields += 1;
                }
            }
        }

        report.record(self.store.upsert(key.clone(), fields, stamp));
        report
    }

    async fn refresh_absent(&self, key: &ItemKey, stamp: Stamp, external: bool) -> ApplyReport {
        let mut report = ApplyReport::default();
        if let Some(session) = self.held_session(key).await {
            debug!("Keeping {} while {} edits it", key, session.holder);
            report.kept_locked += 1;
            return report;
        }
        if external && self.pending.observe(key, None).await {
            report.echoes += 1;
        }
        report.record(self.store.remove(key, stamp));
        report
    }

    /// Session on `key` that has written fields, if any.
    async fn held_session(&self, key: &ItemKey) -> Option<EditSession> {
        match self.locks.current(key).await {
            Ok(session) => session.filter(|s| !s.fields.is_empty()),
            Err(e) => {
                warn!("Could not read edit session of {}: {}", key, e);
                None
            }
        }
    }

    /// Per-item merge of a bulk update. Items the store does not hold are skipped.
    async fn apply_bulk(&self, items: Vec<ItemKey>, fields: Fields, stamp: Stamp) -> ApplyReport {
        let mut report = ApplyReport::default();
        for key in items {
            let one = self
                .serializer
                .run(&key, self.bulk_merge(&key, &fields, stamp))
                .await;
            report.absorb(one);
        }
        report
    }

    async fn bulk_merge(&self, key: &ItemKey, fields: &Fields, stamp: Stamp) -> ApplyReport {
        let mut report = ApplyReport::default();
        if !self.store.contains(key) {
            debug!("Skipping bulk update of missing {}", key);
            report.ignored += 1;
            return report;
        }
        report.record(self.store.merge(key.clone(), fields.clone(), stamp));
        report
    }
}
