//! The synchronization engine facade.
//!
//! Wires the Item Store, edit locks, pollers, reconciler, retry controller and
//! bulk orchestrator together and exposes the request/response surface used
//! by the UI layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use inventory_sync_core::{
    AcquireOutcome, ChangeEvent, EditLockManager, EditSession, Fields, Item, ItemKey,
    MutationKind, PendingMutation, ReleaseOutcome, SourceAdapter, SyncError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::broadcast::{Broadcaster, Subscription};
use crate::bulk::{BulkOperation, BulkOrchestrator, BulkReport};
use crate::clock::VersionClock;
use crate::config::EngineConfig;
use crate::lock::MemoryLockManager;
use crate::pending::PendingTracker;
use crate::poller::ChangePoller;
use crate::reconcile::{ApplyReport, Reconciler};
use crate::retry::{RetryController, RetryPolicy};
use crate::serial::KeyedSerializer;
use crate::status::{SourceStatus, SyncStatusTracker};
use crate::store::{ItemFilter, ItemStore};
use crate::suppression::SuppressionSet;

/// One registered authoritative source.
#[derive(Clone)]
pub struct SourceHandle {
    pub name: String,
    pub adapter: Arc<dyn SourceAdapter>,
    pub poller: Arc<ChangePoller>,
}

pub type SourceMap = BTreeMap<String, SourceHandle>;

/// A client write request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRequest {
    pub source: String,
    /// Required for updates and deletes; generated for creates when absent
    #[serde(default)]
    pub local_id: Option<String>,
    pub kind: MutationKind,
    #[serde(default)]
    pub fields: Fields,
    pub holder: String,
    /// Close the holder's edit session once the write is saved
    #[serde(default)]
    pub release_after: bool,
}

/// Confirmation of a saved mutation.
#[derive(Debug, Clone, Serialize)]
pub struct MutationReceipt {
    pub item: ItemKey,
    pub mutation_id: Uuid,
    pub attempts: u32,
    /// False when the poller had already brought the change in
    pub applied: bool,
    /// Item as held by the store after the write (`None` after a delete)
    pub item_state: Option<Item>,
}

pub struct SyncEngineBuilder {
    config: EngineConfig,
    sources: Vec<(String, Arc<dyn SourceAdapter>)>,
    locks: Option<Arc<dyn EditLockManager>>,
}

impl SyncEngineBuilder {
    /// Register an authoritative source under `name`.
    pub fn source(mut self, name: impl Into<String>, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push((name.into(), adapter));
        self
    }

    /// Use a custom edit lock manager instead of the in-memory one.
    pub fn lock_manager(mut self, locks: Arc<dyn EditLockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn build(self) -> Result<SyncEngine, SyncError> {
        if self.sources.is_empty() {
            return Err(SyncError::InvalidArgument(
                "at least one source is required".to_string(),
            ));
        }

        let config = self.config;
        let clock = Arc::new(VersionClock::new());
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast_capacity));
        let store = Arc::new(ItemStore::new(broadcaster.clone()));
        let locks: Arc<dyn EditLockManager> = match self.locks {
            Some(locks) => locks,
            None => Arc::new(MemoryLockManager::new()),
        };
        let pending = Arc::new(PendingTracker::new(config.echo_window()));
        let suppression = SuppressionSet::new(config.suppression_timeout());
        let status = Arc::new(SyncStatusTracker::new());

        let mut sources = SourceMap::new();
        for (name, adapter) in self.sources {
            if name.trim().is_empty() {
                return Err(SyncError::InvalidArgument(
                    "source name must not be empty".to_string(),
                ));
            }
            if sources.contains_key(&name) {
                return Err(SyncError::InvalidArgument(format!(
                    "source {} registered twice",
                    name
                )));
            }
            status.register(&name, adapter.backend_name());
            let poller = Arc::new(ChangePoller::new(
                name.clone(),
                adapter.clone(),
                clock.clone(),
                suppression.clone(),
                status.clone(),
                config.mass_delete_threshold,
                config.refresh_every,
            ));
            sources.insert(
                name.clone(),
                SourceHandle {
                    name,
                    adapter,
                    poller,
                },
            );
        }
        let sources = Arc::new(sources);

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            locks.clone(),
            pending.clone(),
            clock.clone(),
            config.bulk_concurrency,
        ));
        let retry = Arc::new(RetryController::new(
            RetryPolicy::from_config(&config),
            suppression.clone(),
            pending.clone(),
        ));
        let bulk = BulkOrchestrator::new(
            sources.clone(),
            reconciler.clone(),
            retry.clone(),
            pending.clone(),
            suppression,
            clock.clone(),
            config.mutation_deadline(),
            config.bulk_concurrency,
        );

        info!(
            "Sync engine ready with {} sources: {}",
            sources.len(),
            sources.keys().cloned().collect::<Vec<_>>().join(", ")
        );

        Ok(SyncEngine {
            config,
            clock,
            broadcaster,
            store,
            locks,
            pending,
            status,
            reconciler,
            retry,
            bulk,
            sources,
            mutation_lanes: KeyedSerializer::new(),
        })
    }
}

/// Keeps the Item Store consistent with its authoritative sources and the
/// mutations of connected clients.
pub struct SyncEngine {
    config: EngineConfig,
    clock: Arc<VersionClock>,
    broadcaster: Arc<Broadcaster>,
    store: Arc<ItemStore>,
    locks: Arc<dyn EditLockManager>,
    pending: Arc<PendingTracker>,
    status: Arc<SyncStatusTracker>,
    reconciler: Arc<Reconciler>,
    retry: Arc<RetryController>,
    bulk: BulkOrchestrator,
    sources: Arc<SourceMap>,
    mutation_lanes: KeyedSerializer,
}

impl SyncEngine {
    pub fn builder(config: EngineConfig) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            sources: Vec::new(),
            locks: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    fn source(&self, name: &str) -> Result<&SourceHandle, SyncError> {
        self.sources
            .get(name)
            .ok_or_else(|| SyncError::UnknownSource(name.to_string()))
    }

    /// Start one poller per source. They stop when `shutdown` turns true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.sources
            .values()
            .map(|handle| {
                handle.poller.clone().spawn(
                    self.config.poll_interval(),
                    self.reconciler.clone(),
                    shutdown.clone(),
                )
            })
            .collect()
    }

    /// Observe committed changes, in commit order.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.broadcaster.observer_count()
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn acquire_edit(
        &self,
        item: &ItemKey,
        holder: &str,
    ) -> Result<AcquireOutcome, SyncError> {
        self.source(&item.source)?;
        validate_holder(holder)?;
        self.locks.acquire(item, holder, self.config.edit_ttl()).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn release_edit(
        &self,
        item: &ItemKey,
        holder: &str,
    ) -> Result<ReleaseOutcome, SyncError> {
        self.locks.release(item, holder).await
    }

    /// Write through to the authoritative source, then reflect the change locally.
    ///
    /// The holder must own the item's edit session or the item must be free, in
    /// which case a session is taken for the duration of the write. Writes to
    /// one item run one at a time, in arrival order. A `NotFound` from the
    /// source resyncs that identity before it is returned.
    #[instrument(skip(self, request), fields(source = %request.source, kind = ?request.kind, holder = %request.holder), level = "debug")]
    pub async fn submit_mutation(
        &self,
        request: MutationRequest,
    ) -> Result<MutationReceipt, SyncError> {
        let handle = self.source(&request.source)?;
        validate_holder(&request.holder)?;

        let local_id = match (request.kind, request.local_id) {
            (_, Some(id)) if !id.trim().is_empty() => id,
            (MutationKind::Create, _) => Uuid::new_v4().to_string(),
            (kind, _) => {
                return Err(SyncError::InvalidArgument(format!(
                    "{:?} needs a local_id",
                    kind
                )))
            }
        };
        if request.kind != MutationKind::Delete && request.fields.is_empty() {
            return Err(SyncError::InvalidArgument(
                "mutation has no fields".to_string(),
            ));
        }
        let key = ItemKey::new(request.source.clone(), local_id);
        let fields = match request.kind {
            MutationKind::Delete => Fields::new(),
            _ => request.fields,
        };
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.config.mutation_deadline())
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let mutation = PendingMutation::new(key.clone(), request.kind, fields, deadline)
            .with_holder(&request.holder);

        // Another holder's session fails fast instead of queueing
        self.check_holder(&key, &request.holder).await?;
        self.mutation_lanes
            .run(
                &key,
                self.write_through(handle, mutation, &request.holder, request.release_after),
            )
            .await
    }

    async fn write_through(
        &self,
        handle: &SourceHandle,
        mut mutation: PendingMutation,
        holder: &str,
        release_after: bool,
    ) -> Result<MutationReceipt, SyncError> {
        let key = mutation.item.clone();
        let mut claim = self.claim(&key, holder).await?;
        let tracked = self.pending.track(mutation.clone());

        let result = match self.retry.submit(handle.adapter.as_ref(), &mut mutation).await {
            Ok(()) => Ok(self.reconciler.confirm(&mutation).await),
            Err(SyncError::NotFound(_)) => {
                drop(tracked);
                info!("{} vanished upstream, resyncing", key);
                if let Err(e) = self.reconciler.resync(handle.adapter.as_ref(), &key).await {
                    warn!("Resync of {} failed: {}", key, e);
                }
                Err(SyncError::NotFound(key.to_string()))
            }
            Err(e) => {
                drop(tracked);
                Err(e)
            }
        };

        let deleted = result.is_ok() && mutation.is_delete();
        if claim.is_implicit() || release_after || deleted {
            claim.disarm();
            if let Err(e) = self.locks.release(&key, holder).await {
                warn!("Release of {} by {} failed: {}", key, holder, e);
            }
        } else if result.is_ok() {
            let written: Vec<String> = mutation.fields.keys().cloned().collect();
            let ttl = self.config.edit_ttl();
            if let Err(e) = self.locks.touch(&key, holder, ttl, &written).await {
                warn!("Renewal of {} for {} failed: {}", key, holder, e);
            }
        }

        let applied = result?;
        debug!(
            "Mutation {} on {} saved after {} attempts",
            mutation.id, key, mutation.attempts
        );
        Ok(MutationReceipt {
            item_state: self.store.get(&key),
            item: key,
            mutation_id: mutation.id,
            attempts: mutation.attempts,
            applied,
        })
    }

    async fn check_holder(&self, key: &ItemKey, holder: &str) -> Result<(), SyncError> {
        match self.locks.current(key).await? {
            Some(session) if session.holder != holder => Err(SyncError::Conflict {
                item: key.clone(),
                holder: session.holder,
            }),
            _ => Ok(()),
        }
    }

    /// Make sure `holder` may write `key`, opening a session for this write
    /// alone when the item is free.
    async fn claim(&self, key: &ItemKey, holder: &str) -> Result<Claim, SyncError> {
        if let Some(session) = self.locks.current(key).await? {
            if session.holder != holder {
                return Err(SyncError::Conflict {
                    item: key.clone(),
                    holder: session.holder,
                });
            }
            return Ok(Claim::held());
        }
        match self.locks.acquire(key, holder, self.config.edit_ttl()).await? {
            AcquireOutcome::Granted { .. } => Ok(Claim::opened(
                self.locks.clone(),
                key.clone(),
                holder.to_string(),
            )),
            AcquireOutcome::Conflict { holder, .. } => Err(SyncError::Conflict {
                item: key.clone(),
                holder,
            }),
        }
    }

    pub async fn run_bulk(
        &self,
        operation: &BulkOperation,
        items: Vec<ItemKey>,
    ) -> Result<BulkReport, SyncError> {
        self.bulk.run(operation, items).await
    }

    /// Run one poll cycle of `source` and apply what it found.
    pub async fn poll(&self, source: &str) -> Result<ApplyReport, SyncError> {
        let handle = self.source(source)?;
        let events = handle.poller.poll_once().await;
        Ok(self.reconciler.apply_all(events).await)
    }

    /// Re-read `source` in full and reconcile the store against it.
    pub async fn refresh(&self, source: &str) -> Result<ApplyReport, SyncError> {
        let handle = self.source(source)?;
        let event = handle.poller.refresh().await?;
        Ok(self.reconciler.apply(event).await)
    }

    /// Apply an externally built change event.
    pub async fn apply(&self, event: ChangeEvent) -> ApplyReport {
        self.reconciler.apply(event).await
    }

    pub fn item(&self, key: &ItemKey) -> Option<Item> {
        self.store.get(key)
    }

    pub fn items(&self, filter: Option<&ItemFilter>) -> Vec<Item> {
        self.store.list(filter)
    }

    pub async fn edit_sessions(&self) -> Result<Vec<EditSession>, SyncError> {
        self.locks.sessions().await
    }

    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.pending.list()
    }

    pub fn sync_status(&self) -> Vec<SourceStatus> {
        self.status.all()
    }

    /// Number of content changes applied to `key`.
    pub fn revisions(&self, key: &ItemKey) -> u64 {
        self.store.revisions(key)
    }

    pub fn total_revisions(&self) -> u64 {
        self.store.total_revisions()
    }

    /// Latest version stamp handed out.
    pub fn version(&self) -> u64 {
        self.clock.current()
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.policy().max_attempts
    }
}

/// The right to write one item for the duration of a mutation.
///
/// An implicit claim owns a session opened just for the write; if the write
/// is dropped before it finishes, the session is released in the background.
struct Claim {
    implicit: Option<ImplicitSession>,
}

struct ImplicitSession {
    locks: Arc<dyn EditLockManager>,
    key: ItemKey,
    holder: String,
}

impl Claim {
    fn held() -> Self {
        Self { implicit: None }
    }

    fn opened(locks: Arc<dyn EditLockManager>, key: ItemKey, holder: String) -> Self {
        Self {
            implicit: Some(ImplicitSession { locks, key, holder }),
        }
    }

    fn is_implicit(&self) -> bool {
        self.implicit.is_some()
    }

    /// The caller releases the session itself.
    fn disarm(&mut self) {
        self.implicit = None;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let Some(session) = self.implicit.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to release {} for {}", session.key, session.holder);
            return;
        };
        debug!("Releasing abandoned session on {} for {}", session.key, session.holder);
        runtime.spawn(async move {
            if let Err(e) = session.locks.release(&session.key, &session.holder).await {
                warn!("Release of {} by {} failed: {}", session.key, session.holder, e);
            }
        });
    }
}

fn validate_holder(holder: &str) -> Result<(), SyncError> {
    if holder.trim().is_empty() {
        return Err(SyncError::InvalidArgument(
            "holder must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Notification;
    use crate::source::MemorySource;
    use inventory_sync_core::{RawRow, WriteOutcome};
    use std::time::Duration;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            refresh_every: 0,
            ..EngineConfig::default()
        }
    }

    async fn engine_with(source: Arc<MemorySource>) -> SyncEngine {
        let engine = SyncEngine::builder(config())
            .source("source1", source)
            .build()
            .unwrap();
        engine.poll("source1").await.unwrap();
        engine
    }

    fn gloves() -> Arc<MemorySource> {
        Arc::new(MemorySource::new().with_rows(
            "source1",
            vec![
                RawRow::new("41", fields(&[("name", "Tape"), ("quantity", "12")])),
                RawRow::new("42", fields(&[("name", "Gloves"), ("quantity", "3")])),
            ],
        ))
    }

    fn update(id: &str, holder: &str, pairs: &[(&str, &str)]) -> MutationRequest {
        MutationRequest {
            source: "source1".into(),
            local_id: Some(id.into()),
            kind: MutationKind::Update,
            fields: fields(pairs),
            holder: holder.into(),
            release_after: false,
        }
    }

    fn delete(id: &str, holder: &str) -> MutationRequest {
        MutationRequest {
            kind: MutationKind::Delete,
            fields: Fields::new(),
            ..update(id, holder, &[])
        }
    }

    #[tokio::test]
    async fn test_two_clients_edit_same_item() {
        let engine = engine_with(gloves()).await;
        let key = ItemKey::new("source1", "42");

        assert!(engine.acquire_edit(&key, "A").await.unwrap().is_granted());
        match engine.acquire_edit(&key, "B").await.unwrap() {
            AcquireOutcome::Conflict { holder, .. } => assert_eq!(holder, "A"),
            other => panic!("expected conflict, got {:?}", other),
        }

        let mut save = update("42", "A", &[("quantity", "7")]);
        save.release_after = true;
        engine.submit_mutation(save).await.unwrap();

        assert!(engine.acquire_edit(&key, "B").await.unwrap().is_granted());
        assert_eq!(engine.item(&key).unwrap().field("quantity"), Some("7"));
    }

    #[tokio::test]
    async fn test_conflicting_mutation_is_surfaced_not_queued() {
        let source = gloves();
        let engine = engine_with(source.clone()).await;
        let key = ItemKey::new("source1", "42");
        engine.acquire_edit(&key, "A").await.unwrap();

        let err = engine
            .submit_mutation(update("42", "B", &[("quantity", "1")]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::Conflict {
                item: key.clone(),
                holder: "A".into()
            }
        );
        assert_eq!(source.attempts(&key), 0);
        assert_eq!(engine.edit_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_save_and_poller_echo_apply_once() {
        let engine = engine_with(gloves()).await;
        let key = ItemKey::new("source1", "42");
        let before = engine.revisions(&key);

        let receipt = engine
            .submit_mutation(update("42", "A", &[("quantity", "7")]))
            .await
            .unwrap();
        assert!(receipt.applied);
        assert_eq!(receipt.attempts, 1);
        assert_eq!(engine.revisions(&key), before + 1);

        // The poller now reads the same change from the source
        let report = engine.poll("source1").await.unwrap();
        assert_eq!(report.echoes, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(engine.revisions(&key), before + 1);
        assert!(engine.pending_mutations().is_empty());
    }

    #[tokio::test]
    async fn test_save_renews_session_and_holds_fields() {
        let source = gloves();
        let engine = engine_with(source.clone()).await;
        let key = ItemKey::new("source1", "42");
        engine.acquire_edit(&key, "A").await.unwrap();

        engine
            .submit_mutation(update("42", "A", &[("quantity", "7")]))
            .await
            .unwrap();
        let sessions = engine.edit_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].holds_field("quantity"));

        // A direct spreadsheet edit does not override the held field
        source.set_row(
            "source1",
            "42",
            fields(&[("name", "Nitrile gloves"), ("quantity", "9")]),
        );
        engine.refresh("source1").await.unwrap();
        let item = engine.item(&key).unwrap();
        assert_eq!(item.field("quantity"), Some("7"));
        assert_eq!(item.field("name"), Some("Nitrile gloves"));
    }

    #[tokio::test]
    async fn test_implicit_session_is_released() {
        let engine = engine_with(gloves()).await;
        engine
            .submit_mutation(update("41", "A", &[("quantity", "11")]))
            .await
            .unwrap();
        assert!(engine.edit_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_delete_partial_failure() {
        let source = Arc::new(MemorySource::new().with_rows(
            "source1",
            (1..=5)
                .map(|i| RawRow::new(i.to_string(), fields(&[("name", "item")])))
                .collect(),
        ));
        let engine = engine_with(source.clone()).await;
        let third = ItemKey::new("source1", "3");
        source.script(&third, [WriteOutcome::Failure("protected row".into())]);

        let items: Vec<ItemKey> = (1..=5)
            .map(|i| ItemKey::new("source1", i.to_string()))
            .collect();
        let report = engine
            .run_bulk(&BulkOperation::Delete, items)
            .await
            .unwrap();

        assert_eq!(report.succeeded.len(), 4);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].item, third);
        assert!(report.failed[0].reason.contains("protected row"));
        assert_eq!(report.refreshed_sources, vec!["source1".to_string()]);

        for i in [1, 2, 4, 5] {
            assert!(engine.item(&ItemKey::new("source1", i.to_string())).is_none());
        }
        assert!(engine.item(&third).is_some());
        assert_eq!(source.rows("source1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bulk_delete_stops_suppressing_before_group_ends() {
        let source = Arc::new(MemorySource::new().with_rows(
            "source1",
            (1..=3)
                .map(|i| RawRow::new(i.to_string(), fields(&[("name", "item")])))
                .collect(),
        ));
        let engine = Arc::new(engine_with(source.clone()).await);
        let first = ItemKey::new("source1", "1");
        let slow = ItemKey::new("source1", "2");
        source.script(&first, [WriteOutcome::Failure("protected row".into())]);
        source.script(
            &slow,
            [WriteOutcome::RateLimited {
                retry_after: Duration::from_millis(500),
            }],
        );

        let bulk = tokio::spawn({
            let engine = Arc::clone(&engine);
            let items = vec![first.clone(), slow.clone()];
            async move { engine.run_bulk(&BulkOperation::Delete, items).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Someone deletes the failed row by hand while the slow one still waits
        source.remove_row("source1", "1");
        let report = engine.poll("source1").await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(engine.item(&first).is_none());
        assert!(engine.item(&slow).is_some());

        let report = bulk.await.unwrap().unwrap();
        assert_eq!(report.succeeded, vec![slow.clone()]);
        assert_eq!(report.failed[0].item, first);
        assert!(engine.item(&slow).is_none());
        assert!(engine.pending_mutations().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_relocate_shares_batch_id() {
        let source = gloves();
        let engine = engine_with(source.clone()).await;
        let mut sub = engine.subscribe();

        let report = engine
            .run_bulk(
                &BulkOperation::Relocate {
                    location: "B7".into(),
                },
                vec![
                    ItemKey::new("source1", "41"),
                    ItemKey::new("source1", "42"),
                    ItemKey::new("source1", "42"),
                    ItemKey::new("elsewhere", "1"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].item.source, "elsewhere");
        assert_eq!(source.row("source1", "41").unwrap()["location"], "B7");

        for _ in 0..2 {
            match sub.recv().await {
                Some(Notification::Event(committed)) => {
                    assert_eq!(committed.event.batch_id, Some(report.batch_id));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            engine
                .item(&ItemKey::new("source1", "42"))
                .unwrap()
                .field("location"),
            Some("B7")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_fails_after_two_attempts() {
        let source = gloves();
        let engine = engine_with(source.clone()).await;
        let key = ItemKey::new("source1", "42");
        let limited = WriteOutcome::RateLimited {
            retry_after: Duration::from_millis(500),
        };
        source.script(&key, [limited.clone(), limited]);

        let err = engine
            .submit_mutation(update("42", "A", &[("quantity", "7")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(source.attempts(&key), 2);
        assert_eq!(engine.max_attempts(), 2);
        assert_eq!(engine.item(&key).unwrap().field("quantity"), Some("3"));
        assert!(engine.pending_mutations().is_empty());
        assert!(engine.edit_sessions().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_submit_leaves_nothing_behind() {
        let source = gloves();
        let engine = Arc::new(engine_with(source.clone()).await);
        let key = ItemKey::new("source1", "42");
        source.script(
            &key,
            [WriteOutcome::RateLimited {
                retry_after: Duration::from_millis(500),
            }],
        );

        let submit = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.submit_mutation(update("42", "A", &[("quantity", "7")])).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.pending_mutations().len(), 1);
        assert_eq!(engine.edit_sessions().await.unwrap().len(), 1);

        submit.abort();
        assert!(submit.await.unwrap_err().is_cancelled());
        assert!(engine.pending_mutations().is_empty());

        // The implicit session is released in the background
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.edit_sessions().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(engine.pending_mutations().is_empty());
        assert_eq!(source.attempts(&key), 1);
        assert_eq!(engine.item(&key).unwrap().field("quantity"), Some("3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_holder_writes_to_free_item_run_in_order() {
        let source = gloves();
        let engine = engine_with(source.clone()).await;
        let key = ItemKey::new("source1", "41");
        // Slow the first write down so the second arrives while it is in flight
        source.script(
            &key,
            [WriteOutcome::RateLimited {
                retry_after: Duration::from_millis(200),
            }],
        );

        let (first, second) = tokio::join!(
            engine.submit_mutation(update("41", "A", &[("quantity", "11")])),
            engine.submit_mutation(update("41", "A", &[("quantity", "10")])),
        );
        assert_eq!(first.unwrap().attempts, 2);
        assert_eq!(second.unwrap().attempts, 1);

        assert_eq!(source.attempts(&key), 3);
        assert_eq!(source.row("source1", "41").unwrap()["quantity"], "10");
        assert_eq!(engine.item(&key).unwrap().field("quantity"), Some("10"));
        assert!(engine.edit_sessions().await.unwrap().is_empty());
        assert!(engine.pending_mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_holder_is_refused_while_write_queued() {
        let source = gloves();
        let engine = engine_with(source.clone()).await;
        let key = ItemKey::new("source1", "41");
        source.script(
            &key,
            [WriteOutcome::RateLimited {
                retry_after: Duration::from_millis(200),
            }],
        );

        let (first, second) = tokio::join!(
            engine.submit_mutation(update("41", "A", &[("quantity", "11")])),
            engine.submit_mutation(update("41", "B", &[("quantity", "10")])),
        );
        assert!(first.is_ok());
        assert_eq!(
            second.unwrap_err(),
            SyncError::Conflict {
                item: key.clone(),
                holder: "A".into()
            }
        );
        assert_eq!(source.row("source1", "41").unwrap()["quantity"], "11");
    }

    #[tokio::test]
    async fn test_not_found_resyncs_identity() {
        let source = gloves();
        let engine = engine_with(source.clone()).await;
        let key = ItemKey::new("source1", "42");
        source.remove_row("source1", "42");

        let err = engine
            .submit_mutation(update("42", "A", &[("quantity", "7")]))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::NotFound("source1/42".into()));
        assert!(engine.item(&key).is_none());
        assert!(engine.item(&ItemKey::new("source1", "41")).is_some());
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_delete_releases() {
        let source = gloves();
        let engine = engine_with(source.clone()).await;

        let receipt = engine
            .submit_mutation(MutationRequest {
                local_id: None,
                kind: MutationKind::Create,
                ..update("", "A", &[("name", "Masking tape"), ("quantity", "4")])
            })
            .await
            .unwrap();
        let key = receipt.item.clone();
        assert!(!key.local_id.is_empty());
        assert_eq!(receipt.item_state.unwrap().field("name"), Some("Masking tape"));
        assert!(source.row("source1", &key.local_id).is_some());

        engine.acquire_edit(&key, "A").await.unwrap();
        let receipt = engine
            .submit_mutation(delete(&key.local_id, "A"))
            .await
            .unwrap();
        assert!(receipt.item_state.is_none());
        assert!(engine.edit_sessions().await.unwrap().is_empty());
        assert!(source.row("source1", &key.local_id).is_none());
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let engine = engine_with(gloves()).await;

        let mut unknown = update("42", "A", &[("quantity", "1")]);
        unknown.source = "nowhere".into();
        assert_eq!(
            engine.submit_mutation(unknown).await.unwrap_err(),
            SyncError::UnknownSource("nowhere".into())
        );

        let mut no_id = update("42", "A", &[("quantity", "1")]);
        no_id.local_id = None;
        assert!(matches!(
            engine.submit_mutation(no_id).await,
            Err(SyncError::InvalidArgument(_))
        ));

        assert!(matches!(
            engine.submit_mutation(update("42", "A", &[])).await,
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.acquire_edit(&ItemKey::new("source1", "42"), " ").await,
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_builder_rejects_duplicate_sources() {
        let source: Arc<dyn SourceAdapter> = Arc::new(MemorySource::new());
        let result = SyncEngine::builder(config())
            .source("a", source.clone())
            .source("a", source)
            .build();
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
        assert!(matches!(
            SyncEngine::builder(config()).build(),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_pollers_run_until_shutdown() {
        let source = gloves();
        let engine = SyncEngine::builder(EngineConfig {
            poll_interval_ms: 10,
            ..config()
        })
        .source("source1", source.clone())
        .build()
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = engine.start(shutdown_rx);
        assert_eq!(handles.len(), 1);

        let key = ItemKey::new("source1", "43");
        source.set_row("source1", "43", fields(&[("name", "Labels")]));
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.item(&key).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poller never picked up the new row");

        assert!(engine.sync_status()[0].last_polled_at.is_some());
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("poller did not stop")
                .unwrap();
        }
    }
}
