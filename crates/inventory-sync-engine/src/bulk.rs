//! Multi-item operations with per-item success accounting.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use inventory_sync_core::{
    columns, BatchOp, ChangeEvent, ChangePayload, EventOrigin, Fields, ItemKey, MutationKind,
    PendingMutation, SyncError, WriteOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::VersionClock;
use crate::engine::{SourceHandle, SourceMap};
use crate::pending::{PendingGuard, PendingTracker};
use crate::reconcile::Reconciler;
use crate::retry::RetryController;
use crate::suppression::SuppressionSet;

/// Value written to the status column by a send-out.
pub const SENT_OUT: &str = "sent_out";

/// What a bulk run does to each item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BulkOperation {
    Delete,
    Relocate {
        location: String,
    },
    /// Mark items as shipped to `destination`; `sent_at` defaults to today
    SendOut {
        destination: String,
        #[serde(default)]
        sent_at: Option<String>,
    },
}

impl BulkOperation {
    pub fn name(&self) -> &'static str {
        match self {
            BulkOperation::Delete => "delete",
            BulkOperation::Relocate { .. } => "relocate",
            BulkOperation::SendOut { .. } => "send_out",
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        match self {
            BulkOperation::Relocate { location } if location.trim().is_empty() => Err(
                SyncError::InvalidArgument("relocate needs a location".to_string()),
            ),
            BulkOperation::SendOut { destination, .. } if destination.trim().is_empty() => Err(
                SyncError::InvalidArgument("send-out needs a destination".to_string()),
            ),
            _ => Ok(()),
        }
    }

    fn mutation_kind(&self) -> MutationKind {
        match self {
            BulkOperation::Delete => MutationKind::Delete,
            _ => MutationKind::Update,
        }
    }

    /// Fields written to every item.
    pub fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        match self {
            BulkOperation::Delete => {}
            BulkOperation::Relocate { location } => {
                fields.insert(columns::LOCATION.to_string(), location.clone());
            }
            BulkOperation::SendOut {
                destination,
                sent_at,
            } => {
                let sent_at = sent_at
                    .clone()
                    .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
                fields.insert(columns::STATUS.to_string(), SENT_OUT.to_string());
                fields.insert(columns::DESTINATION.to_string(), destination.clone());
                fields.insert(columns::SENT_AT.to_string(), sent_at);
            }
        }
        fields
    }

    fn batch_op(&self, local_id: &str, fields: &Fields) -> BatchOp {
        match self {
            BulkOperation::Delete => BatchOp::Delete {
                id: local_id.to_string(),
            },
            _ => BatchOp::Write {
                id: local_id.to_string(),
                fields: fields.clone(),
            },
        }
    }

    fn change(&self, items: Vec<ItemKey>, fields: Fields) -> Option<ChangePayload> {
        match self {
            BulkOperation::Delete => None,
            BulkOperation::Relocate { .. } => Some(ChangePayload::BulkRelocate { items, fields }),
            BulkOperation::SendOut { .. } => Some(ChangePayload::BulkSendOut { items, fields }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    pub item: ItemKey,
    pub reason: String,
}

/// Partitioned result of a bulk run.
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub batch_id: Uuid,
    pub succeeded: Vec<ItemKey>,
    pub failed: Vec<BulkFailure>,
    /// Sources re-read after the batch
    pub refreshed_sources: Vec<String>,
}

impl BulkReport {
    fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            succeeded: Vec::new(),
            failed: Vec::new(),
            refreshed_sources: Vec::new(),
        }
    }

    fn fail(&mut self, item: ItemKey, error: &SyncError) {
        self.failed.push(BulkFailure {
            item,
            reason: error.to_string(),
        });
    }
}

/// Runs a bulk operation as independent per-item mutations.
///
/// Items bypass edit sessions. The first attempt for each source goes out as
/// one batch write; rate-limited items then go through the retry controller
/// individually. A failed item never aborts the rest, and every touched
/// source is re-read afterwards so the store converges on what the source
/// really holds.
pub struct BulkOrchestrator {
    sources: Arc<SourceMap>,
    reconciler: Arc<Reconciler>,
    retry: Arc<RetryController>,
    pending: Arc<PendingTracker>,
    suppression: SuppressionSet,
    clock: Arc<VersionClock>,
    deadline: Duration,
    concurrency: usize,
}

impl BulkOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sources: Arc<SourceMap>,
        reconciler: Arc<Reconciler>,
        retry: Arc<RetryController>,
        pending: Arc<PendingTracker>,
        suppression: SuppressionSet,
        clock: Arc<VersionClock>,
        deadline: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            sources,
            reconciler,
            retry,
            pending,
            suppression,
            clock,
            deadline,
            concurrency: concurrency.max(1),
        }
    }

    #[instrument(skip(self, items), fields(op = operation.name(), count = items.len()), level = "debug")]
    pub async fn run(
        &self,
        operation: &BulkOperation,
        items: Vec<ItemKey>,
    ) -> Result<BulkReport, SyncError> {
        operation.validate()?;

        let batch_id = Uuid::new_v4();
        let fields = operation.fields();
        let mut report = BulkReport::new(batch_id);

        let mut seen = HashSet::new();
        let mut by_source: BTreeMap<String, Vec<ItemKey>> = BTreeMap::new();
        for key in items {
            if seen.insert(key.clone()) {
                by_source.entry(key.source.clone()).or_default().push(key);
            }
        }
        info!(
            "Bulk {} {}: {} items across {} sources",
            operation.name(),
            batch_id,
            seen.len(),
            by_source.len()
        );

        let mut touched: Vec<&SourceHandle> = Vec::new();
        for (source, keys) in by_source {
            let Some(handle) = self.sources.get(&source) else {
                let error = SyncError::UnknownSource(source.clone());
                for key in keys {
                    report.fail(key, &error);
                }
                continue;
            };

            let (confirmed, tracked): (Vec<PendingMutation>, Vec<PendingGuard>) = self
                .run_source(handle, operation, &fields, &keys, batch_id, &mut report)
                .await
                .into_iter()
                .unzip();
            self.apply_confirmed(operation, &fields, confirmed, batch_id)
                .await;
            drop(tracked);
            touched.push(handle);
        }

        for handle in touched {
            match handle.poller.refresh().await {
                Ok(event) => {
                    self.reconciler.apply(event).await;
                    report.refreshed_sources.push(handle.name.clone());
                }
                Err(e) => warn!("Post-batch refresh of {} failed: {}", handle.name, e),
            }
        }

        report.succeeded.sort();
        report.failed.sort_by(|a, b| a.item.cmp(&b.item));
        info!(
            "Bulk {} {} done: {} succeeded, {} failed",
            operation.name(),
            batch_id,
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Push one source's share of the batch and settle every item.
    ///
    /// Each item is released from delete suppression as soon as it settles.
    /// Failed items are abandoned right away; accepted ones come back still
    /// tracked so their echo is recognised until they are applied.
    async fn run_source(
        &self,
        handle: &SourceHandle,
        operation: &BulkOperation,
        fields: &Fields,
        keys: &[ItemKey],
        batch_id: Uuid,
        report: &mut BulkReport,
    ) -> Vec<(PendingMutation, PendingGuard)> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.deadline)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let kind = operation.mutation_kind();

        let mut mutations = Vec::with_capacity(keys.len());
        let mut tracked = Vec::with_capacity(keys.len());
        let mut ops = Vec::with_capacity(keys.len());
        for key in keys {
            let mut mutation = PendingMutation::new(key.clone(), kind, fields.clone(), deadline)
                .with_batch(batch_id);
            if kind == MutationKind::Delete {
                self.suppression.suppress(key.clone()).await;
            }
            tracked.push(self.pending.track(mutation.clone()));
            self.retry.record_attempt(&mut mutation);
            ops.push(operation.batch_op(&key.local_id, fields));
            mutations.push(mutation);
        }

        let mut outcomes = handle.adapter.batch_write(&handle.name, &ops).await;
        if outcomes.len() != ops.len() {
            warn!(
                "Batch write to {} returned {} results for {} ops",
                handle.name,
                outcomes.len(),
                ops.len()
            );
            let reason = format!("batch returned {} results for {} ops", outcomes.len(), ops.len());
            outcomes = vec![WriteOutcome::Failure(reason); ops.len()];
        }

        let adapter = handle.adapter.as_ref();
        let settled: Vec<(PendingMutation, Result<PendingGuard, SyncError>)> =
            stream::iter(mutations.into_iter().zip(tracked).zip(outcomes))
                .map(|((mut mutation, guard), outcome)| async move {
                    let result = match self.retry.settle(adapter, &mut mutation, outcome).await {
                        Ok(()) => Ok(guard),
                        Err(e) => {
                            debug!("Bulk item {} failed: {}", mutation.item, e);
                            drop(guard);
                            Err(e)
                        }
                    };
                    if mutation.is_delete() {
                        self.suppression.release(&mutation.item).await;
                    }
                    (mutation, result)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut confirmed = Vec::new();
        for (mutation, result) in settled {
            match result {
                Ok(guard) => {
                    report.succeeded.push(mutation.item.clone());
                    confirmed.push((mutation, guard));
                }
                Err(e) => report.fail(mutation.item, &e),
            }
        }
        confirmed
    }

    /// Reflect the items the source accepted in the store.
    async fn apply_confirmed(
        &self,
        operation: &BulkOperation,
        fields: &Fields,
        confirmed: Vec<PendingMutation>,
        batch_id: Uuid,
    ) {
        if confirmed.is_empty() {
            return;
        }
        for mutation in &confirmed {
            if operation.mutation_kind() == MutationKind::Delete {
                self.reconciler.confirm(mutation).await;
            } else {
                self.pending.complete(mutation).await;
            }
        }

        let items = confirmed.into_iter().map(|m| m.item).collect();
        if let Some(payload) = operation.change(items, fields.clone()) {
            let event =
                ChangeEvent::new(payload, EventOrigin::Bulk, self.clock.next()).with_batch(batch_id);
            self.reconciler.apply(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_wire_format() {
        let op: BulkOperation =
            serde_json::from_str(r#"{"kind":"relocate","location":"B7"}"#).unwrap();
        assert_eq!(
            op,
            BulkOperation::Relocate {
                location: "B7".into()
            }
        );
        let op: BulkOperation =
            serde_json::from_str(r#"{"kind":"send_out","destination":"Lyon"}"#).unwrap();
        assert_eq!(op.name(), "send_out");
        let op: BulkOperation = serde_json::from_str(r#"{"kind":"delete"}"#).unwrap();
        assert!(op.fields().is_empty());
    }

    #[test]
    fn test_send_out_fields() {
        let op = BulkOperation::SendOut {
            destination: "Lyon".into(),
            sent_at: Some("2024-03-01".into()),
        };
        let fields = op.fields();
        assert_eq!(fields[columns::STATUS], SENT_OUT);
        assert_eq!(fields[columns::DESTINATION], "Lyon");
        assert_eq!(fields[columns::SENT_AT], "2024-03-01");

        let today = BulkOperation::SendOut {
            destination: "Lyon".into(),
            sent_at: None,
        };
        assert_eq!(today.fields()[columns::SENT_AT].len(), 10);
    }

    #[test]
    fn test_blank_arguments_are_rejected() {
        let op = BulkOperation::Relocate {
            location: "  ".into(),
        };
        assert!(matches!(op.validate(), Err(SyncError::InvalidArgument(_))));
        assert!(BulkOperation::Delete.validate().is_ok());
    }
}
