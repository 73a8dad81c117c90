use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use inventory_sync_core::{MutationKind, PendingMutation, SourceAdapter, SyncError, WriteOutcome};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::pending::PendingTracker;
use crate::suppression::SuppressionSet;

/// Bounds on how a rate-limited mutation is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total write attempts, the first one included
    pub max_attempts: u32,
    /// Added to the source's retry-after before resubmitting
    pub margin: Duration,
    /// Longest retry-after worth waiting for; a longer one fails the mutation
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: 2,
            margin: config.retry_margin(),
            max_retry_after: config.max_retry_after(),
        }
    }

    fn wait_for(&self, retry_after: Duration) -> Duration {
        retry_after + self.margin
    }
}

/// Drives a mutation against its source until it lands or fails for good.
///
/// `RateLimited` is answered by sleeping the advertised delay plus a margin
/// and trying the identical request once more. Anything else, or a second
/// `RateLimited`, is final.
pub struct RetryController {
    policy: RetryPolicy,
    suppression: SuppressionSet,
    pending: Arc<PendingTracker>,
}

impl RetryController {
    pub fn new(
        policy: RetryPolicy,
        suppression: SuppressionSet,
        pending: Arc<PendingTracker>,
    ) -> Self {
        Self {
            policy,
            suppression,
            pending,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Submit a mutation and wait for its resolution.
    ///
    /// A delete suppresses its target in the poller for as long as it is
    /// unresolved.
    pub async fn submit(
        &self,
        adapter: &dyn SourceAdapter,
        mutation: &mut PendingMutation,
    ) -> Result<(), SyncError> {
        let suppress = mutation.is_delete();
        if suppress {
            self.suppression.suppress(mutation.item.clone()).await;
        }

        let first = self.attempt(adapter, mutation).await;
        let result = self.settle(adapter, mutation, first).await;

        if suppress {
            self.suppression.release(&mutation.item).await;
        }
        result
    }

    /// Resolve a mutation given the outcome of its latest attempt.
    pub async fn settle(
        &self,
        adapter: &dyn SourceAdapter,
        mutation: &mut PendingMutation,
        mut outcome: WriteOutcome,
    ) -> Result<(), SyncError> {
        loop {
            match outcome {
                WriteOutcome::Ok => return Ok(()),
                WriteOutcome::NotFound => {
                    return Err(SyncError::NotFound(mutation.item.to_string()))
                }
                WriteOutcome::Failure(reason) => return Err(SyncError::Failure(reason)),
                WriteOutcome::RateLimited { retry_after } => {
                    if mutation.attempts >= self.policy.max_attempts
                        || retry_after > self.policy.max_retry_after
                    {
                        warn!(
                            "Giving up on {} after {} attempts (retry after {:?})",
                            mutation.item, mutation.attempts, retry_after
                        );
                        return Err(SyncError::RetriesExhausted {
                            attempts: mutation.attempts,
                            retry_after,
                        });
                    }

                    let wait = self.policy.wait_for(retry_after);
                    let delay = chrono::Duration::from_std(wait)
                        .unwrap_or_else(|_| chrono::Duration::days(1));
                    if Utc::now() + delay > mutation.deadline {
                        warn!("Retry of {} would pass its deadline", mutation.item);
                        return Err(SyncError::DeadlineExceeded(mutation.item.clone()));
                    }

                    debug!(
                        "{} rate limited, retrying in {:?} (attempt {})",
                        mutation.item,
                        wait,
                        mutation.attempts + 1
                    );
                    tokio::time::sleep(wait).await;
                    outcome = self.attempt(adapter, mutation).await;
                }
            }
        }
    }

    /// Count an attempt made on the mutation's behalf.
    pub fn record_attempt(&self, mutation: &mut PendingMutation) {
        mutation.attempts += 1;
        self.pending.record_attempt(mutation.id, mutation.attempts);
    }

    async fn attempt(
        &self,
        adapter: &dyn SourceAdapter,
        mutation: &mut PendingMutation,
    ) -> WriteOutcome {
        self.record_attempt(mutation);
        let (source, local_id) = (&mutation.item.source, &mutation.item.local_id);
        match mutation.kind {
            MutationKind::Create => adapter.insert(source, local_id, &mutation.fields).await,
            MutationKind::Update => adapter.write(source, local_id, &mutation.fields).await,
            MutationKind::Delete => adapter.delete(source, local_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use inventory_sync_core::{Fields, ItemKey, RawRow};

    fn controller() -> RetryController {
        let config = EngineConfig::default();
        RetryController::new(
            RetryPolicy::from_config(&config),
            SuppressionSet::new(config.suppression_timeout()),
            Arc::new(PendingTracker::new(config.echo_window())),
        )
    }

    fn mutation(kind: MutationKind, seconds: i64) -> PendingMutation {
        let mut fields = Fields::new();
        if kind != MutationKind::Delete {
            fields.insert("quantity".into(), "7".into());
        }
        PendingMutation::new(
            ItemKey::new("s", "1"),
            kind,
            fields,
            Utc::now() + chrono::Duration::seconds(seconds),
        )
    }

    fn limited(ms: u64) -> WriteOutcome {
        WriteOutcome::RateLimited {
            retry_after: Duration::from_millis(ms),
        }
    }

    fn source() -> MemorySource {
        MemorySource::new().with_rows("s", vec![RawRow::new("1", Fields::new())])
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_rate_limit_is_retried_once() {
        let retry = controller();
        let source = source();
        let mut m = mutation(MutationKind::Update, 30);
        source.script(&m.item, [limited(500)]);

        let started = tokio::time::Instant::now();
        retry.submit(&source, &mut m).await.unwrap();
        assert_eq!(m.attempts, 2);
        assert!(started.elapsed() >= Duration::from_millis(750));
        assert_eq!(source.row("s", "1").unwrap()["quantity"], "7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_rate_limit_fails_without_third_attempt() {
        let retry = controller();
        let source = source();
        let mut m = mutation(MutationKind::Update, 30);
        source.script(&m.item, [limited(500), limited(500)]);

        let err = retry.submit(&source, &mut m).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::RetriesExhausted {
                attempts: 2,
                retry_after: Duration::from_millis(500)
            }
        );
        assert_eq!(source.attempts(&m.item), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_the_full_retry_after() {
        let retry = controller();
        let source = source();
        let mut m = mutation(MutationKind::Update, 30);
        source.script(&m.item, [limited(8_000)]);

        let started = tokio::time::Instant::now();
        retry.submit(&source, &mut m).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(8_250));
        assert_eq!(m.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_beyond_cap_fails_without_resubmitting() {
        let retry = controller();
        let source = source();
        let mut m = mutation(MutationKind::Update, 60);
        source.script(&m.item, [limited(20_000)]);

        let started = tokio::time::Instant::now();
        let err = retry.submit(&source, &mut m).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::RetriesExhausted {
                attempts: 1,
                retry_after: Duration::from_secs(20)
            }
        );
        assert_eq!(source.attempts(&m.item), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_past_deadline_uses_full_wait() {
        let retry = controller();
        let source = source();
        // Below the cap, but the full wait overruns a 5s deadline
        let mut m = mutation(MutationKind::Update, 5);
        source.script(&m.item, [limited(9_000)]);

        let err = retry.submit(&source, &mut m).await.unwrap_err();
        assert_eq!(err, SyncError::DeadlineExceeded(m.item.clone()));
        assert_eq!(source.attempts(&m.item), 1);
    }

    #[tokio::test]
    async fn test_hard_failure_and_not_found_are_not_retried() {
        let retry = controller();
        let source = source();
        let mut m = mutation(MutationKind::Update, 30);
        source.script(&m.item, [WriteOutcome::Failure("protected range".into())]);

        assert_eq!(
            retry.submit(&source, &mut m).await.unwrap_err(),
            SyncError::Failure("protected range".into())
        );
        assert_eq!(m.attempts, 1);

        let mut missing = PendingMutation::new(
            ItemKey::new("s", "404"),
            MutationKind::Update,
            Fields::new(),
            Utc::now() + chrono::Duration::seconds(30),
        );
        assert!(matches!(
            retry.submit(&source, &mut missing).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_past_deadline_fails_fast() {
        let retry = controller();
        let source = source();
        let mut m = mutation(MutationKind::Update, 1);
        source.script(&m.item, [limited(5_000)]);

        let err = retry.submit(&source, &mut m).await.unwrap_err();
        assert_eq!(err, SyncError::DeadlineExceeded(m.item.clone()));
        assert_eq!(source.attempts(&m.item), 1);
    }

    #[tokio::test]
    async fn test_delete_suppression_released_on_resolution() {
        let retry = controller();
        let source = source();
        let mut m = mutation(MutationKind::Delete, 30);

        retry.submit(&source, &mut m).await.unwrap();
        assert!(source.row("s", "1").is_none());
        assert!(!retry.suppression.contains(&m.item).await);
    }
}
