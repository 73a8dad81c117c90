use std::time::Duration;

use thiserror::Error;

use crate::item::ItemKey;

/// Errors surfaced by the synchronization engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Another holder owns the edit session for this item.
    #[error("{item} is being edited by {holder}")]
    Conflict { item: ItemKey, holder: String },

    /// The authoritative source asked for time to propagate a prior write.
    #[error("Source rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// A rate-limited mutation was retried and still could not be applied.
    #[error("Gave up after {attempts} attempts (last retry-after {}ms)", retry_after.as_millis())]
    RetriesExhausted { attempts: u32, retry_after: Duration },

    /// The identity no longer exists upstream.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Hard, non-retryable failure reported by the source.
    #[error("Source failure: {0}")]
    Failure(String),

    /// The mutation deadline passed before it could be retried.
    #[error("Deadline exceeded for {0}")]
    DeadlineExceeded(ItemKey),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SyncError {
    /// Whether the caller may reasonably try the same request again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Conflict { .. }
                | SyncError::RateLimited { .. }
                | SyncError::RetriesExhausted { .. }
                | SyncError::DeadlineExceeded(_)
        )
    }
}
