//! Synchronization and conflict-resolution engine for a spreadsheet-backed
//! inventory.
//!
//! - `ItemStore`: versioned in-memory collection keyed by `(source, local_id)`
//! - `ChangePoller`: periodic full read and diff of each authoritative source
//! - `MemoryLockManager`: exclusive, time-bounded edit sessions per item
//! - `Reconciler`: per-item ordered application of changes, with echo dedup
//! - `RetryController`: one bounded retry on `RateLimited`
//! - `BulkOrchestrator`: multi-item operations with partial-success reporting
//! - `SyncEngine`: the facade tying them together

mod broadcast;
mod bulk;
mod clock;
mod config;
mod engine;
mod lock;
mod pending;
mod poller;
mod reconcile;
mod retry;
mod serial;
mod source;
mod status;
mod store;
mod suppression;

pub use broadcast::{Broadcaster, CommittedEvent, Notification, Subscription};
pub use bulk::{BulkFailure, BulkOperation, BulkOrchestrator, BulkReport, SENT_OUT};
pub use clock::VersionClock;
pub use config::EngineConfig;
pub use engine::{
    MutationReceipt, MutationRequest, SourceHandle, SourceMap, SyncEngine, SyncEngineBuilder,
};
pub use lock::MemoryLockManager;
pub use pending::{PendingGuard, PendingTracker, Resolution};
pub use poller::{diff_rows, ChangePoller};
pub use reconcile::{ApplyReport, Reconciler};
pub use retry::{RetryController, RetryPolicy};
pub use serial::KeyedSerializer;
pub use source::{HttpRowSource, MemorySource};
pub use status::{SourceStatus, SyncStatusTracker};
pub use store::{ItemFilter, ItemStore, Stamp, StoreOutcome};
pub use suppression::SuppressionSet;
