//! Core traits and types for the inventory synchronization engine.
//!
//! This crate defines the abstractions shared between the engine and its collaborators:
//! - `SourceAdapter`: Row-oriented access to an authoritative backing store
//! - `EditLockManager`: Exclusive, time-bounded edit sessions per item
//! - `ChangeEvent`: The change stream exchanged between poller, reconciler and observers
//! - `SyncError`: The error taxonomy surfaced to callers

mod error;
mod event;
mod item;
mod lock;
mod mutation;
mod source;

pub use error::SyncError;
pub use event::{ChangeEvent, ChangeKind, ChangePayload, EventOrigin};
pub use item::{cell, columns, is_subset, Fields, Item, ItemKey, RawRow, Snapshot, Version};
pub use lock::{AcquireOutcome, EditLockManager, EditSession, ReleaseOutcome};
pub use mutation::{MutationKind, PendingMutation};
pub use source::{BatchOp, SourceAdapter, WriteOutcome};
