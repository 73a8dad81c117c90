use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::item::{Fields, RawRow};

/// Uniform result of a point write against an authoritative source.
///
/// `RateLimited` is a value, not an error: the source is telling us it needs
/// time to propagate a previous write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok,
    RateLimited { retry_after: Duration },
    NotFound,
    Failure(String),
}

impl WriteOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, WriteOutcome::Ok)
    }
}

/// One operation of a batch write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOp {
    Write { id: String, fields: Fields },
    Delete { id: String },
}

impl BatchOp {
    pub fn local_id(&self) -> &str {
        match self {
            BatchOp::Write { id, .. } | BatchOp::Delete { id } => id,
        }
    }
}

/// Row-oriented access to the authoritative backing store(s).
///
/// All methods take the `source` name first; one adapter may serve several
/// sources (e.g. two sheets of the same spreadsheet).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Returns the adapter identifier (e.g., "memory", "http").
    fn backend_name(&self) -> &'static str;

    /// Read every row of a source, in source order.
    async fn read_all(&self, source: &str) -> Result<Vec<RawRow>, SyncError>;

    /// Overwrite the given fields of an existing row.
    async fn write(&self, source: &str, local_id: &str, fields: &Fields) -> WriteOutcome;

    /// Append a new row.
    async fn insert(&self, source: &str, local_id: &str, fields: &Fields) -> WriteOutcome;

    /// Remove a row.
    async fn delete(&self, source: &str, local_id: &str) -> WriteOutcome;

    /// Apply several operations, returning one outcome per op in order.
    ///
    /// The default issues the operations one by one.
    async fn batch_write(&self, source: &str, ops: &[BatchOp]) -> Vec<WriteOutcome> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let outcome = match op {
                BatchOp::Write { id, fields } => self.write(source, id, fields).await,
                BatchOp::Delete { id } => self.delete(source, id).await,
            };
            results.push(outcome);
        }
        results
    }
}
