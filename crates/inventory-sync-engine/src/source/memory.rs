use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use inventory_sync_core::{Fields, ItemKey, RawRow, SourceAdapter, SyncError, WriteOutcome};
use tracing::{debug, instrument};

/// In-process authoritative store.
///
/// Rows are kept per source in insertion order. Outcomes can be scripted per
/// identity to reproduce rate limiting, vanished rows and hard failures; a
/// scripted non-`Ok` outcome leaves the data untouched.
#[derive(Debug, Default)]
pub struct MemorySource {
    rows: DashMap<String, Vec<RawRow>>,
    scripted: DashMap<ItemKey, VecDeque<WriteOutcome>>,
    failing_reads: DashMap<String, u32>,
    attempts: DashMap<ItemKey, u32>,
    reads: DashMap<String, u32>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows of `source`.
    pub fn seed(&self, source: &str, rows: Vec<RawRow>) {
        self.rows.insert(source.to_string(), rows);
    }

    pub fn with_rows(self, source: &str, rows: Vec<RawRow>) -> Self {
        self.seed(source, rows);
        self
    }

    /// Queue outcomes returned by the next writes/deletes against `key`.
    pub fn script(&self, key: &ItemKey, outcomes: impl IntoIterator<Item = WriteOutcome>) {
        self.scripted
            .entry(key.clone())
            .or_default()
            .extend(outcomes);
    }

    /// Make the next `count` reads of `source` fail.
    pub fn fail_reads(&self, source: &str, count: u32) {
        *self.failing_reads.entry(source.to_string()).or_default() += count;
    }

    /// Rows of `source` as currently stored.
    pub fn rows(&self, source: &str) -> Vec<RawRow> {
        self.rows
            .get(source)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn row(&self, source: &str, local_id: &str) -> Option<Fields> {
        self.rows.get(source).and_then(|rows| {
            rows.iter()
                .find(|r| r.local_id == local_id)
                .map(|r| r.fields.clone())
        })
    }

    /// Edit a row directly, as a person typing into the spreadsheet would.
    pub fn set_row(&self, source: &str, local_id: &str, fields: Fields) {
        let mut rows = self.rows.entry(source.to_string()).or_default();
        match rows.iter_mut().find(|r| r.local_id == local_id) {
            Some(row) => row.fields = fields,
            None => rows.push(RawRow::new(local_id, fields)),
        }
    }

    /// Delete a row directly, bypassing the engine.
    pub fn remove_row(&self, source: &str, local_id: &str) -> bool {
        match self.rows.get_mut(source) {
            Some(mut rows) => {
                let before = rows.len();
                rows.retain(|r| r.local_id != local_id);
                rows.len() != before
            }
            None => false,
        }
    }

    /// Number of writes, inserts and deletes attempted against `key`.
    pub fn attempts(&self, key: &ItemKey) -> u32 {
        self.attempts.get(key).map(|a| *a).unwrap_or(0)
    }

    /// Number of `read_all` calls served for `source`, failed ones included.
    pub fn reads(&self, source: &str) -> u32 {
        self.reads.get(source).map(|r| *r).unwrap_or(0)
    }

    /// Record an attempt and pop the scripted outcome for it, if any.
    fn next_scripted(&self, source: &str, local_id: &str) -> Option<WriteOutcome> {
        let key = ItemKey::new(source, local_id);
        *self.attempts.entry(key.clone()).or_default() += 1;
        self.scripted.get_mut(&key).and_then(|mut q| q.pop_front())
    }
}

#[async_trait]
impl SourceAdapter for MemorySource {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_all(&self, source: &str) -> Result<Vec<RawRow>, SyncError> {
        *self.reads.entry(source.to_string()).or_default() += 1;
        if let Some(mut remaining) = self.failing_reads.get_mut(source) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::Failure(format!("read of {} failed", source)));
            }
        }
        Ok(self.rows(source))
    }

    #[instrument(skip(self, fields), level = "debug")]
    async fn write(&self, source: &str, local_id: &str, fields: &Fields) -> WriteOutcome {
        if let Some(outcome) = self.next_scripted(source, local_id) {
            if !outcome.is_ok() {
                debug!("Scripted {:?} for write {}/{}", outcome, source, local_id);
                return outcome;
            }
        }

        match self.rows.get_mut(source) {
            Some(mut rows) => match rows.iter_mut().find(|r| r.local_id == local_id) {
                Some(row) => {
                    row.fields
                        .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                    WriteOutcome::Ok
                }
                None => WriteOutcome::NotFound,
            },
            None => WriteOutcome::NotFound,
        }
    }

    #[instrument(skip(self, fields), level = "debug")]
    async fn insert(&self, source: &str, local_id: &str, fields: &Fields) -> WriteOutcome {
        if let Some(outcome) = self.next_scripted(source, local_id) {
            if !outcome.is_ok() {
                return outcome;
            }
        }

        let mut rows = self.rows.entry(source.to_string()).or_default();
        if rows.iter().any(|r| r.local_id == local_id) {
            return WriteOutcome::Failure(format!("row {} already exists", local_id));
        }
        rows.push(RawRow::new(local_id, fields.clone()));
        WriteOutcome::Ok
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, source: &str, local_id: &str) -> WriteOutcome {
        if let Some(outcome) = self.next_scripted(source, local_id) {
            if !outcome.is_ok() {
                debug!("Scripted {:?} for delete {}/{}", outcome, source, local_id);
                return outcome;
            }
        }

        if self.remove_row(source, local_id) {
            WriteOutcome::Ok
        } else {
            WriteOutcome::NotFound
        }
    }
}
