use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Sync state of one authoritative source, for "last sync" indicators.
///
/// Kept in memory only; it is rebuilt by the first poll after a restart.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: String,
    pub backend: String,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub row_count: usize,
    /// A large shrink was read and is waiting for a confirming poll
    pub shrink_pending: bool,
}

#[derive(Debug, Default)]
pub struct SyncStatusTracker {
    sources: DashMap<String, SourceStatus>,
}

impl SyncStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: &str, backend: &str) {
        self.sources.insert(
            source.to_string(),
            SourceStatus {
                source: source.to_string(),
                backend: backend.to_string(),
                last_polled_at: None,
                last_error: None,
                consecutive_failures: 0,
                row_count: 0,
                shrink_pending: false,
            },
        );
    }

    pub fn record_success(&self, source: &str, row_count: usize, shrink_pending: bool) {
        if let Some(mut status) = self.sources.get_mut(source) {
            status.last_polled_at = Some(Utc::now());
            status.last_error = None;
            status.consecutive_failures = 0;
            status.row_count = row_count;
            status.shrink_pending = shrink_pending;
        }
    }

    /// Record a failed read. The last successful poll time is left as is.
    pub fn record_failure(&self, source: &str, error: &str) {
        if let Some(mut status) = self.sources.get_mut(source) {
            status.last_error = Some(error.to_string());
            status.consecutive_failures += 1;
        }
    }

    pub fn get(&self, source: &str) -> Option<SourceStatus> {
        self.sources.get(source).map(|s| s.clone())
    }

    pub fn all(&self) -> Vec<SourceStatus> {
        let mut all: Vec<SourceStatus> = self.sources.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.source.cmp(&b.source));
        all
    }
}
