use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between two reads of the same source
    pub poll_interval_ms: u64,
    /// Lifetime of an edit session without activity
    pub edit_ttl_secs: u64,
    /// Added on top of the source's retry-after before resubmitting
    pub retry_margin_ms: u64,
    /// Longest retry-after the controller waits for; longer ones fail the mutation
    pub max_retry_after_ms: u64,
    /// Time a mutation may spend waiting on the source before it fails
    pub mutation_deadline_secs: u64,
    /// Hard timeout after which a delete suppression lapses on its own
    pub suppression_timeout_secs: u64,
    /// How long a confirmed mutation is remembered for echo deduplication
    pub echo_window_secs: u64,
    /// Buffered events per observer before the oldest are dropped
    pub broadcast_capacity: usize,
    /// Items of one bulk run processed concurrently
    pub bulk_concurrency: usize,
    /// Unsuppressed deletions in one poll above which the shrink needs confirming
    pub mass_delete_threshold: usize,
    /// Emit a full REFRESH every N poll cycles (0 = never after the first)
    pub refresh_every: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            edit_ttl_secs: 30,
            retry_margin_ms: 250,
            max_retry_after_ms: 10_000,
            mutation_deadline_secs: 30,
            suppression_timeout_secs: 30,
            echo_window_secs: 60,
            broadcast_capacity: 256,
            bulk_concurrency: 8,
            mass_delete_threshold: 50,
            refresh_every: 12,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn edit_ttl(&self) -> Duration {
        Duration::from_secs(self.edit_ttl_secs)
    }

    pub fn retry_margin(&self) -> Duration {
        Duration::from_millis(self.retry_margin_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.max_retry_after_ms)
    }

    pub fn mutation_deadline(&self) -> Duration {
        Duration::from_secs(self.mutation_deadline_secs)
    }

    pub fn suppression_timeout(&self) -> Duration {
        Duration::from_secs(self.suppression_timeout_secs)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_secs(self.echo_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 250, "refresh_every": 0}"#).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.refresh_every, 0);
        assert_eq!(config.edit_ttl(), Duration::from_secs(30));
    }
}
