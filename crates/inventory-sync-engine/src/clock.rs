use std::sync::atomic::{AtomicU64, Ordering};

use inventory_sync_core::Version;

/// Monotonic logical clock stamping every event the engine creates.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stamp, strictly greater than any stamp handed out before.
    pub fn next(&self) -> Version {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> Version {
        self.last.load(Ordering::SeqCst)
    }
}
