use std::time::Duration;

use inventory_sync_core::ItemKey;
use moka::future::Cache;
use tracing::debug;

/// Identities whose deletion is in flight through this engine.
///
/// The poller skips DELETEs for these keys so that an eventually-consistent
/// read taken mid-delete is not reported as an external deletion. Entries are
/// released on resolution and lapse on their own after the hard timeout.
#[derive(Clone)]
pub struct SuppressionSet {
    keys: Cache<ItemKey, ()>,
}

impl SuppressionSet {
    pub fn new(timeout: Duration) -> Self {
        Self {
            keys: Cache::builder().time_to_live(timeout).build(),
        }
    }

    pub async fn suppress(&self, key: ItemKey) {
        debug!("Suppressing external deletes of {}", key);
        self.keys.insert(key, ()).await;
    }

    pub async fn release(&self, key: &ItemKey) {
        self.keys.invalidate(key).await;
    }

    pub async fn contains(&self, key: &ItemKey) -> bool {
        self.keys.get(key).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_suppress_and_release() {
        let set = SuppressionSet::new(Duration::from_secs(30));
        let key = ItemKey::new("s", "1");

        assert!(!set.contains(&key).await);
        set.suppress(key.clone()).await;
        assert!(set.contains(&key).await);
        assert!(!set.contains(&ItemKey::new("other", "1")).await);

        set.release(&key).await;
        assert!(!set.contains(&key).await);
    }

    #[tokio::test]
    async fn test_entries_lapse_after_timeout() {
        let set = SuppressionSet::new(Duration::from_millis(50));
        let key = ItemKey::new("s", "1");
        set.suppress(key.clone()).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!set.contains(&key).await);
    }
}
