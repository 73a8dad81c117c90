//! Per-identity sequential execution.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use inventory_sync_core::ItemKey;
use tokio::sync::Mutex;

/// Runs work for the same item one at a time, in arrival order, while work
/// for distinct items proceeds in parallel.
///
/// Each identity gets a fair async mutex; the entry is dropped once nobody
/// is queued on it so the map only holds busy identities.
#[derive(Debug, Default)]
pub struct KeyedSerializer {
    lanes: DashMap<ItemKey, Arc<Mutex<()>>>,
}

impl KeyedSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, T>(&self, key: &ItemKey, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let lane = Lane {
            lanes: &self.lanes,
            key,
            mutex: self
                .lanes
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        };

        let _turn = lane.mutex.lock().await;
        work.await
    }

    /// Identities with work running or queued.
    pub fn busy(&self) -> usize {
        self.lanes.len()
    }
}

/// A caller's hold on one lane. Dropping it, on completion or cancellation,
/// removes the lane once nobody else is queued on it.
struct Lane<'a> {
    lanes: &'a DashMap<ItemKey, Arc<Mutex<()>>>,
    key: &'a ItemKey,
    mutex: Arc<Mutex<()>>,
}

impl Drop for Lane<'_> {
    fn drop(&mut self) {
        // Only the map and this handle remain
        self.lanes.remove_if(self.key, |_, lane| {
            Arc::ptr_eq(lane, &self.mutex) && Arc::strong_count(lane) == 2
        });
    }
}
