//! Fire-and-forget multicast of committed changes to connected observers.

use std::sync::Mutex;

use futures::{Stream, StreamExt};
use inventory_sync_core::ChangeEvent;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// A change as committed to the Item Store, numbered in commit order.
#[derive(Debug, Clone, Serialize)]
pub struct CommittedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: ChangeEvent,
}

/// What an observer receives.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum Notification {
    Event(CommittedEvent),
    /// The observer fell behind and `missed` events were dropped; it should re-read the store.
    Resync { missed: u64 },
}

/// Bounded broadcaster: a slow observer loses its oldest events instead of
/// stalling the engine.
pub struct Broadcaster {
    sender: broadcast::Sender<CommittedEvent>,
    /// Commit sequence; held while sending so seq order matches channel order
    seq: Mutex<u64>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            seq: Mutex::new(0),
        }
    }

    /// Publish a committed change. Returns its sequence number.
    pub fn publish(&self, event: ChangeEvent) -> u64 {
        let mut seq = self.seq.lock().unwrap_or_else(|e| e.into_inner());
        *seq += 1;
        // No receivers is fine
        let _ = self.sender.send(CommittedEvent { seq: *seq, event });
        *seq
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One observer's view of the change stream. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<CommittedEvent>,
}

impl Subscription {
    /// Next notification, or `None` once the engine is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        match self.receiver.recv().await {
            Ok(event) => Some(Notification::Event(event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Observer lagged, dropped {} events", missed);
                Some(Notification::Resync { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Next notification if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Notification> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Notification::Event(event)),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                warn!("Observer lagged, dropped {} events", missed);
                Some(Notification::Resync { missed })
            }
            Err(_) => None,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Notification> + Send + 'static {
        BroadcastStream::new(self.receiver).map(|item| match item {
            Ok(event) => Notification::Event(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("Observer lagged, dropped {} events", missed);
                Notification::Resync { missed }
            }
        })
    }
}
