use ahash::AHashMap;
use fleet_gateway_core::ClusterDiff;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::sync::mpsc::{self, error::TrySendError};

/// The number of fleet updates buffered for each subscriber.
///
/// Updates are sent without waiting, so a subscriber that falls this far
/// behind misses updates and should re-read the fleet.
pub const SUBSCRIBER_CAPACITY: usize = 8;

/// Receives fleet membership changes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<ClusterDiff>,
    registry: Weak<Registry>,
}

#[derive(Clone, Debug)]
pub(crate) struct Subscribers(Arc<Registry>);

#[derive(Debug)]
struct Registry {
    next_id: AtomicU64,
    senders: Mutex<AHashMap<u64, mpsc::Sender<ClusterDiff>>>,
    capacity: usize,
}

// === impl Subscription ===

impl Subscription {
    /// Waits for the next update. Returns `None` once the manager is gone.
    pub async fn recv(&mut self) -> Option<ClusterDiff> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClusterDiff> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.senders.lock().remove(&self.id);
        }
    }
}

// === impl Subscribers ===

impl Subscribers {
    pub(crate) fn new(capacity: usize) -> Self {
        Self(Arc::new(Registry {
            next_id: AtomicU64::new(0),
            senders: Mutex::new(AHashMap::new()),
            capacity: capacity.max(1),
        }))
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.0.capacity);
        self.0.senders.lock().insert(id, tx);
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.0),
        }
    }

    /// Sends `update` to every subscriber without waiting, returning the
    /// number of subscribers that missed it.
    pub(crate) fn notify(&self, update: &ClusterDiff) -> usize {
        let mut dropped = 0;
        self.0.senders.lock().retain(|id, tx| match tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(subscriber = id, "Subscriber is lagging; dropped fleet update");
                dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        dropped
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.senders.lock().len()
    }
}
