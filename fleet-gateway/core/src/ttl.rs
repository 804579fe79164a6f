//! An expiring map.
//!
//! Entries expire `ttl` after their last write. Expired entries are never
//! returned; they are removed lazily on lookup and in bulk by a sweeper that
//! runs every `resolution`, so no timer is allocated per entry.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::{
    hash::Hash,
    sync::{Arc, Weak},
};
use tokio::{
    task::JoinHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: Mutex<AHashMap<K, Entry<V>>>,
    ttl: Duration,
    resolution: Duration,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

// === impl TtlCache ===

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration, resolution: Duration) -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
            ttl,
            resolution,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores `value`, resetting the entry's expiry.
    pub fn insert(&self, key: K, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.lock().insert(key, Entry { value, expires_at });
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    pub fn retain(&self, mut f: impl FnMut(&K, &V) -> bool) {
        self.entries.lock().retain(|k, e| f(k, &e.value));
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Purges expired entries every `resolution` until `shutdown` fires or
    /// the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let mut interval = time::interval(self.resolution);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let Some(cache) = cache.upgrade() else {
                    return;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::trace!(purged, "Expired cache entries");
                }
            }
        })
    }
}
