use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::entry::CacheEntry;

/// Requirements on cache keys. Identity is by equality, never by pointer.
pub trait CacheKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Requirements on cached values. `PartialEq` powers the suppression of
/// consecutive equal state emissions.
pub trait CacheValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Process-wide owner of the key-addressed cache cells.
///
/// The store is an explicit object with no implicit global: construct one per
/// application (or install your own singleton), and a fresh one per test so
/// nothing leaks across tests. Entries are created lazily on first access and
/// live as long as the store; they are only ever cleared in place.
///
/// The store also carries the fire-and-forget revalidation-request channel
/// used by [`MutationTrigger`](crate::MutationTrigger): anything holding the
/// store can ask "whoever watches this key, please refetch" without knowing
/// who that is.
pub struct CacheStore<K, V> {
    entries: DashMap<K, Arc<CacheEntry<V>>>,
    revalidations: broadcast::Sender<K>,
}

impl<K, V> CacheStore<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new() -> Self {
        let (revalidations, _) = broadcast::channel(64);
        CacheStore {
            entries: DashMap::new(),
            revalidations,
        }
    }

    /// Return the entry for `key`, creating it on first use.
    pub fn entry(&self, key: &K) -> Arc<CacheEntry<V>> {
        if let Some(existing) = self.entries.get(key) {
            return existing.value().clone();
        }
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheEntry::new()))
            .value()
            .clone()
    }

    /// Reset every entry's data and state in place.
    ///
    /// Entry identity is preserved: subscribers stay attached and observe
    /// the cleared state.
    pub fn clear_all(&self) {
        tracing::debug!(entries = self.entries.len(), "clearing all cache entries");
        for entry in self.entries.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Signal that `key` should be revalidated by whoever watches it.
    ///
    /// This is fire-and-forget: with no active watcher the signal is dropped.
    pub fn request_revalidation(&self, key: K) {
        tracing::trace!(key = ?key, "revalidation requested");
        let _ = self.revalidations.send(key);
    }

    /// Subscribe to revalidation requests for all keys in this store.
    pub fn revalidation_requests(&self) -> broadcast::Receiver<K> {
        self.revalidations.subscribe()
    }
}

impl<K, V> Default for CacheStore<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn default() -> Self {
        Self::new()
    }
}
