use tokio::sync::watch;

use crate::error::{FetchError, SwrError};
use crate::store::CacheValue;

/// Internal state flag of a cache entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EntryState {
    /// Settled. The entry holds whatever the last write left behind.
    #[default]
    Fixed,
    /// A fetch for this key is in flight.
    Loading,
    /// The last fetch failed; any previously cached data is kept.
    Error(FetchError),
}

/// Point-in-time contents of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot<V> {
    /// Last known value, `None` when nothing non-null was ever written.
    pub data: Option<V>,
    pub state: EntryState,
}

impl<V> Default for EntrySnapshot<V> {
    fn default() -> Self {
        EntrySnapshot {
            data: None,
            state: EntryState::Fixed,
        }
    }
}

/// A single mutable cell holding the authoritative value for one key.
///
/// The cell is a watch channel: every write is pushed to subscribers and the
/// latest snapshot is replayed to anyone subscribing late. Writes go through
/// `send_if_modified`, so consecutive equal snapshots never notify.
///
/// Entries are created lazily by [`CacheStore::entry`](crate::CacheStore::entry)
/// and are never removed, only cleared in place.
pub struct CacheEntry<V> {
    cell: watch::Sender<EntrySnapshot<V>>,
}

impl<V> CacheEntry<V>
where
    V: CacheValue,
{
    pub(crate) fn new() -> Self {
        let (cell, _) = watch::channel(EntrySnapshot::default());
        CacheEntry { cell }
    }

    /// Current contents of the cell.
    pub fn snapshot(&self) -> EntrySnapshot<V> {
        self.cell.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<EntrySnapshot<V>> {
        self.cell.subscribe()
    }

    /// Transition to `Loading`, or fail if a fetch is already in flight.
    ///
    /// The check and the transition happen under the cell's internal lock,
    /// which is what guarantees at most one in-flight fetch per key.
    pub(crate) fn begin_loading(&self) -> Result<(), SwrError> {
        let mut started = false;
        self.cell.send_if_modified(|snapshot| {
            if snapshot.state == EntryState::Loading {
                return false;
            }
            snapshot.state = EntryState::Loading;
            started = true;
            true
        });
        if started {
            Ok(())
        } else {
            Err(SwrError::AlreadyLoading)
        }
    }

    /// Write `data` into the cell. With `keep_state` the state flag is left
    /// untouched (rollbacks use this so a concurrent `Loading` is not
    /// clobbered); otherwise the state is forced back to `Fixed`.
    pub(crate) fn update(&self, data: Option<V>, keep_state: bool) {
        self.cell.send_if_modified(|snapshot| {
            let mut changed = false;
            if snapshot.data != data {
                snapshot.data = data;
                changed = true;
            }
            if !keep_state && snapshot.state != EntryState::Fixed {
                snapshot.state = EntryState::Fixed;
                changed = true;
            }
            changed
        });
    }

    /// Record a failed fetch. Cached data is deliberately left in place.
    pub(crate) fn fail(&self, cause: FetchError) {
        self.cell.send_if_modified(|snapshot| {
            let state = EntryState::Error(cause);
            if snapshot.state == state {
                return false;
            }
            snapshot.state = state;
            true
        });
    }

    /// Clear data and state in place.
    pub(crate) fn reset(&self) {
        self.update(None, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_loading_rejects_reentry() {
        let entry: CacheEntry<String> = CacheEntry::new();
        entry.begin_loading().unwrap();
        assert_eq!(entry.begin_loading(), Err(SwrError::AlreadyLoading));
        assert_eq!(entry.snapshot().state, EntryState::Loading);
    }

    #[test]
    fn test_update_keep_state_preserves_loading() {
        let entry: CacheEntry<String> = CacheEntry::new();
        entry.begin_loading().unwrap();

        entry.update(Some("rolled-back".into()), true);
        assert_eq!(entry.snapshot().state, EntryState::Loading);

        entry.update(Some("settled".into()), false);
        assert_eq!(entry.snapshot().state, EntryState::Fixed);
        assert_eq!(entry.snapshot().data.as_deref(), Some("settled"));
    }

    #[test]
    fn test_fail_keeps_stale_data() {
        let entry: CacheEntry<String> = CacheEntry::new();
        entry.update(Some("stale".into()), false);
        entry.fail(FetchError::msg("boom"));

        let snapshot = entry.snapshot();
        assert_eq!(snapshot.data.as_deref(), Some("stale"));
        assert!(matches!(snapshot.state, EntryState::Error(_)));
    }

    #[test]
    fn test_equal_writes_do_not_notify() {
        let entry: CacheEntry<String> = CacheEntry::new();
        let mut receiver = entry.subscribe();
        entry.update(Some("value".into()), false);
        assert!(receiver.has_changed().unwrap());
        receiver.mark_unchanged();

        entry.update(Some("value".into()), false);
        assert!(!receiver.has_changed().unwrap());
    }
}
