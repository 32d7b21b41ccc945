use futures::Stream;
use tokio::sync::watch;

use crate::entry::{EntrySnapshot, EntryState};
use crate::error::FetchError;
use crate::store::CacheValue;

/// Observable state of one cached resource, derived from the entry cell.
///
/// `Completed` is only ever emitted when the entry has settled with non-null
/// data. A settled entry without data maps to `Loading(None)`: a fetch that
/// resolved to null is indistinguishable from a key that was never fetched.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreState<V> {
    /// No usable settled value yet; carries stale or fallback data if any.
    Loading(Option<V>),
    /// Settled with data.
    Completed(V),
    /// The last fetch failed; stale data stays visible alongside the cause.
    Error(Option<V>, FetchError),
}

impl<V> StoreState<V> {
    /// Last known data regardless of state.
    pub fn data(&self) -> Option<&V> {
        match self {
            StoreState::Loading(data) => data.as_ref(),
            StoreState::Completed(data) => Some(data),
            StoreState::Error(data, _) => data.as_ref(),
        }
    }

    /// The failure cause, if this is an error state.
    pub fn error(&self) -> Option<&FetchError> {
        match self {
            StoreState::Error(_, cause) => Some(cause),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, StoreState::Loading(_))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StoreState::Completed(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StoreState::Error(..))
    }
}

impl<V> StoreState<V>
where
    V: CacheValue,
{
    pub(crate) fn from_snapshot(snapshot: &EntrySnapshot<V>) -> Self {
        match (&snapshot.state, &snapshot.data) {
            (EntryState::Fixed, Some(data)) => StoreState::Completed(data.clone()),
            (EntryState::Fixed, None) => StoreState::Loading(None),
            (EntryState::Loading, data) => StoreState::Loading(data.clone()),
            (EntryState::Error(cause), data) => StoreState::Error(data.clone(), cause.clone()),
        }
    }

    /// Substitute fallback data into states that carry none.
    pub(crate) fn or_fallback(self, fallback: Option<&V>) -> Self {
        match self {
            StoreState::Loading(None) => StoreState::Loading(fallback.cloned()),
            StoreState::Error(None, cause) => StoreState::Error(fallback.cloned(), cause),
            other => other,
        }
    }
}

/// Turn an entry subscription into a `StoreState` stream.
///
/// Replays the current state to every new subscriber and suppresses
/// consecutive equal emissions (distinct snapshots can map to the same
/// derived state, e.g. `Fixed` without data and `Loading` without data).
pub(crate) fn state_stream<V>(
    receiver: watch::Receiver<EntrySnapshot<V>>,
    fallback: Option<V>,
) -> impl Stream<Item = StoreState<V>> + Send + 'static
where
    V: CacheValue,
{
    futures::stream::unfold(
        (receiver, fallback, None::<StoreState<V>>),
        |(mut receiver, fallback, last)| async move {
            loop {
                let current = {
                    let snapshot = receiver.borrow_and_update();
                    StoreState::from_snapshot(&snapshot).or_fallback(fallback.as_ref())
                };
                if last.as_ref() != Some(&current) {
                    return Some((current.clone(), (receiver, fallback, Some(current))));
                }
                if receiver.changed().await.is_err() {
                    return None;
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheEntry;
    use futures::StreamExt;

    #[test]
    fn test_completed_requires_settled_non_null_data() {
        let settled = EntrySnapshot {
            data: Some(1),
            state: EntryState::Fixed,
        };
        assert_eq!(StoreState::from_snapshot(&settled), StoreState::Completed(1));

        let empty = EntrySnapshot::<i32>::default();
        assert_eq!(StoreState::from_snapshot(&empty), StoreState::Loading(None));
    }

    #[test]
    fn test_fallback_fills_absent_data_only() {
        let state = StoreState::<i32>::Loading(None).or_fallback(Some(&7));
        assert_eq!(state, StoreState::Loading(Some(7)));

        let state = StoreState::Completed(1).or_fallback(Some(&7));
        assert_eq!(state, StoreState::Completed(1));
    }

    #[tokio::test]
    async fn test_state_stream_replays_and_dedups() {
        let entry: CacheEntry<i32> = CacheEntry::new();
        let mut states = Box::pin(state_stream(entry.subscribe(), None));

        assert_eq!(states.next().await, Some(StoreState::Loading(None)));

        // Fixed-without-data and Loading-without-data collapse to the same
        // derived state, so starting a fetch must not re-emit.
        entry.begin_loading().unwrap();
        entry.update(Some(3), false);
        assert_eq!(states.next().await, Some(StoreState::Completed(3)));
    }
}
