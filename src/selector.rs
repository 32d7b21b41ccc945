use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::watch;

use crate::entry::{CacheEntry, EntrySnapshot, EntryState};
use crate::error::{FetchError, SwrError};
use crate::persister::Persister;
use crate::state::{state_stream, StoreState};
use crate::store::{CacheKey, CacheStore, CacheValue};

/// Asynchronous origin fetch for one key type.
///
/// A `None` result is a legal outcome: it is written to the cache but is
/// deliberately indistinguishable from "never fetched" in the observable
/// state (see [`StoreState`]).
pub type Fetcher<K, V> =
    Arc<dyn Fn(K) -> BoxFuture<'static, Result<Option<V>, FetchError>> + Send + Sync>;

/// Box an async closure into a [`Fetcher`].
pub fn fetcher<K, V, F, Fut>(fetch: F) -> Fetcher<K, V>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<V>, FetchError>> + Send + 'static,
{
    Arc::new(move |key| Box::pin(fetch(key)))
}

/// Where a read is allowed to look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetFrom {
    /// Serve local data, fetching first only when there is none.
    Both,
    /// Always fetch; the fetch's own outcome is the result.
    RemoteOnly,
    /// Never fetch.
    LocalOnly,
}

/// Per-key mechanism turning "fetch from remote", "read/write local" and
/// "state changes" into one coherent contract.
///
/// The selector owns no timing policy; it only guarantees that at most one
/// fetch per key is in flight (a reentrant [`validate`](Self::validate)
/// fails fast with [`SwrError::AlreadyLoading`]) and that a failed fetch
/// leaves previously cached data untouched.
pub struct DataSelector<K, V> {
    key: K,
    entry: Arc<CacheEntry<V>>,
    fetcher: Fetcher<K, V>,
    persister: Option<Arc<dyn Persister<K, V>>>,
}

impl<K, V> DataSelector<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(store: &CacheStore<K, V>, key: K, fetcher: Fetcher<K, V>) -> Self {
        let entry = store.entry(&key);
        DataSelector {
            key,
            entry,
            fetcher,
            persister: None,
        }
    }

    /// Like [`new`](Self::new), with a write-through persister consulted
    /// whenever the in-memory cell is empty.
    pub fn with_persister(
        store: &CacheStore<K, V>,
        key: K,
        fetcher: Fetcher<K, V>,
        persister: Arc<dyn Persister<K, V>>,
    ) -> Self {
        let entry = store.entry(&key);
        DataSelector {
            key,
            entry,
            fetcher,
            persister: Some(persister),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<EntrySnapshot<V>> {
        self.entry.subscribe()
    }

    /// Observable state stream: replays the current state and suppresses
    /// consecutive duplicates.
    pub fn states(&self) -> impl Stream<Item = StoreState<V>> + Send + 'static {
        state_stream(self.entry.subscribe(), None)
    }

    /// Read according to `from`. See [`GetFrom`] for the exact contract.
    pub async fn get(&self, from: GetFrom) -> Result<Option<V>, SwrError> {
        match from {
            GetFrom::LocalOnly => {
                let snapshot = self.entry.snapshot();
                if let Some(data) = snapshot.data {
                    return Ok(Some(data));
                }
                if let Some(data) = self.restore_persisted().await {
                    return Ok(Some(data));
                }
                match snapshot.state {
                    EntryState::Error(cause) => Err(SwrError::Fetch(cause)),
                    _ => Err(SwrError::NoData),
                }
            }
            GetFrom::RemoteOnly => self.validate().await,
            GetFrom::Both => {
                let mut receiver = self.entry.subscribe();
                let mut local = receiver.borrow_and_update().data.clone();
                if local.is_none() {
                    local = self.restore_persisted().await;
                }
                if let Some(data) = local {
                    return Ok(Some(data));
                }

                // Nothing cached: start a fetch. Its outcome (or the outcome
                // of a fetch already in flight) is observed through the
                // entry states below.
                let _ = self.validate().await;
                loop {
                    {
                        let snapshot = receiver.borrow_and_update();
                        if let Some(data) = &snapshot.data {
                            return Ok(Some(data.clone()));
                        }
                        if let EntryState::Error(cause) = &snapshot.state {
                            return Err(SwrError::Fetch(cause.clone()));
                        }
                    }
                    if receiver.changed().await.is_err() {
                        return Err(SwrError::NoData);
                    }
                }
            }
        }
    }

    /// The single fetch primitive.
    ///
    /// Fails fast with [`SwrError::AlreadyLoading`] when a fetch is in
    /// flight. On success the result is written through and the entry
    /// settles to `Fixed`; on failure the entry records the cause and the
    /// cached data stays visible.
    pub async fn validate(&self) -> Result<Option<V>, SwrError> {
        self.entry.begin_loading()?;
        tracing::trace!(key = ?self.key, "fetching");
        match (self.fetcher)(self.key.clone()).await {
            Ok(value) => {
                self.update(value.clone(), false).await;
                Ok(value)
            }
            Err(cause) => {
                tracing::debug!(key = ?self.key, error = %cause, "fetch failed");
                self.entry.fail(cause.clone());
                Err(SwrError::Fetch(cause))
            }
        }
    }

    /// Discard local data, then fetch.
    pub async fn refresh(&self) -> Result<Option<V>, SwrError> {
        self.clear().await;
        self.validate().await
    }

    /// Write local data directly. With `keep_state` the state flag is left
    /// as-is (used by rollbacks); otherwise the entry settles to `Fixed`.
    pub async fn update(&self, data: Option<V>, keep_state: bool) {
        self.entry.update(data.clone(), keep_state);
        self.persist(data.as_ref()).await;
    }

    pub async fn clear(&self) {
        self.update(None, false).await;
    }

    /// Fallback read from the persister; a hit seeds the in-memory cell
    /// without clobbering a concurrent `Loading` state.
    async fn restore_persisted(&self) -> Option<V> {
        let persister = self.persister.as_ref()?;
        match persister.load_data(&self.key).await {
            Ok(Some(value)) => {
                self.entry.update(Some(value.clone()), true);
                Some(value)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(key = ?self.key, error = %error, "persister load failed");
                None
            }
        }
    }

    async fn persist(&self, data: Option<&V>) {
        let Some(persister) = self.persister.as_ref() else {
            return;
        };
        if let Err(error) = persister.save_data(&self.key, data).await {
            tracing::warn!(key = ?self.key, error = %error, "persister save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::MemoryPersister;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_fetcher(
        counter: Arc<AtomicUsize>,
        result: Result<Option<String>, &'static str>,
    ) -> Fetcher<String, String> {
        let result = result.map_err(FetchError::msg);
        fetcher(move |_key: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            let result = result.clone();
            async move { result }
        })
    }

    #[tokio::test]
    async fn test_validate_success_settles_entry() {
        let store = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let selector = DataSelector::new(
            &store,
            "k".to_string(),
            counting_fetcher(calls.clone(), Ok(Some("data".to_string()))),
        );

        let value = selector.validate().await.unwrap();
        assert_eq!(value.as_deref(), Some("data"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snapshot = store.entry(&"k".to_string()).snapshot();
        assert_eq!(snapshot.data.as_deref(), Some("data"));
        assert_eq!(snapshot.state, EntryState::Fixed);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_stale_data() {
        let store = CacheStore::new();
        let selector = DataSelector::new(
            &store,
            "k".to_string(),
            counting_fetcher(Arc::new(AtomicUsize::new(0)), Err("down")),
        );
        selector.update(Some("stale".to_string()), false).await;

        let result = selector.validate().await;
        assert!(matches!(result, Err(SwrError::Fetch(_))));

        // stale-while-revalidate: the old value stays visible with the error
        let mut states = Box::pin(selector.states());
        let state = states.next().await.unwrap();
        assert!(matches!(
            state,
            StoreState::Error(Some(ref data), _) if data == "stale"
        ));
    }

    #[tokio::test]
    async fn test_validate_rejects_reentry() {
        let store = CacheStore::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let selector = Arc::new(DataSelector::new(
            &store,
            "k".to_string(),
            fetcher(move |_key: String| {
                let release_rx = release_rx.clone();
                async move {
                    if let Some(gate) = release_rx.lock().await.take() {
                        let _ = gate.await;
                    }
                    Ok(Some("data".to_string()))
                }
            }),
        ));

        let in_flight = {
            let selector = selector.clone();
            tokio::spawn(async move { selector.validate().await })
        };
        // wait for the first validate to reach Loading
        let mut receiver = selector.subscribe();
        while receiver.borrow_and_update().state != EntryState::Loading {
            receiver.changed().await.unwrap();
        }

        assert_eq!(selector.validate().await, Err(SwrError::AlreadyLoading));

        release_tx.send(()).unwrap();
        assert!(in_flight.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_get_local_only_never_fetches() {
        let store = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let selector = DataSelector::new(
            &store,
            "k".to_string(),
            counting_fetcher(calls.clone(), Ok(Some("data".to_string()))),
        );

        assert_eq!(selector.get(GetFrom::LocalOnly).await, Err(SwrError::NoData));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        selector.update(Some("local".to_string()), false).await;
        let value = selector.get(GetFrom::LocalOnly).await.unwrap();
        assert_eq!(value.as_deref(), Some("local"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_both_fetches_only_on_miss() {
        let store = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let selector = DataSelector::new(
            &store,
            "k".to_string(),
            counting_fetcher(calls.clone(), Ok(Some("data".to_string()))),
        );

        let value = selector.get(GetFrom::Both).await.unwrap();
        assert_eq!(value.as_deref(), Some("data"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let value = selector.get(GetFrom::Both).await.unwrap();
        assert_eq!(value.as_deref(), Some("data"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_both_fails_with_fetch_error_on_empty_cache() {
        let store = CacheStore::new();
        let selector = DataSelector::new(
            &store,
            "k".to_string(),
            counting_fetcher(Arc::new(AtomicUsize::new(0)), Err("down")),
        );

        assert!(matches!(
            selector.get(GetFrom::Both).await,
            Err(SwrError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_discards_before_fetching() {
        let store = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let selector = DataSelector::new(
            &store,
            "k".to_string(),
            counting_fetcher(calls.clone(), Err("down")),
        );
        selector.update(Some("old".to_string()), false).await;

        let result = selector.refresh().await;
        assert!(result.is_err());
        // unlike a plain failed validate, refresh dropped the old value first
        assert_eq!(store.entry(&"k".to_string()).snapshot().data, None);
    }

    #[tokio::test]
    async fn test_persister_fallback_and_write_through() {
        let store = CacheStore::new();
        let persister = Arc::new(MemoryPersister::new());
        persister
            .save_data(&"k".to_string(), Some(&"stored".to_string()))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let selector = DataSelector::with_persister(
            &store,
            "k".to_string(),
            counting_fetcher(calls.clone(), Ok(Some("remote".to_string()))),
            persister.clone(),
        );

        // fallback hit: no fetch, and the cell is seeded
        let value = selector.get(GetFrom::Both).await.unwrap();
        assert_eq!(value.as_deref(), Some("stored"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.entry(&"k".to_string()).snapshot().data.as_deref(),
            Some("stored")
        );

        // write-through on update and clear
        selector.update(Some("newer".to_string()), false).await;
        let stored = persister.load_data(&"k".to_string()).await.unwrap();
        assert_eq!(stored.as_deref(), Some("newer"));

        selector.clear().await;
        let stored = persister.load_data(&"k".to_string()).await.unwrap();
        assert!(stored.is_none());
    }
}
