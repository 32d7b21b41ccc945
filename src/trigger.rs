use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::config::SwrConfig;
use crate::entry::CacheEntry;
use crate::error::{FetchError, SwrError};
use crate::store::{CacheKey, CacheStore, CacheValue};

/// Remote mutation for one key and argument type.
pub type MutationFetcher<K, V, A> =
    Arc<dyn Fn(K, A) -> BoxFuture<'static, Result<Option<V>, FetchError>> + Send + Sync>;

/// Box an async closure into a [`MutationFetcher`].
pub fn mutation_fetcher<K, V, A, F, Fut>(mutate: F) -> MutationFetcher<K, V, A>
where
    F: Fn(K, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<V>, FetchError>> + Send + 'static,
{
    Arc::new(move |key, argument| Box::pin(mutate(key, argument)))
}

/// Options for one trigger invocation.
///
/// Same shape as [`MutateOptions`](crate::MutateOptions), but the result is
/// not written to the shared cache unless asked for: a remote mutation's
/// response is usually not the canonical resource representation.
#[derive(Clone)]
pub struct TriggerOptions<V> {
    pub optimistic_data: Option<V>,
    /// Ask any active revalidator for this key to refetch afterwards.
    pub revalidate: bool,
    /// Write the mutation result into the shared cache.
    pub populate_cache: bool,
    pub rollback_on_error: bool,
}

impl<V> TriggerOptions<V> {
    pub fn new() -> Self {
        TriggerOptions {
            optimistic_data: None,
            revalidate: true,
            populate_cache: false,
            rollback_on_error: true,
        }
    }

    pub fn optimistic_data(mut self, data: V) -> Self {
        self.optimistic_data = Some(data);
        self
    }

    pub fn revalidate(mut self, enabled: bool) -> Self {
        self.revalidate = enabled;
        self
    }

    pub fn populate_cache(mut self, enabled: bool) -> Self {
        self.populate_cache = enabled;
        self
    }

    pub fn rollback_on_error(mut self, enabled: bool) -> Self {
        self.rollback_on_error = enabled;
        self
    }
}

impl<V> Default for TriggerOptions<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Observable state of a [`MutationTrigger`].
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerState<V> {
    pub is_mutating: bool,
    /// Result of the last successful invocation.
    pub data: Option<V>,
    /// Failure of the last invocation, cleared when a new one starts.
    pub error: Option<FetchError>,
}

impl<V> Default for TriggerState<V> {
    fn default() -> Self {
        TriggerState {
            is_mutating: false,
            data: None,
            error: None,
        }
    }
}

/// One-shot remote mutation bound to a key, independent of any automatic
/// revalidation schedule.
///
/// `trigger` runs the user's mutation fetch and reflects (or rolls back)
/// its outcome in the shared cache; afterwards it signals
/// [`CacheStore::request_revalidation`] instead of fetching itself, so
/// whatever revalidator is active for the key performs the fresh validate
/// under its own policy.
pub struct MutationTrigger<K, V, A> {
    store: Arc<CacheStore<K, V>>,
    entry: Arc<CacheEntry<V>>,
    key: K,
    mutator: MutationFetcher<K, V, A>,
    config: Arc<SwrConfig<K, V>>,
    state: watch::Sender<TriggerState<V>>,
}

impl<K, V, A> MutationTrigger<K, V, A>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(
        store: Arc<CacheStore<K, V>>,
        key: K,
        mutator: MutationFetcher<K, V, A>,
        config: SwrConfig<K, V>,
    ) -> Self {
        let entry = store.entry(&key);
        let (state, _) = watch::channel(TriggerState::default());
        MutationTrigger {
            store,
            entry,
            key,
            mutator,
            config: Arc::new(config),
            state,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Run the remote mutation with `argument`.
    pub async fn trigger(
        &self,
        argument: A,
        options: TriggerOptions<V>,
    ) -> Result<Option<V>, SwrError> {
        self.set_state(|state| {
            state.is_mutating = true;
            state.error = None;
        });

        let previous = self.entry.snapshot().data;
        let optimistic_shown = options.optimistic_data.is_some();
        if let Some(optimistic) = options.optimistic_data.clone() {
            self.entry.update(Some(optimistic), false);
        }

        let outcome = (self.mutator)(self.key.clone(), argument).await;
        match outcome {
            Ok(value) => {
                if options.populate_cache {
                    self.entry.update(value.clone(), false);
                } else if optimistic_shown {
                    // the optimistic value was never meant to be kept
                    self.entry.update(previous, true);
                }
                if options.revalidate {
                    self.store.request_revalidation(self.key.clone());
                }
                self.set_state(|state| {
                    state.is_mutating = false;
                    state.data = value.clone();
                    state.error = None;
                });
                Ok(value)
            }
            Err(cause) => {
                if options.rollback_on_error && optimistic_shown {
                    self.entry.update(previous, true);
                }
                if let Some(on_error) = &self.config.on_error {
                    on_error(&cause, &self.key, &self.config);
                }
                self.set_state(|state| {
                    state.is_mutating = false;
                    state.error = Some(cause.clone());
                });
                Err(SwrError::Fetch(cause))
            }
        }
    }

    /// Restore the initial trigger state.
    ///
    /// Only the observable state is reset; an invocation already in flight
    /// is not cancelled and will still run to completion.
    pub fn reset(&self) {
        self.set_state(|state| *state = TriggerState::default());
    }

    pub fn state(&self) -> TriggerState<V> {
        self.state.borrow().clone()
    }

    pub fn states(&self) -> impl Stream<Item = TriggerState<V>> + Send + 'static {
        WatchStream::new(self.state.subscribe())
    }

    fn set_state(&self, mutate: impl FnOnce(&mut TriggerState<V>)) {
        self.state.send_if_modified(|state| {
            let before = state.clone();
            mutate(state);
            *state != before
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryState;

    fn trigger_over(
        store: Arc<CacheStore<String, String>>,
        result: Result<Option<String>, &'static str>,
    ) -> MutationTrigger<String, String, String> {
        let result = result.map_err(FetchError::msg);
        MutationTrigger::new(
            store,
            "k".to_string(),
            mutation_fetcher(move |_key: String, argument: String| {
                let result = result.clone().map(|value| value.map(|v| format!("{v}:{argument}")));
                async move { result }
            }),
            SwrConfig::new(),
        )
    }

    #[tokio::test]
    async fn test_success_without_populate_restores_snapshot() {
        let store = Arc::new(CacheStore::new());
        store
            .entry(&"k".to_string())
            .update(Some("old".to_string()), false);
        let trigger = trigger_over(store.clone(), Ok(Some("new".to_string())));

        let mut requests = store.revalidation_requests();
        let result = trigger
            .trigger(
                "arg".to_string(),
                TriggerOptions::new().optimistic_data("shown".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(result.as_deref(), Some("new:arg"));
        // optimistic value was shown but not kept
        assert_eq!(
            store.entry(&"k".to_string()).snapshot().data.as_deref(),
            Some("old")
        );
        // the shared store was asked to revalidate
        assert_eq!(requests.recv().await.unwrap(), "k");

        let state = trigger.state();
        assert!(!state.is_mutating);
        assert_eq!(state.data.as_deref(), Some("new:arg"));
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_populate_cache_writes_result() {
        let store = Arc::new(CacheStore::new());
        let trigger = trigger_over(store.clone(), Ok(Some("new".to_string())));

        trigger
            .trigger(
                "arg".to_string(),
                TriggerOptions::new().populate_cache(true).revalidate(false),
            )
            .await
            .unwrap();

        let snapshot = store.entry(&"k".to_string()).snapshot();
        assert_eq!(snapshot.data.as_deref(), Some("new:arg"));
        assert_eq!(snapshot.state, EntryState::Fixed);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_and_records_error() {
        let store = Arc::new(CacheStore::new());
        store
            .entry(&"k".to_string())
            .update(Some("old".to_string()), false);
        let trigger = trigger_over(store.clone(), Err("rejected"));

        let result = trigger
            .trigger(
                "arg".to_string(),
                TriggerOptions::new().optimistic_data("shown".to_string()),
            )
            .await;

        assert!(matches!(result, Err(SwrError::Fetch(_))));
        assert_eq!(
            store.entry(&"k".to_string()).snapshot().data.as_deref(),
            Some("old")
        );
        let state = trigger.state();
        assert!(!state.is_mutating);
        assert!(state.error.is_some());

        trigger.reset();
        assert_eq!(trigger.state(), TriggerState::default());
    }
}
