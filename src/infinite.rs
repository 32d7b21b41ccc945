use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{join_all, select_all, BoxFuture};
use futures::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::config::SwrConfig;
use crate::entry::EntrySnapshot;
use crate::error::{FetchError, SwrError};
use crate::scope::Scope;
use crate::selector::{DataSelector, Fetcher, GetFrom};
use crate::signals::Signals;
use crate::state::StoreState;
use crate::store::{CacheKey, CacheStore, CacheValue};
use crate::revalidator::Revalidator;

/// Computes the key for page `index`, given the previous page's data.
///
/// Returning `None` stops pagination at that slot.
pub type KeyFn<K, V> = Arc<dyn Fn(usize, Option<&V>) -> Option<K> + Send + Sync>;

/// Box a closure into a [`KeyFn`].
pub fn key_fn<K, V, F>(get_key: F) -> KeyFn<K, V>
where
    F: Fn(usize, Option<&V>) -> Option<K> + Send + Sync + 'static,
{
    Arc::new(get_key)
}

/// Options for a mutation fanned out over all current pages.
#[derive(Clone)]
pub struct InfiniteMutateOptions<V> {
    /// Per-page optimistic values, aligned with the page list; `None`
    /// entries leave that page untouched.
    pub optimistic_data: Option<Vec<Option<V>>>,
    pub revalidate: bool,
    pub populate_cache: bool,
    pub rollback_on_error: bool,
}

impl<V> InfiniteMutateOptions<V> {
    pub fn new() -> Self {
        InfiniteMutateOptions {
            optimistic_data: None,
            revalidate: true,
            populate_cache: true,
            rollback_on_error: true,
        }
    }

    pub fn optimistic_data(mut self, data: Vec<Option<V>>) -> Self {
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

impl<V> Default for InfiniteMutateOptions<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// A growable list of independently cached pages composed into one
/// aggregate observable list.
///
/// Each page is its own [`Revalidator`] over its own cache key; the
/// aggregate state is `Error` as soon as any page errored (first error
/// wins), `Loading` while any page loads, and `Completed` once every page
/// settled. It always carries the full list of last known page values,
/// `None` where a page has produced nothing yet.
pub struct InfiniteRevalidator<K, V> {
    inner: Arc<InfiniteInner<K, V>>,
    scope: Scope,
}

struct InfiniteInner<K, V> {
    store: Arc<CacheStore<K, V>>,
    get_key: KeyFn<K, V>,
    fetch: Fetcher<K, V>,
    config: Arc<SwrConfig<K, V>>,
    signals: Arc<Signals>,
    scope: Scope,
    size: AtomicUsize,
    pages: tokio::sync::Mutex<PageSet<K, V>>,
    aggregate: Arc<watch::Sender<StoreState<Vec<Option<V>>>>>,
}

struct PageSet<K, V> {
    units: Vec<PageUnit<K, V>>,
    /// Key resolved for page 0 on the previous composition; a change means
    /// the underlying resource identity changed and pagination resets.
    first_key: Option<K>,
    combiner: Scope,
}

struct PageUnit<K, V> {
    key: K,
    revalidator: Revalidator<K, V>,
}

impl<K, V> PageUnit<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn create(inner: &Arc<InfiniteInner<K, V>>, index: usize, key: K) -> Self {
        let config = &inner.config;
        let full = config.revalidate_all || (config.revalidate_first_page && index == 0);
        let mut builder = config.derive();
        if !full {
            builder = builder
                .revalidate_if_stale(false)
                .revalidate_on_focus(false)
                .revalidate_on_reconnect(false);
        }
        let revalidator = Revalidator::new(
            &inner.store,
            key.clone(),
            Arc::clone(&inner.fetch),
            builder.build(),
            Arc::clone(&inner.signals),
            &inner.scope,
        );
        PageUnit { key, revalidator }
    }
}

impl<K, V> InfiniteRevalidator<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub async fn new(
        store: Arc<CacheStore<K, V>>,
        get_key: KeyFn<K, V>,
        fetch: Fetcher<K, V>,
        config: SwrConfig<K, V>,
        signals: Arc<Signals>,
        scope: &Scope,
    ) -> Self {
        let scope = scope.child();
        let (aggregate, _) = watch::channel(StoreState::Loading(None));
        let initial_size = config.initial_size;
        let inner = Arc::new(InfiniteInner {
            store,
            get_key,
            fetch,
            config: Arc::new(config),
            signals,
            scope: scope.clone(),
            size: AtomicUsize::new(initial_size),
            pages: tokio::sync::Mutex::new(PageSet {
                units: Vec::new(),
                first_key: None,
                combiner: scope.child(),
            }),
            aggregate: Arc::new(aggregate),
        });
        rebuild(&inner).await;
        InfiniteRevalidator { inner, scope }
    }

    /// Current page count (slots after a null-key truncation still count
    /// toward the requested size; the aggregate list is what shrinks).
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Relaxed)
    }

    /// Grow or shrink the page list and recompose it.
    pub async fn set_size(&self, size: usize) {
        self.inner.size.store(size, Ordering::Relaxed);
        rebuild(&self.inner).await;
    }

    /// Re-resolve every page key without changing the requested size.
    ///
    /// Call this when inputs of the key function changed; a changed
    /// first-page key resets the composition unless `persist_size` is set.
    pub async fn recompose(&self) {
        rebuild(&self.inner).await;
    }

    /// Aggregate state stream over all pages.
    pub fn states(&self) -> impl Stream<Item = StoreState<Vec<Option<V>>>> + Send + 'static {
        WatchStream::new(self.inner.aggregate.subscribe())
    }

    /// Current aggregate state.
    pub fn state(&self) -> StoreState<Vec<Option<V>>> {
        self.inner.aggregate.borrow().clone()
    }

    /// Fan the mutation protocol out over all current pages with no body:
    /// snapshot everything, then revalidate every page per options.
    pub async fn mutate(
        &self,
        options: InfiniteMutateOptions<V>,
    ) -> Result<Option<Vec<Option<V>>>, SwrError> {
        self.mutate_inner(options, None).await
    }

    /// Fan the mutation protocol out over all current pages around `body`.
    ///
    /// Each phase (snapshot, optimistic apply, populate, revalidate,
    /// rollback) completes across the whole page list before the next
    /// phase begins.
    pub async fn mutate_with<Fut>(
        &self,
        body: Fut,
        options: InfiniteMutateOptions<V>,
    ) -> Result<Option<Vec<Option<V>>>, SwrError>
    where
        Fut: std::future::Future<Output = Result<Option<Vec<Option<V>>>, FetchError>>
            + Send
            + 'static,
    {
        self.mutate_inner(options, Some(Box::pin(body))).await
    }

    async fn mutate_inner(
        &self,
        options: InfiniteMutateOptions<V>,
        body: Option<BoxFuture<'static, Result<Option<Vec<Option<V>>>, FetchError>>>,
    ) -> Result<Option<Vec<Option<V>>>, SwrError> {
        let selectors: Vec<Arc<DataSelector<K, V>>> = {
            let pages = self.inner.pages.lock().await;
            pages
                .units
                .iter()
                .map(|unit| Arc::clone(unit.revalidator.selector()))
                .collect()
        };

        // snapshot phase: every page, before anything is written
        let previous: Vec<Option<V>> = join_all(
            selectors
                .iter()
                .map(|selector| async move { selector.get(GetFrom::LocalOnly).await.ok().flatten() }),
        )
        .await;

        // optimistic phase
        if let Some(optimistic) = &options.optimistic_data {
            join_all(selectors.iter().zip(optimistic.iter()).filter_map(
                |(selector, value)| {
                    value
                        .clone()
                        .map(|value| async move { selector.update(Some(value), false).await })
                },
            ))
            .await;
        }

        let outcome = match body {
            Some(body) => body.await,
            None => Ok(None),
        };

        match outcome {
            Ok(new_values) => {
                if options.populate_cache {
                    if let Some(values) = &new_values {
                        join_all(selectors.iter().zip(values.iter()).filter_map(
                            |(selector, value)| {
                                value.clone().map(|value| async move {
                                    selector.update(Some(value), false).await
                                })
                            },
                        ))
                        .await;
                    }
                }
                if options.revalidate {
                    join_all(selectors.iter().map(|selector| async move {
                        if let Err(error) = selector.validate().await {
                            if !error.is_suppression() {
                                tracing::debug!(
                                    key = ?selector.key(),
                                    error = %error,
                                    "page revalidation after mutation failed"
                                );
                            }
                        }
                    }))
                    .await;
                }
                Ok(new_values)
            }
            Err(cause) => {
                if options.rollback_on_error {
                    join_all(selectors.iter().zip(previous.into_iter()).map(
                        |(selector, previous)| async move {
                            selector.update(previous, true).await;
                        },
                    ))
                    .await;
                }
                Err(SwrError::Fetch(cause))
            }
        }
    }
}

impl<K, V> Drop for InfiniteRevalidator<K, V> {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// Recompose the page list: resolve keys (chaining previous-page data
/// unless `parallel`), stop at a null key, reuse units whose key is
/// unchanged, reset everything when the first page's key changed, and
/// restart the aggregate combiner over the new set.
async fn rebuild<K, V>(inner: &Arc<InfiniteInner<K, V>>)
where
    K: CacheKey,
    V: CacheValue,
{
    let mut pages = inner.pages.lock().await;
    let config = &inner.config;
    let mut target = inner.size.load(Ordering::Relaxed);

    let first_key = (inner.get_key)(0, None);

    let reset = !config.persist_size
        && pages.first_key.is_some()
        && first_key.is_some()
        && pages.first_key != first_key;

    let kept = (reset && config.keep_previous_data)
        .then(|| inner.aggregate.borrow().data().cloned())
        .flatten();

    let mut previous_units: Vec<Option<PageUnit<K, V>>> =
        pages.units.drain(..).map(Some).collect();
    if reset {
        target = config.initial_size;
        inner.size.store(target, Ordering::Relaxed);
        tracing::debug!(key = ?first_key, size = target, "first page key changed, resetting pages");
        previous_units.clear();
    }
    pages.first_key = first_key.clone();

    let mut units: Vec<PageUnit<K, V>> = Vec::with_capacity(target);
    let mut previous_data: Option<V> = None;
    for index in 0..target {
        let key = if index == 0 {
            first_key.clone()
        } else if config.parallel {
            (inner.get_key)(index, None)
        } else {
            (inner.get_key)(index, previous_data.as_ref())
        };
        let Some(key) = key else { break };

        let reused = previous_units.get_mut(index).and_then(|slot| {
            if slot.as_ref().is_some_and(|unit| unit.key == key) {
                slot.take()
            } else {
                None
            }
        });
        let unit = match reused {
            Some(unit) => unit,
            None => PageUnit::create(inner, index, key),
        };

        previous_data = if config.parallel {
            None
        } else {
            unit.revalidator
                .selector()
                .get(GetFrom::LocalOnly)
                .await
                .ok()
                .flatten()
        };
        units.push(unit);
    }
    pages.units = units;
    // units not carried over are torn down here, cancelling their triggers
    drop(previous_units);

    pages.combiner.cancel();
    pages.combiner = inner.scope.child();
    let receivers: Vec<_> = pages
        .units
        .iter()
        .map(|unit| unit.revalidator.selector().subscribe())
        .collect();
    pages
        .combiner
        .spawn(combine_loop(receivers, Arc::clone(&inner.aggregate), kept));
}

/// Recompute the aggregate whenever any page changes.
async fn combine_loop<V>(
    mut receivers: Vec<watch::Receiver<EntrySnapshot<V>>>,
    aggregate: Arc<watch::Sender<StoreState<Vec<Option<V>>>>>,
    mut kept: Option<Vec<Option<V>>>,
) where
    V: CacheValue,
{
    loop {
        let states: Vec<StoreState<V>> = receivers
            .iter_mut()
            .map(|receiver| StoreState::from_snapshot(&receiver.borrow_and_update()))
            .collect();
        let mut combined = combine(&states);

        // after a reset with keep_previous_data, serve the pre-reset list
        // until the rebuilt pages produce anything of their own
        if let Some(previous) = &kept {
            let no_data_yet = combined
                .data()
                .map_or(true, |list| list.iter().all(Option::is_none));
            if no_data_yet {
                if let StoreState::Loading(_) = combined {
                    combined = StoreState::Loading(Some(previous.clone()));
                }
            } else {
                kept = None;
            }
        }

        aggregate.send_if_modified(|current| {
            if *current != combined {
                *current = combined;
                true
            } else {
                false
            }
        });

        if receivers.is_empty() {
            return;
        }
        let changed = {
            let waits: Vec<_> = receivers
                .iter_mut()
                .map(|receiver| Box::pin(receiver.changed()))
                .collect();
            select_all(waits).await.0
        };
        if changed.is_err() {
            return;
        }
    }
}

fn combine<V>(states: &[StoreState<V>]) -> StoreState<Vec<Option<V>>>
where
    V: CacheValue,
{
    let data: Vec<Option<V>> = states.iter().map(|state| state.data().cloned()).collect();
    if let Some(cause) = states.iter().find_map(StoreState::error) {
        return StoreState::Error(Some(data), cause.clone());
    }
    if states.iter().any(StoreState::is_loading) {
        return StoreState::Loading(Some(data));
    }
    StoreState::Completed(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;

    fn states_of(values: &[StoreState<i32>]) -> StoreState<Vec<Option<i32>>> {
        combine(values)
    }

    #[test]
    fn test_combine_first_error_wins() {
        let cause_a = FetchError::msg("a");
        let cause_b = FetchError::msg("b");
        let combined = states_of(&[
            StoreState::Completed(1),
            StoreState::Error(None, cause_a.clone()),
            StoreState::Error(Some(3), cause_b),
        ]);
        assert_eq!(
            combined,
            StoreState::Error(Some(vec![Some(1), None, Some(3)]), cause_a)
        );
    }

    #[test]
    fn test_combine_loading_preserves_loaded_pages() {
        let combined = states_of(&[StoreState::Completed(1), StoreState::Loading(None)]);
        assert_eq!(combined, StoreState::Loading(Some(vec![Some(1), None])));
    }

    #[test]
    fn test_combine_completed_only_when_all_settled() {
        let combined = states_of(&[StoreState::Completed(1), StoreState::Completed(2)]);
        assert_eq!(combined, StoreState::Completed(vec![Some(1), Some(2)]));

        let empty = states_of(&[]);
        assert_eq!(empty, StoreState::Completed(vec![]));
    }
}
