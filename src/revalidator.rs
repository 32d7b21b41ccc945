use std::future::Future;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::{RetryOptions, RevalidateFn, SwrConfig};
use crate::error::{FetchError, SwrError};
use crate::mutate::{run_mutate, MutateOptions};
use crate::scope::Scope;
use crate::selector::{DataSelector, Fetcher, GetFrom};
use crate::signals::{HostLifecycle, Signals};
use crate::state::{state_stream, StoreState};
use crate::store::{CacheKey, CacheStore, CacheValue};

/// Decides *when* one key is revalidated; the wrapped [`DataSelector`]
/// decides *how*.
///
/// Construction spawns the configured trigger tasks (mount check, focus
/// listener, reconnect listener, polling loop, revalidation-request
/// listener) as children of the caller's [`Scope`]. Dropping the
/// revalidator cancels them; cancelling the caller's scope does too.
pub struct Revalidator<K, V> {
    inner: Arc<RevalidatorInner<K, V>>,
    scope: Scope,
}

struct RevalidatorInner<K, V> {
    selector: Arc<DataSelector<K, V>>,
    config: Arc<SwrConfig<K, V>>,
    signals: Arc<Signals>,
    scope: Scope,
    /// Instant the current dedup window was opened, if any.
    dedup_window: Mutex<Option<Instant>>,
    retries: Arc<Mutex<RetryBookkeeping>>,
}

#[derive(Default)]
struct RetryBookkeeping {
    /// Consecutive failures since the last success.
    consecutive: u32,
    /// Retry tasks currently scheduled or running.
    active: usize,
}

/// Decrements the active-retry counter when a retry task ends, whether it
/// ran to completion or was cancelled with its scope.
struct RetryTaskGuard(Arc<Mutex<RetryBookkeeping>>);

impl Drop for RetryTaskGuard {
    fn drop(&mut self) {
        self.0.lock().active -= 1;
    }
}

impl<K, V> Revalidator<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(
        store: &CacheStore<K, V>,
        key: K,
        fetch: Fetcher<K, V>,
        config: SwrConfig<K, V>,
        signals: Arc<Signals>,
        scope: &Scope,
    ) -> Self {
        let selector = Arc::new(DataSelector::new(store, key, fetch));
        Self::from_selector(selector, store, config, signals, scope)
    }

    /// Wrap an existing selector, e.g. one constructed with a persister.
    pub fn from_selector(
        selector: Arc<DataSelector<K, V>>,
        store: &CacheStore<K, V>,
        config: SwrConfig<K, V>,
        signals: Arc<Signals>,
        scope: &Scope,
    ) -> Self {
        let scope = scope.child();
        let inner = Arc::new(RevalidatorInner {
            selector,
            config: Arc::new(config),
            signals,
            scope: scope.clone(),
            dedup_window: Mutex::new(None),
            retries: Arc::new(Mutex::new(RetryBookkeeping::default())),
        });

        spawn_mount_check(&inner);
        spawn_focus_listener(&inner);
        spawn_reconnect_listener(&inner);
        spawn_polling_loop(&inner);
        spawn_request_listener(&inner, store.revalidation_requests());

        Revalidator { inner, scope }
    }

    pub fn key(&self) -> &K {
        self.inner.selector.key()
    }

    pub fn config(&self) -> &SwrConfig<K, V> {
        &self.inner.config
    }

    pub fn selector(&self) -> &Arc<DataSelector<K, V>> {
        &self.inner.selector
    }

    /// Observable state stream with `fallback_data` substituted while the
    /// cache has no data.
    pub fn states(&self) -> impl Stream<Item = StoreState<V>> + Send + 'static {
        state_stream(
            self.inner.selector.subscribe(),
            self.inner.config.fallback_data.clone(),
        )
    }

    /// Manually revalidate, subject to the pause gate and the dedup window.
    pub async fn revalidate(&self) -> Result<Option<V>, SwrError> {
        revalidate(&self.inner, None).await
    }

    /// Run the optimistic-mutation protocol with no body: snapshot, then
    /// revalidate per options.
    pub async fn mutate(&self, options: MutateOptions<V>) -> Result<Option<V>, SwrError> {
        run_mutate(&self.inner.selector, options, None).await
    }

    /// Run the optimistic-mutation protocol around `body`.
    pub async fn mutate_with<Fut>(
        &self,
        body: Fut,
        options: MutateOptions<V>,
    ) -> Result<Option<V>, SwrError>
    where
        Fut: Future<Output = Result<Option<V>, FetchError>> + Send + 'static,
    {
        run_mutate(&self.inner.selector, options, Some(Box::pin(body))).await
    }
}

impl<K, V> Drop for Revalidator<K, V> {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// One validation attempt: pause gate, dedup window, loading-timeout
/// watchdog, callbacks and retry scheduling around the selector's fetch.
///
/// `retry` is `Some` only for attempts scheduled by a retry strategy; those
/// bypass the dedup-window check (but still open a new window).
async fn revalidate<K, V>(
    inner: &Arc<RevalidatorInner<K, V>>,
    retry: Option<RetryOptions>,
) -> Result<Option<V>, SwrError>
where
    K: CacheKey,
    V: CacheValue,
{
    let config = &inner.config;
    let key = inner.selector.key();

    if config.paused() {
        tracing::debug!(key = ?key, "revalidation suppressed, pause gate closed");
        return Err(SwrError::Paused);
    }

    {
        let mut window = inner.dedup_window.lock();
        if retry.is_none() {
            if let Some(opened) = *window {
                if opened.elapsed() < config.deduping_interval {
                    tracing::debug!(key = ?key, "revalidation suppressed, deduping window open");
                    return Err(SwrError::Deduped);
                }
            }
        }
        *window = Some(Instant::now());
    }

    let validate = inner.selector.validate();
    tokio::pin!(validate);
    let result = if config.on_loading_slow.is_some() {
        match tokio::time::timeout(config.loading_timeout, &mut validate).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(on_loading_slow) = &config.on_loading_slow {
                    on_loading_slow(key, config.as_ref());
                }
                validate.await
            }
        }
    } else {
        validate.await
    };

    match &result {
        Ok(value) => {
            inner.retries.lock().consecutive = 0;
            if let Some(on_success) = &config.on_success {
                on_success(value.as_ref(), key, config.as_ref());
            }
        }
        Err(SwrError::Fetch(cause)) => {
            if let Some(on_error) = &config.on_error {
                on_error(cause, key, config.as_ref());
            }
            schedule_retry(inner, cause.clone());
        }
        // AlreadyLoading / Deduped / Paused are local signals, not failures
        Err(_) => {}
    }
    result
}

fn schedule_retry<K, V>(inner: &Arc<RevalidatorInner<K, V>>, cause: FetchError)
where
    K: CacheKey,
    V: CacheValue,
{
    let config = &inner.config;
    if !config.should_retry_on_error {
        return;
    }

    let options = {
        let mut retries = inner.retries.lock();
        let dedupe = retries.consecutive == 0 && retries.active > 0;
        retries.consecutive += 1;
        retries.active += 1;
        RetryOptions {
            retry_count: retries.consecutive,
            dedupe,
        }
    };
    let guard = RetryTaskGuard(Arc::clone(&inner.retries));

    let strategy = config.on_error_retry.clone();
    let key = inner.selector.key().clone();
    let config = Arc::clone(config);
    let revalidate_fn = make_revalidate_fn(inner);
    inner.scope.spawn(async move {
        let _guard = guard;
        strategy(cause, key, config, revalidate_fn, options).await;
    });
}

fn make_revalidate_fn<K, V>(inner: &Arc<RevalidatorInner<K, V>>) -> RevalidateFn
where
    K: CacheKey,
    V: CacheValue,
{
    let inner = Arc::clone(inner);
    Arc::new(move |options| {
        let inner = Arc::clone(&inner);
        Box::pin(async move {
            let _ = revalidate(&inner, Some(options)).await;
        })
    })
}

fn spawn_mount_check<K, V>(inner: &Arc<RevalidatorInner<K, V>>)
where
    K: CacheKey,
    V: CacheValue,
{
    let scope = inner.scope.clone();
    let inner = Arc::clone(inner);
    scope.spawn(async move {
        let should = match inner.config.revalidate_on_mount {
            Some(explicit) => explicit,
            None => {
                inner.config.revalidate_if_stale
                    || inner
                        .selector
                        .get(GetFrom::LocalOnly)
                        .await
                        .ok()
                        .flatten()
                        .is_none()
            }
        };
        if !should {
            return;
        }
        if let Err(error) = revalidate(&inner, None).await {
            if !error.is_suppression() {
                tracing::debug!(key = ?inner.selector.key(), error = %error, "mount revalidation failed");
            }
        }
    });
}

fn spawn_focus_listener<K, V>(inner: &Arc<RevalidatorInner<K, V>>)
where
    K: CacheKey,
    V: CacheValue,
{
    if !inner.config.revalidate_on_focus {
        return;
    }
    let scope = inner.scope.clone();
    let mut events = inner.signals.focus_events();
    let inner = Arc::clone(inner);
    scope.spawn(async move {
        let mut last_validated: Option<Instant> = None;
        loop {
            match events.recv().await {
                Ok(()) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
            let throttled = last_validated
                .is_some_and(|at| at.elapsed() < inner.config.focus_throttle_interval);
            if throttled {
                tracing::trace!(key = ?inner.selector.key(), "focus revalidation throttled");
                continue;
            }
            last_validated = Some(Instant::now());
            let _ = revalidate(&inner, None).await;
        }
    });
}

fn spawn_reconnect_listener<K, V>(inner: &Arc<RevalidatorInner<K, V>>)
where
    K: CacheKey,
    V: CacheValue,
{
    if !inner.config.revalidate_on_reconnect {
        return;
    }
    let scope = inner.scope.clone();
    let mut online = inner.signals.online_changes();
    let inner = Arc::clone(inner);
    scope.spawn(async move {
        loop {
            if online.changed().await.is_err() {
                return;
            }
            // setters dedup, so a wakeup with `true` is a real reconnect
            if !*online.borrow_and_update() {
                continue;
            }
            if inner.signals.lifecycle() < HostLifecycle::Started {
                tracing::trace!(key = ?inner.selector.key(), "reconnect ignored, host not started");
                continue;
            }
            let _ = revalidate(&inner, None).await;
        }
    });
}

fn spawn_polling_loop<K, V>(inner: &Arc<RevalidatorInner<K, V>>)
where
    K: CacheKey,
    V: CacheValue,
{
    let interval = inner.config.refresh_interval;
    if interval.is_zero() {
        return;
    }
    let scope = inner.scope.clone();
    let inner = Arc::clone(inner);
    scope.spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let offline_ok = inner.config.refresh_when_offline || inner.signals.is_online();
            let hidden_ok = inner.config.refresh_when_hidden
                || inner.signals.lifecycle() == HostLifecycle::Active;
            if !(offline_ok && hidden_ok) {
                continue;
            }
            let _ = revalidate(&inner, None).await;
        }
    });
}

fn spawn_request_listener<K, V>(
    inner: &Arc<RevalidatorInner<K, V>>,
    mut requests: broadcast::Receiver<K>,
) where
    K: CacheKey,
    V: CacheValue,
{
    let scope = inner.scope.clone();
    let inner = Arc::clone(inner);
    scope.spawn(async move {
        loop {
            match requests.recv().await {
                Ok(key) if key == *inner.selector.key() => {
                    let _ = revalidate(&inner, None).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}
