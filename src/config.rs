use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::FetchError;
use crate::store::{CacheKey, CacheValue};

/// Invoked when a fetch is still running after `loading_timeout`.
pub type LoadingSlowCallback<K, V> = Arc<dyn Fn(&K, &SwrConfig<K, V>) + Send + Sync>;

/// Invoked after a successful validation, with the fetched value.
pub type SuccessCallback<K, V> = Arc<dyn Fn(Option<&V>, &K, &SwrConfig<K, V>) + Send + Sync>;

/// Invoked after a failed validation, before any retry is scheduled.
pub type ErrorCallback<K, V> = Arc<dyn Fn(&FetchError, &K, &SwrConfig<K, V>) + Send + Sync>;

/// Gate checked before every validation attempt.
pub type PauseGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Handed to a retry strategy to run one deduplication-exempt revalidation.
pub type RevalidateFn = Arc<dyn Fn(RetryOptions) -> BoxFuture<'static, ()> + Send + Sync>;

/// Pluggable reaction to a failed fetch.
pub type RetryStrategy<K, V> = Arc<
    dyn Fn(FetchError, K, Arc<SwrConfig<K, V>>, RevalidateFn, RetryOptions) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Bookkeeping passed to a retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    /// 1 for the first retry of a failure streak, increasing by one per
    /// consecutive failure. Resets when a validation succeeds.
    pub retry_count: u32,
    /// True when this failure starts a new streak while a previously
    /// scheduled retry task is still pending. The default strategy bails out
    /// in that case instead of stacking a second delayed retry.
    pub dedupe: bool,
}

/// Revalidation, retry and pagination knobs for one call site.
///
/// A config is an immutable value. Build one with [`SwrConfig::builder`],
/// derive a child with [`SwrConfig::derive`]: the child copies every field
/// of the parent except `fallback_data`, which is never inherited.
pub struct SwrConfig<K, V> {
    /// Revalidate on creation even when data is already cached.
    pub revalidate_if_stale: bool,
    /// Tri-state mount override: `Some(true)` always revalidates on
    /// creation, `Some(false)` never does, `None` falls back to
    /// `revalidate_if_stale` / cache presence.
    pub revalidate_on_mount: Option<bool>,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    /// Polling period; zero disables polling.
    pub refresh_interval: Duration,
    /// Keep polling while the host is not foregrounded.
    pub refresh_when_hidden: bool,
    /// Keep polling while offline.
    pub refresh_when_offline: bool,
    pub should_retry_on_error: bool,
    /// Window after a validation during which further manual validations
    /// are suppressed.
    pub deduping_interval: Duration,
    /// Minimum spacing between focus-triggered revalidations.
    pub focus_throttle_interval: Duration,
    /// How long a fetch may run before `on_loading_slow` fires.
    pub loading_timeout: Duration,
    /// Base unit of the exponential retry backoff.
    pub error_retry_interval: Duration,
    /// Maximum retry count per failure streak; `None` means unbounded.
    pub error_retry_count: Option<u32>,
    /// Substituted into observed states while the cache has no data.
    /// Never inherited by derived configs.
    pub fallback_data: Option<V>,
    pub on_loading_slow: Option<LoadingSlowCallback<K, V>>,
    pub on_success: Option<SuccessCallback<K, V>>,
    pub on_error: Option<ErrorCallback<K, V>>,
    pub on_error_retry: RetryStrategy<K, V>,
    /// When set and returning true, every validation attempt is suppressed.
    pub is_paused: Option<PauseGate>,

    // pagination knobs, consumed by the infinite composition
    pub initial_size: usize,
    pub revalidate_all: bool,
    pub revalidate_first_page: bool,
    pub persist_size: bool,
    pub keep_previous_data: bool,
    pub parallel: bool,
}

impl<K, V> SwrConfig<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new() -> Self {
        SwrConfig {
            revalidate_if_stale: true,
            revalidate_on_mount: None,
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            refresh_interval: Duration::ZERO,
            refresh_when_hidden: false,
            refresh_when_offline: false,
            should_retry_on_error: true,
            deduping_interval: Duration::from_secs(2),
            focus_throttle_interval: Duration::from_secs(5),
            loading_timeout: Duration::from_secs(3),
            error_retry_interval: Duration::from_secs(5),
            error_retry_count: None,
            fallback_data: None,
            on_loading_slow: None,
            on_success: None,
            on_error: None,
            on_error_retry: default_error_retry(),
            is_paused: None,
            initial_size: 1,
            revalidate_all: false,
            revalidate_first_page: true,
            persist_size: false,
            keep_previous_data: false,
            parallel: false,
        }
    }

    pub fn builder() -> ConfigBuilder<K, V> {
        ConfigBuilder {
            config: Self::new(),
        }
    }

    /// Start a child config from this one.
    ///
    /// Every field is copied except `fallback_data`, which is reset to
    /// absent: fallbacks describe one call site and must be opted into
    /// again explicitly.
    pub fn derive(&self) -> ConfigBuilder<K, V> {
        let mut config = self.clone();
        config.fallback_data = None;
        ConfigBuilder { config }
    }

    pub(crate) fn paused(&self) -> bool {
        self.is_paused.as_ref().is_some_and(|gate| gate())
    }
}

impl<K, V> Default for SwrConfig<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for SwrConfig<K, V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        SwrConfig {
            revalidate_if_stale: self.revalidate_if_stale,
            revalidate_on_mount: self.revalidate_on_mount,
            revalidate_on_focus: self.revalidate_on_focus,
            revalidate_on_reconnect: self.revalidate_on_reconnect,
            refresh_interval: self.refresh_interval,
            refresh_when_hidden: self.refresh_when_hidden,
            refresh_when_offline: self.refresh_when_offline,
            should_retry_on_error: self.should_retry_on_error,
            deduping_interval: self.deduping_interval,
            focus_throttle_interval: self.focus_throttle_interval,
            loading_timeout: self.loading_timeout,
            error_retry_interval: self.error_retry_interval,
            error_retry_count: self.error_retry_count,
            fallback_data: self.fallback_data.clone(),
            on_loading_slow: self.on_loading_slow.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_error_retry: self.on_error_retry.clone(),
            is_paused: self.is_paused.clone(),
            initial_size: self.initial_size,
            revalidate_all: self.revalidate_all,
            revalidate_first_page: self.revalidate_first_page,
            persist_size: self.persist_size,
            keep_previous_data: self.keep_previous_data,
            parallel: self.parallel,
        }
    }
}

impl<K, V> fmt::Debug for SwrConfig<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwrConfig")
            .field("revalidate_if_stale", &self.revalidate_if_stale)
            .field("revalidate_on_mount", &self.revalidate_on_mount)
            .field("revalidate_on_focus", &self.revalidate_on_focus)
            .field("revalidate_on_reconnect", &self.revalidate_on_reconnect)
            .field("refresh_interval", &self.refresh_interval)
            .field("deduping_interval", &self.deduping_interval)
            .field("focus_throttle_interval", &self.focus_throttle_interval)
            .field("loading_timeout", &self.loading_timeout)
            .field("error_retry_interval", &self.error_retry_interval)
            .field("error_retry_count", &self.error_retry_count)
            .field("should_retry_on_error", &self.should_retry_on_error)
            .field("initial_size", &self.initial_size)
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

/// Builder producing an immutable [`SwrConfig`].
pub struct ConfigBuilder<K, V> {
    config: SwrConfig<K, V>,
}

impl<K, V> ConfigBuilder<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn revalidate_if_stale(mut self, enabled: bool) -> Self {
        self.config.revalidate_if_stale = enabled;
        self
    }

    pub fn revalidate_on_mount(mut self, enabled: bool) -> Self {
        self.config.revalidate_on_mount = Some(enabled);
        self
    }

    pub fn revalidate_on_focus(mut self, enabled: bool) -> Self {
        self.config.revalidate_on_focus = enabled;
        self
    }

    pub fn revalidate_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.revalidate_on_reconnect = enabled;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = interval;
        self
    }

    pub fn refresh_when_hidden(mut self, enabled: bool) -> Self {
        self.config.refresh_when_hidden = enabled;
        self
    }

    pub fn refresh_when_offline(mut self, enabled: bool) -> Self {
        self.config.refresh_when_offline = enabled;
        self
    }

    pub fn should_retry_on_error(mut self, enabled: bool) -> Self {
        self.config.should_retry_on_error = enabled;
        self
    }

    pub fn deduping_interval(mut self, interval: Duration) -> Self {
        self.config.deduping_interval = interval;
        self
    }

    pub fn focus_throttle_interval(mut self, interval: Duration) -> Self {
        self.config.focus_throttle_interval = interval;
        self
    }

    pub fn loading_timeout(mut self, timeout: Duration) -> Self {
        self.config.loading_timeout = timeout;
        self
    }

    pub fn error_retry_interval(mut self, interval: Duration) -> Self {
        self.config.error_retry_interval = interval;
        self
    }

    pub fn error_retry_count(mut self, count: u32) -> Self {
        self.config.error_retry_count = Some(count);
        self
    }

    pub fn fallback_data(mut self, data: V) -> Self {
        self.config.fallback_data = Some(data);
        self
    }

    pub fn on_loading_slow<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, &SwrConfig<K, V>) + Send + Sync + 'static,
    {
        self.config.on_loading_slow = Some(Arc::new(callback));
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&V>, &K, &SwrConfig<K, V>) + Send + Sync + 'static,
    {
        self.config.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FetchError, &K, &SwrConfig<K, V>) + Send + Sync + 'static,
    {
        self.config.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_error_retry(mut self, strategy: RetryStrategy<K, V>) -> Self {
        self.config.on_error_retry = strategy;
        self
    }

    pub fn is_paused<F>(mut self, gate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.config.is_paused = Some(Arc::new(gate));
        self
    }

    pub fn initial_size(mut self, size: usize) -> Self {
        self.config.initial_size = size;
        self
    }

    pub fn revalidate_all(mut self, enabled: bool) -> Self {
        self.config.revalidate_all = enabled;
        self
    }

    pub fn revalidate_first_page(mut self, enabled: bool) -> Self {
        self.config.revalidate_first_page = enabled;
        self
    }

    pub fn persist_size(mut self, enabled: bool) -> Self {
        self.config.persist_size = enabled;
        self
    }

    pub fn keep_previous_data(mut self, enabled: bool) -> Self {
        self.config.keep_previous_data = enabled;
        self
    }

    pub fn parallel(mut self, enabled: bool) -> Self {
        self.config.parallel = enabled;
        self
    }

    pub fn build(self) -> SwrConfig<K, V> {
        self.config
    }
}

/// The default retry strategy: randomized exponential backoff.
///
/// Waits `floor((U(0,1) + 0.5) * 2^retry_count) * error_retry_interval`
/// before revalidating, gives up beyond `error_retry_count`, and skips
/// entirely when another retry task is already pending (`dedupe`).
pub fn default_error_retry<K, V>() -> RetryStrategy<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    Arc::new(|_error, key, config, revalidate, options| {
        Box::pin(async move {
            if options.dedupe {
                tracing::debug!(key = ?key, "retry skipped, another retry task is pending");
                return;
            }
            if let Some(max) = config.error_retry_count {
                if options.retry_count > max {
                    tracing::debug!(key = ?key, retry_count = options.retry_count, "retry budget exhausted");
                    return;
                }
            }
            // exponent capped to keep the multiplier in range
            let exponent = 2f64.powi(options.retry_count.min(16) as i32);
            let factor = ((rand::random::<f64>() + 0.5) * exponent).floor();
            let delay = config.error_retry_interval.mul_f64(factor);
            tracing::trace!(key = ?key, retry_count = options.retry_count, ?delay, "scheduling retry");
            tokio::time::sleep(delay).await;
            revalidate(options).await;
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: SwrConfig<String, String> = SwrConfig::new();
        assert!(config.revalidate_if_stale);
        assert_eq!(config.revalidate_on_mount, None);
        assert!(config.revalidate_on_focus);
        assert!(config.revalidate_on_reconnect);
        assert_eq!(config.refresh_interval, Duration::ZERO);
        assert_eq!(config.deduping_interval, Duration::from_secs(2));
        assert_eq!(config.focus_throttle_interval, Duration::from_secs(5));
        assert_eq!(config.loading_timeout, Duration::from_secs(3));
        assert_eq!(config.error_retry_interval, Duration::from_secs(5));
        assert_eq!(config.error_retry_count, None);
        assert_eq!(config.initial_size, 1);
        assert!(config.revalidate_first_page);
        assert!(!config.persist_size);
        assert!(!config.parallel);
    }

    #[test]
    fn test_derive_inherits_everything_but_fallback() {
        let parent: SwrConfig<String, String> = SwrConfig::builder()
            .deduping_interval(Duration::from_millis(123))
            .revalidate_on_focus(false)
            .fallback_data("fallback".to_string())
            .build();

        let child = parent.derive().build();
        assert_eq!(child.deduping_interval, Duration::from_millis(123));
        assert!(!child.revalidate_on_focus);
        assert_eq!(child.fallback_data, None);

        // overriding in the child does not touch the parent
        let narrowed = parent.derive().revalidate_on_reconnect(false).build();
        assert!(!narrowed.revalidate_on_reconnect);
        assert!(parent.revalidate_on_reconnect);
    }

    #[test]
    fn test_pause_gate() {
        let config: SwrConfig<String, String> =
            SwrConfig::builder().is_paused(|| true).build();
        assert!(config.paused());
        assert!(!SwrConfig::<String, String>::new().paused());
    }
}
