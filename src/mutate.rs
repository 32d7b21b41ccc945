use futures::future::BoxFuture;

use crate::error::{FetchError, SwrError};
use crate::selector::{DataSelector, GetFrom};
use crate::store::{CacheKey, CacheValue};

/// Options for an optimistic mutation.
#[derive(Clone)]
pub struct MutateOptions<V> {
    /// Value made visible to observers before the mutation body runs.
    pub optimistic_data: Option<V>,
    /// Revalidate after a successful mutation.
    pub revalidate: bool,
    /// Write the mutation body's result into the cache.
    pub populate_cache: bool,
    /// Restore the pre-mutation snapshot when the body fails.
    pub rollback_on_error: bool,
}

impl<V> MutateOptions<V> {
    pub fn new() -> Self {
        MutateOptions {
            optimistic_data: None,
            revalidate: true,
            populate_cache: true,
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

impl<V> Default for MutateOptions<V> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) type MutationBody<V> = BoxFuture<'static, Result<Option<V>, FetchError>>;

/// The optimistic-mutation protocol over one selector.
///
/// 1. snapshot the current value under `LocalOnly` semantics;
/// 2. apply the optimistic value, if any, so observers see it before the
///    body runs;
/// 3. run the body (no body means "just revalidate");
/// 4. on success, populate the cache with the produced value and
///    revalidate, per options;
/// 5. on failure, restore the snapshot with `keep_state` so a concurrently
///    started revalidation is not forced back to `Fixed`.
///
/// The body's failure is returned to the caller; failures of the follow-up
/// revalidation are only logged.
pub(crate) async fn run_mutate<K, V>(
    selector: &DataSelector<K, V>,
    options: MutateOptions<V>,
    body: Option<MutationBody<V>>,
) -> Result<Option<V>, SwrError>
where
    K: CacheKey,
    V: CacheValue,
{
    let previous = selector.get(GetFrom::LocalOnly).await.ok().flatten();

    if let Some(optimistic) = options.optimistic_data.clone() {
        selector.update(Some(optimistic), false).await;
    }

    let outcome = match body {
        Some(body) => body.await,
        None => Ok(None),
    };

    match outcome {
        Ok(new_value) => {
            if options.populate_cache {
                if let Some(value) = new_value.clone() {
                    selector.update(Some(value), false).await;
                }
            }
            if options.revalidate {
                if let Err(error) = selector.validate().await {
                    if !error.is_suppression() {
                        tracing::debug!(
                            key = ?selector.key(),
                            error = %error,
                            "revalidation after mutation failed"
                        );
                    }
                }
            }
            Ok(new_value)
        }
        Err(cause) => {
            if options.rollback_on_error {
                selector.update(previous, true).await;
            }
            Err(SwrError::Fetch(cause))
        }
    }
}
