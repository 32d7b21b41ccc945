use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::selector::DataSelector;
use crate::store::{CacheKey, CacheValue};

/// Handle to a running stream binding.
///
/// Dropping the handle does NOT stop the binding: a subscription may
/// intentionally outlive the scope that created it (e.g. a transient UI
/// binding), so consumption stops only on explicit [`cancel`]
/// (or when the source stream ends).
///
/// [`cancel`]: StreamSubscription::cancel
pub struct StreamSubscription {
    token: CancellationToken,
    errors: watch::Receiver<Option<FetchError>>,
}

impl StreamSubscription {
    /// Stop consuming the source stream.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The adapter's own error signal. Stream failures land here, not in
    /// the shared cache's error state.
    pub fn last_error(&self) -> Option<FetchError> {
        self.errors.borrow().clone()
    }

    pub fn errors(&self) -> impl Stream<Item = Option<FetchError>> + Send + 'static {
        WatchStream::new(self.errors.clone())
    }
}

/// Feed a push-based stream into a key's shared cache cell.
///
/// Every `Ok` value clears the adapter error and is written through
/// `update(data, keep_state = false)`, so pull-based and push-based
/// consumers share one value. An `Err` item becomes the adapter's error
/// signal and leaves the cell's last good value untouched; consumption
/// continues.
pub fn bind_stream<K, V, S>(selector: Arc<DataSelector<K, V>>, stream: S) -> StreamSubscription
where
    K: CacheKey,
    V: CacheValue,
    S: Stream<Item = Result<V, FetchError>> + Send + 'static,
{
    let token = CancellationToken::new();
    let (error_tx, errors) = watch::channel(None);

    let task_token = token.clone();
    tokio::spawn(async move {
        futures::pin_mut!(stream);
        loop {
            let item = tokio::select! {
                _ = task_token.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(value)) => {
                    error_tx.send_if_modified(|error| {
                        if error.is_some() {
                            *error = None;
                            true
                        } else {
                            false
                        }
                    });
                    selector.update(Some(value), false).await;
                }
                Some(Err(cause)) => {
                    tracing::debug!(key = ?selector.key(), error = %cause, "subscription stream failed");
                    error_tx.send_modify(|error| *error = Some(cause));
                }
                None => break,
            }
        }
    });

    StreamSubscription { token, errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryState;
    use crate::selector::fetcher;
    use crate::store::CacheStore;
    use tokio_stream::wrappers::ReceiverStream;

    fn push_selector(store: &CacheStore<String, String>) -> Arc<DataSelector<String, String>> {
        Arc::new(DataSelector::new(
            store,
            "feed".to_string(),
            fetcher(|_key: String| async move { Ok(None) }),
        ))
    }

    #[tokio::test]
    async fn test_values_flow_into_the_shared_cell() {
        let store = CacheStore::new();
        let selector = push_selector(&store);
        let entry = store.entry(&"feed".to_string());
        let mut cell = entry.subscribe();

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let subscription = bind_stream(selector, ReceiverStream::new(rx));

        tx.send(Ok("first".to_string())).await.unwrap();
        cell.changed().await.unwrap();
        assert_eq!(cell.borrow_and_update().data.as_deref(), Some("first"));

        // a stream failure is the adapter's error, not the cell's
        tx.send(Err(FetchError::msg("glitch"))).await.unwrap();
        let mut errors = subscription.errors.clone();
        errors.changed().await.unwrap();
        assert!(subscription.last_error().is_some());
        {
            let snapshot = entry.snapshot();
            assert_eq!(snapshot.data.as_deref(), Some("first"));
            assert_eq!(snapshot.state, EntryState::Fixed);
        }

        // the next good value clears the adapter error
        tx.send(Ok("second".to_string())).await.unwrap();
        cell.changed().await.unwrap();
        assert_eq!(cell.borrow_and_update().data.as_deref(), Some("second"));
        errors.changed().await.unwrap();
        assert!(subscription.last_error().is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_consumption() {
        let store = CacheStore::new();
        let selector = push_selector(&store);
        let entry = store.entry(&"feed".to_string());
        let mut cell = entry.subscribe();

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let subscription = bind_stream(selector, ReceiverStream::new(rx));

        tx.send(Ok("kept".to_string())).await.unwrap();
        cell.changed().await.unwrap();
        cell.mark_unchanged();

        subscription.cancel();
        tokio::task::yield_now().await;

        tx.send(Ok("dropped".to_string())).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(entry.snapshot().data.as_deref(), Some("kept"));
        assert!(subscription.is_cancelled());
    }
}
