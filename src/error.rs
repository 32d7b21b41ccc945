use std::fmt;
use std::sync::Arc;

/// Error type for cache and revalidation operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SwrError {
    /// A fetch for this key is already in flight; the call was a no-op.
    #[error("a revalidation for this key is already in flight")]
    AlreadyLoading,
    /// The call landed inside the deduping window of a previous validation.
    #[error("revalidation suppressed within the deduping interval")]
    Deduped,
    /// The pause gate is closed; no fetch was attempted.
    #[error("revalidation suppressed while paused")]
    Paused,
    /// No local data is available for the key.
    #[error("no cached data for this key")]
    NoData,
    /// The fetcher (or a mutation body) failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl SwrError {
    /// Whether this is a local control-flow signal rather than a real
    /// failure. Local signals are never reported through `on_error`.
    pub fn is_suppression(&self) -> bool {
        matches!(
            self,
            SwrError::AlreadyLoading | SwrError::Deduped | SwrError::Paused
        )
    }
}

/// A clonable fetch failure.
///
/// Fetch errors are stored inside cache state and replayed to late
/// subscribers, so they must be cheap to clone. Equality is by identity:
/// two handles are equal only when they wrap the same underlying error,
/// which is what consecutive-duplicate suppression needs.
#[derive(Clone)]
pub struct FetchError {
    inner: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl FetchError {
    /// Wrap any error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        FetchError {
            inner: Arc::new(error),
        }
    }

    /// Create an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        FetchError {
            inner: Arc::new(Message(message.into())),
        }
    }
}

impl PartialEq for FetchError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.inner as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        FetchError::msg(message)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_equality_is_by_identity() {
        let a = FetchError::msg("boom");
        let b = FetchError::msg("boom");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_suppression_classification() {
        assert!(SwrError::AlreadyLoading.is_suppression());
        assert!(SwrError::Deduped.is_suppression());
        assert!(SwrError::Paused.is_suppression());
        assert!(!SwrError::NoData.is_suppression());
        assert!(!SwrError::Fetch(FetchError::msg("boom")).is_suppression());
    }
}
