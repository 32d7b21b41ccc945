use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::FetchError;
use crate::store::{CacheKey, CacheValue};

/// Durable storage behind a cache cell.
///
/// A persister is consulted only as a fallback when the in-memory cell has no
/// value, and is written through on every cache write (including clears,
/// which save `None`). Implementations own their serialization format and
/// their own consistency; the engine treats persister failures as
/// non-fatal and only logs them.
#[async_trait]
pub trait Persister<K, V>: Send + Sync {
    /// Load the stored value for `key`, `None` on a miss.
    async fn load_data(&self, key: &K) -> Result<Option<V>, FetchError>;

    /// Store (or, with `None`, delete) the value for `key`.
    async fn save_data(&self, key: &K, data: Option<&V>) -> Result<(), FetchError>;
}

/// In-memory persister.
///
/// Useful in tests and for embeddings that only want the write-through shape
/// without a durable backend.
pub struct MemoryPersister<K, V> {
    state: RwLock<HashMap<K, V>>,
}

impl<K, V> MemoryPersister<K, V> {
    pub fn new() -> Self {
        MemoryPersister {
            state: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for MemoryPersister<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> Persister<K, V> for MemoryPersister<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn load_data(&self, key: &K) -> Result<Option<V>, FetchError> {
        let state = self.state.read().await;
        Ok(state.get(key).cloned())
    }

    async fn save_data(&self, key: &K, data: Option<&V>) -> Result<(), FetchError> {
        let mut state = self.state.write().await;
        match data {
            Some(value) => {
                state.insert(key.clone(), value.clone());
            }
            None => {
                state.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_save_delete() {
        let persister: MemoryPersister<String, String> = MemoryPersister::new();

        let result = persister.load_data(&"k".to_string()).await.unwrap();
        assert!(result.is_none());

        persister
            .save_data(&"k".to_string(), Some(&"v".to_string()))
            .await
            .unwrap();
        let result = persister.load_data(&"k".to_string()).await.unwrap();
        assert_eq!(result.as_deref(), Some("v"));

        persister.save_data(&"k".to_string(), None).await.unwrap();
        let result = persister.load_data(&"k".to_string()).await.unwrap();
        assert!(result.is_none());
    }
}
