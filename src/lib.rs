//! swr-engine - a stale-while-revalidate data-synchronization engine
//!
//! One authoritative cached value per key, served immediately to any number
//! of observers and kept fresh through configurable revalidation triggers:
//! - revalidate on mount, focus, reconnect, on a polling interval, or
//!   manually, with deduplication and retry-with-backoff on failure
//! - optimistic mutation with rollback
//! - infinite (paged) composition over independently cached pages
//! - one-shot remote mutations and push-stream bindings sharing the same
//!   per-key cells
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use swr_engine::{fetcher, CacheStore, Revalidator, Scope, Signals, SwrConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(CacheStore::new());
//!     let signals = Arc::new(Signals::new());
//!     let scope = Scope::new();
//!
//!     let user = Revalidator::new(
//!         &store,
//!         "user:123".to_string(),
//!         fetcher(|id: String| async move {
//!             // load from the API - 'id' is "user:123"
//!             Ok(Some(format!("User data for {id}")))
//!         }),
//!         SwrConfig::builder().revalidate_on_focus(true).build(),
//!         signals.clone(),
//!         &scope,
//!     );
//!
//!     use futures::StreamExt;
//!     let mut states = Box::pin(user.states());
//!     while let Some(state) = states.next().await {
//!         println!("{:?}", state.data());
//!     }
//! }
//! ```

mod config;
mod entry;
mod error;
mod infinite;
mod mutate;
mod persister;
mod revalidator;
mod scope;
mod selector;
mod signals;
mod state;
mod store;
mod subscription;
mod trigger;

// Re-export public API
pub use config::{
    default_error_retry, ConfigBuilder, ErrorCallback, LoadingSlowCallback, PauseGate,
    RetryOptions, RetryStrategy, RevalidateFn, SuccessCallback, SwrConfig,
};
pub use entry::{CacheEntry, EntrySnapshot, EntryState};
pub use error::{FetchError, SwrError};
pub use infinite::{key_fn, InfiniteMutateOptions, InfiniteRevalidator, KeyFn};
pub use mutate::MutateOptions;
pub use persister::{MemoryPersister, Persister};
pub use revalidator::Revalidator;
pub use scope::Scope;
pub use selector::{fetcher, DataSelector, Fetcher, GetFrom};
pub use signals::{HostLifecycle, Signals};
pub use state::StoreState;
pub use store::{CacheKey, CacheStore, CacheValue};
pub use subscription::{bind_stream, StreamSubscription};
pub use trigger::{
    mutation_fetcher, MutationFetcher, MutationTrigger, TriggerOptions, TriggerState,
};
