use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owner of a family of background tasks.
///
/// Every background task of the engine (mount checks, focus and reconnect
/// listeners, polling loops, retry delays, page combiners) is spawned
/// through a scope. Cancelling a scope cancels all tasks spawned through it
/// and, transitively, through any [`child`](Scope::child) scope.
///
/// Cancellation stops tasks at their next await point; it never rolls back
/// cache values that were already written.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    token: CancellationToken,
}

impl Scope {
    pub fn new() -> Self {
        Scope {
            token: CancellationToken::new(),
        }
    }

    /// A scope cancelled together with this one, but also cancellable on
    /// its own.
    pub fn child(&self) -> Self {
        Scope {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `task` until it finishes or this scope is cancelled.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        })
    }
}
