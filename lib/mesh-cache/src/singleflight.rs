//! Call deduplication: at most one in-flight call per key
//!
//! The first caller for a key spawns the call; every caller arriving while
//! it runs awaits the same shared result. The call runs on its own task, so
//! it completes (and its result is published) even if the caller that
//! started it is dropped.

use futures::future::{BoxFuture, FutureExt, Shared};
use mesh_core::{CoreError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Group of deduplicated calls keyed by `K`
pub struct Group<K, T>
where
    T: Clone,
{
    calls: Arc<Mutex<HashMap<K, SharedCall<T>>>>,
}

impl<K, T> Group<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key` unless a call for it is already in flight.
    ///
    /// Returns the call's result and whether it was shared with an earlier
    /// caller. `work` is only invoked when this caller starts the call.
    pub async fn work<F, Fut>(&self, key: K, work: F) -> (Result<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (call, shared) = {
            let mut calls = self.calls.lock().await;
            match calls.get(&key) {
                Some(call) => (call.clone(), true),
                None => {
                    let call = self.spawn(key.clone(), work());
                    calls.insert(key, call.clone());
                    (call, false)
                }
            }
        };

        (call.await, shared)
    }

    /// Number of calls currently in flight
    pub async fn in_flight(&self) -> usize {
        self.calls.lock().await.len()
    }

    fn spawn<Fut>(&self, key: K, fut: Fut) -> SharedCall<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let calls = self.calls.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            // Forget the key before publishing so later callers start a fresh call
            calls.lock().await.remove(&key);
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(CoreError::Internal(format!("in-flight call failed: {}", e))))
        }
        .boxed()
        .shared()
    }
}

impl<K, T> Default for Group<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
