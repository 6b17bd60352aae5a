//! In-flight request coalescing.
//!
//! # Design
//! The pending map holds a *weak* handle to each shared call. Callers hold
//! the strong handles, so the underlying future lives exactly as long as
//! somebody is still waiting for it: when every waiter has gone away the
//! call is dropped, and a later `join` for the same key starts a new one
//! instead of attaching to an abandoned call.
//!
//! The shared future removes its own map entry as its final step, so the
//! entry is gone by the time any waiter observes the result. Entries carry a
//! call id and removal only deletes the matching id, which keeps a settling
//! call from removing a newer call registered under the same key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use regex::Regex;
use tracing::trace;

use crate::cache::is_url_variant;
use crate::error::ApiError;

type CallFuture<V> = BoxFuture<'static, Result<V, ApiError>>;

/// Handle to a shared in-flight call. Every clone resolves to the same result.
pub type SharedCall<V> = Shared<CallFuture<V>>;

struct PendingCall<V> {
    id: u64,
    handle: WeakShared<CallFuture<V>>,
}

type PendingMap<V> = Arc<Mutex<HashMap<String, PendingCall<V>>>>;

pub struct Deduplicator<V> {
    pending: PendingMap<V>,
    next_id: AtomicU64,
}

impl<V> Default for Deduplicator<V> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<V> std::fmt::Debug for Deduplicator<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl<V> Deduplicator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the pending call for `key`, or start one with `factory`.
    pub fn join<F, Fut>(&self, key: &str, factory: F) -> SharedCall<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ApiError>> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if let Some(call) = pending.get(key) {
            if let Some(handle) = call.handle.upgrade() {
                trace!(key, "joining in-flight request");
                return handle;
            }
            pending.remove(key);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let map = Arc::clone(&self.pending);
        let owned_key = key.to_string();
        let call = factory();
        let shared = async move {
            let result = call.await;
            let mut pending = map.lock();
            if pending.get(&owned_key).is_some_and(|c| c.id == id) {
                pending.remove(&owned_key);
            }
            result
        }
        .boxed()
        .shared();

        if let Some(handle) = shared.downgrade() {
            pending.insert(key.to_string(), PendingCall { id, handle });
        }
        shared
    }

    /// Run `factory` unless an identical call is already in flight.
    pub async fn dedupe<F, Fut>(&self, key: &str, factory: F) -> Result<V, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ApiError>> + Send + 'static,
    {
        self.join(key, factory).await
    }

    pub fn is_pending(&self, key: &str) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(key) {
            Some(call) if call.handle.upgrade().is_some() => true,
            Some(_) => {
                pending.remove(key);
                false
            }
            None => false,
        }
    }

    /// Detach the pending calls for `url` and its query variants. Their
    /// waiters still get the result; later callers start a new request.
    pub fn forget_url(&self, url: &str) -> usize {
        self.forget(|key| is_url_variant(key, url))
    }

    pub fn forget_matching(&self, pattern: &Regex) -> usize {
        self.forget(|key| pattern.is_match(key))
    }

    fn forget(&self, covers: impl Fn(&str) -> bool) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|key, _| !covers(key.as_str()));
        before - pending.len()
    }

    /// Forget every pending call. Waiters already attached still get their
    /// results; new callers start fresh requests.
    pub fn clear_pending(&self) {
        self.pending.lock().clear();
    }

    /// Number of keys with a live in-flight call.
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|_, call| call.handle.upgrade().is_some());
        pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorCategory;

    fn counting_factory(
        calls: &Arc<AtomicUsize>,
        outcome: Result<u32, ApiError>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, ApiError>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                outcome
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_call() {
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = dedup.join("/issues", counting_factory(&calls, Ok(1)));
        let b = dedup.join("/issues", counting_factory(&calls, Ok(2)));
        let c = dedup.join("/issues", counting_factory(&calls, Ok(3)));
        assert!(dedup.is_pending("/issues"));

        let (a, b, c) = tokio::join!(a, b, c);
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!dedup.is_pending("/issues"));
        assert_eq!(dedup.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_shared_and_clears_entry() {
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let err = ApiError::new(ErrorCategory::Server, true, "down").with_status(503);

        let a = dedup.join("/k", counting_factory(&calls, Err(err.clone())));
        let b = dedup.join("/k", counting_factory(&calls, Ok(9)));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap_err(), err);
        assert_eq!(b.unwrap_err(), err);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!dedup.is_pending("/k"));

        let value = dedup.dedupe("/k", counting_factory(&calls, Ok(9))).await;
        assert_eq!(value.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_do_not_share() {
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let a = dedup.join("/a", counting_factory(&calls, Ok(1)));
        let b = dedup.join("/b", counting_factory(&calls, Ok(2)));
        assert_eq!(dedup.pending_count(), 2);
        let (a, b) = tokio::join!(a, b);
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_is_not_joined() {
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = dedup.join("/k", counting_factory(&calls, Ok(1)));
        drop(first);
        assert!(!dedup.is_pending("/k"));

        let second = dedup.join("/k", counting_factory(&calls, Ok(2)));
        assert_eq!(second.await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "dropped call never ran");
    }

    #[tokio::test(start_paused = true)]
    async fn clear_pending_detaches_new_callers() {
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let old = dedup.join("/k", counting_factory(&calls, Ok(1)));
        dedup.clear_pending();
        let new = dedup.join("/k", counting_factory(&calls, Ok(2)));

        let (old, new) = tokio::join!(old, new);
        assert_eq!((old.unwrap(), new.unwrap()), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.pending_count(), 0, "old call does not remove the new entry");
    }

    #[tokio::test(start_paused = true)]
    async fn forget_url_detaches_only_matching_keys() {
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let old = dedup.join("/issues/42", counting_factory(&calls, Ok(1)));
        let variant = dedup.join("/issues/42?page=2", counting_factory(&calls, Ok(2)));
        let other = dedup.join("/issues/420", counting_factory(&calls, Ok(3)));
        assert_eq!(dedup.forget_url("/issues/42"), 2);
        assert!(dedup.is_pending("/issues/420"));

        let new = dedup.join("/issues/42", counting_factory(&calls, Ok(4)));
        let (old, variant, other, new) = tokio::join!(old, variant, other, new);
        assert_eq!(old.unwrap(), 1, "detached waiter keeps its result");
        assert_eq!(variant.unwrap(), 2);
        assert_eq!(other.unwrap(), 3);
        assert_eq!(new.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(dedup.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_matching_uses_pattern() {
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let _a = dedup.join("/issues/1", counting_factory(&calls, Ok(1)));
        let _b = dedup.join("/projects/1", counting_factory(&calls, Ok(2)));

        let pattern = Regex::new(r"^/issues/\d+$").unwrap();
        assert_eq!(dedup.forget_matching(&pattern), 1);
        assert!(!dedup.is_pending("/issues/1"));
        assert!(dedup.is_pending("/projects/1"));
    }
}
