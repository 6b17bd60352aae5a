//! Response cache with lazy per-entry expiry and ETag revalidation.
//!
//! # Design
//! Entries expire lazily: a read that finds an entry at or past its TTL evicts
//! it and reports a miss. There is no background sweep.
//!
//! A GET takes a `FillTicket` for its key before going to the network and
//! fills the cache through it. The store tracks keys with an outstanding
//! ticket; an invalidation whose scope covers such a key marks it, and the
//! marked fill is dropped. A read that raced a mutation therefore cannot
//! re-insert the pre-mutation value, while fills for unrelated keys go
//! through. The record for a key is released when its last ticket drops.
//!
//! The lock is never held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

/// A stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub stored_at: Instant,
    pub ttl: Duration,
    pub etag: Option<String>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

/// Per-entry diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStats {
    pub age_ms: u64,
    pub ttl_ms: u64,
    pub has_etag: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub entries: BTreeMap<String, EntryStats>,
}

/// Which keys an invalidation covers.
enum Scope<'a> {
    Key(&'a str),
    /// The url itself and its `url?...` query variants.
    Url(&'a str),
    Pattern(&'a Regex),
    All,
}

impl Scope<'_> {
    fn covers(&self, key: &str) -> bool {
        match self {
            Scope::Key(k) => key == *k,
            Scope::Url(url) => is_url_variant(key, url),
            Scope::Pattern(pattern) => pattern.is_match(key),
            Scope::All => true,
        }
    }
}

/// Outstanding fills for one key.
#[derive(Debug, Default)]
struct PendingFill {
    tickets: usize,
    /// Generation of the latest invalidation that covered this key.
    invalidated_at: u64,
}

#[derive(Debug)]
struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    fills: HashMap<String, PendingFill>,
    generation: u64,
}

#[derive(Debug)]
pub struct CacheStore<V> {
    state: Mutex<State<V>>,
}

impl<V> Default for CacheStore<V> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                fills: HashMap::new(),
                generation: 0,
            }),
        }
    }
}

/// Permission to fill one key, revoked by any invalidation covering that key
/// after the ticket was taken.
#[must_use]
pub struct FillTicket<'a, V> {
    store: &'a CacheStore<V>,
    key: String,
    generation: u64,
}

impl<V> FillTicket<'_, V> {
    /// Store `value` unless the key was invalidated since the ticket was
    /// taken. Returns whether the value was stored.
    pub fn fill(self, value: V, ttl: Duration, etag: Option<String>) -> bool {
        let mut state = self.store.state.lock();
        let revoked = state
            .fills
            .get(&self.key)
            .is_some_and(|f| f.invalidated_at > self.generation);
        if revoked {
            debug!(key = %self.key, "skipping cache fill invalidated while in flight");
            return false;
        }
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl,
            etag,
        };
        state.entries.insert(self.key.clone(), entry);
        true
    }
}

impl<V> Drop for FillTicket<'_, V> {
    fn drop(&mut self) {
        let mut state = self.store.state.lock();
        if let Some(fill) = state.fills.get_mut(&self.key) {
            fill.tickets -= 1;
            if fill.tickets == 0 {
                state.fills.remove(&self.key);
            }
        }
    }
}

impl<V: Clone> CacheStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh value for `key`, evicting it if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        let entry = state.entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            trace!(key, "cache entry expired");
            state.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: &str, value: V, ttl: Duration, etag: Option<String>) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl,
            etag,
        };
        self.state.lock().entries.insert(key.to_string(), entry);
    }

    /// Take a ticket before fetching `key` from the network.
    pub fn ticket(&self, key: &str) -> FillTicket<'_, V> {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.fills.entry(key.to_string()).or_default().tickets += 1;
        FillTicket {
            store: self,
            key: key.to_string(),
            generation,
        }
    }

    /// ETag of the stored entry, if any. Does not evict.
    pub fn get_etag(&self, key: &str) -> Option<String> {
        self.state.lock().entries.get(key).and_then(|e| e.etag.clone())
    }

    /// Handle a "not modified" answer: the stored value is fresh again.
    pub fn revalidate(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key)?;
        entry.stored_at = Instant::now();
        Some(entry.value.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.invalidate(Scope::Key(key)) > 0
    }

    /// Remove `url` and every query variant of it (`url?...`).
    pub fn remove_url(&self, url: &str) -> usize {
        self.invalidate(Scope::Url(url))
    }

    pub fn remove_pattern(&self, pattern: &Regex) -> usize {
        self.invalidate(Scope::Pattern(pattern))
    }

    pub fn clear(&self) {
        self.invalidate(Scope::All);
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.state.lock();
        let stats = state
            .entries
            .iter()
            .map(|(key, e)| {
                let stats = EntryStats {
                    age_ms: duration_ms(now.saturating_duration_since(e.stored_at)),
                    ttl_ms: duration_ms(e.ttl),
                    has_etag: e.etag.is_some(),
                };
                (key.clone(), stats)
            })
            .collect();
        CacheStats {
            size: state.entries.len(),
            entries: stats,
        }
    }

    fn invalidate(&self, scope: Scope<'_>) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        for (key, fill) in state.fills.iter_mut() {
            if scope.covers(key) {
                fill.invalidated_at = generation;
            }
        }
        let before = state.entries.len();
        state.entries.retain(|key, _| !scope.covers(key));
        before - state.entries.len()
    }
}

/// `key` is `url` itself or `url?...`.
pub(crate) fn is_url_variant(key: &str, url: &str) -> bool {
    key.strip_prefix(url)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('?'))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn entry_is_served_until_ttl_then_evicted() {
        let cache = CacheStore::new();
        cache.set("/issues/1", 1, TTL, None);

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert_eq!(cache.get("/issues/1"), Some(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("/issues/1"), None);
        assert_eq!(cache.len(), 0, "expired entry is evicted by the read");
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_and_restarts_ttl() {
        let cache = CacheStore::new();
        cache.set("k", "old", TTL, Some("\"a\"".into()));
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("k", "new", TTL, None);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k"), Some("new"));
        assert_eq!(cache.get_etag("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn revalidate_refreshes_stored_at() {
        let cache = CacheStore::new();
        cache.set("k", 7, TTL, Some("\"abc\"".into()));
        tokio::time::advance(Duration::from_secs(9)).await;

        assert_eq!(cache.revalidate("k"), Some(7));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("k"), Some(7));
        assert_eq!(cache.get_etag("k").as_deref(), Some("\"abc\""));
        assert_eq!(cache.revalidate("missing"), None);
    }

    #[test]
    fn remove_url_covers_query_variants_only() {
        let cache = CacheStore::new();
        cache.set("/issues/4", 0, TTL, None);
        cache.set("/issues/42", 1, TTL, None);
        cache.set("/issues/42?page=2", 2, TTL, None);
        cache.set("/issues/42/comments", 3, TTL, None);

        assert_eq!(cache.remove_url("/issues/42"), 2);
        assert_eq!(cache.get("/issues/4"), Some(0));
        assert_eq!(cache.get("/issues/42/comments"), Some(3));
        assert_eq!(cache.get("/issues/42"), None);
    }

    #[test]
    fn remove_pattern_matches_keys() {
        let cache = CacheStore::new();
        cache.set("/issues/1", 1, TTL, None);
        cache.set("/issues/2", 2, TTL, None);
        cache.set("/projects/1", 3, TTL, None);

        let removed = cache.remove_pattern(&Regex::new("^/issues/").unwrap());
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.remove("/projects/1"));
        assert!(!cache.remove("/projects/1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn fill_is_dropped_after_invalidation() {
        let cache = CacheStore::new();
        let ticket = cache.ticket("/issues/1");
        cache.remove("/issues/1");
        assert!(!ticket.fill(1, TTL, None));
        assert_eq!(cache.get("/issues/1"), None);

        let ticket = cache.ticket("/issues/1");
        assert!(ticket.fill(2, TTL, None));
        assert_eq!(cache.get("/issues/1"), Some(2));
    }

    #[test]
    fn unrelated_invalidation_keeps_fill() {
        let cache = CacheStore::new();
        let issues = cache.ticket("/issues/1");
        let listing = cache.ticket("/issues?page=2");
        cache.remove_url("/projects/1");
        cache.remove_pattern(&Regex::new("^/projects/").unwrap());
        cache.remove_url("/issues");

        assert!(issues.fill(1, TTL, None));
        assert!(!listing.fill(2, TTL, None), "query variant of an invalidated url");
        assert_eq!(cache.get("/issues/1"), Some(1));
    }

    #[test]
    fn newer_ticket_for_same_key_survives_older_invalidation() {
        let cache = CacheStore::new();
        let old = cache.ticket("/k");
        cache.remove("/k");
        let new = cache.ticket("/k");

        assert!(!old.fill(1, TTL, None));
        assert!(new.fill(2, TTL, None));
        assert_eq!(cache.get("/k"), Some(2));
    }

    #[test]
    fn dropped_tickets_release_their_records() {
        let cache: CacheStore<u32> = CacheStore::new();
        let a = cache.ticket("/k");
        let b = cache.ticket("/k");
        drop(a);
        assert_eq!(cache.state.lock().fills["/k"].tickets, 1);
        drop(b);
        assert!(cache.state.lock().fills.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_report_age_ttl_and_etag() {
        let cache = CacheStore::new();
        cache.set("/a", 1, TTL, Some("\"x\"".into()));
        cache.set("/b", 2, Duration::from_secs(60), None);
        tokio::time::advance(Duration::from_millis(1500)).await;

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(
            stats.entries["/a"],
            EntryStats {
                age_ms: 1500,
                ttl_ms: 10_000,
                has_etag: true
            }
        );
        assert!(!stats.entries["/b"].has_etag);

        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }
}
