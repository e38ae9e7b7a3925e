//! Local query cache with typed keys, staleness, and explicit invalidation.
//!
//! The cache memoizes query results for rendering. Every logical query has
//! one typed key; key construction lives here so no caller invents ad hoc
//! strings. Invalidation marks an entry stale; keys with active observers
//! get an immediate refetch callback, everything else refetches lazily on
//! the next access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use revsync_proto::{ContentItemId, EntityKind, UserId};
use tracing::debug;

/// Typed cache key for a logical query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A user's notification list, recent first.
    NotificationList(UserId),
    /// A user's unread notification count.
    UnreadCount(UserId),
    /// The comment thread on a content item.
    CommentThread(ContentItemId),
    /// The version history of a content item.
    VersionHistory(ContentItemId),
    /// The pending-review queue for one review scope (keyed by the content
    /// owner). Invalidated by the workflow engine whenever a version enters
    /// or leaves the Submitted state.
    ReviewQueue(String),
}

impl CacheKey {
    /// The entity class whose TTL governs this key.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            CacheKey::NotificationList(_) | CacheKey::UnreadCount(_) => EntityKind::Notification,
            CacheKey::CommentThread(_) => EntityKind::Comment,
            CacheKey::VersionHistory(_) | CacheKey::ReviewQueue(_) => EntityKind::ContentVersion,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::NotificationList(u) => write!(f, "notifications:{u}"),
            CacheKey::UnreadCount(u) => write!(f, "unread-count:{u}"),
            CacheKey::CommentThread(i) => write!(f, "comments:{i}"),
            CacheKey::VersionHistory(i) => write!(f, "versions:{i}"),
            CacheKey::ReviewQueue(s) => write!(f, "review-queue:{s}"),
        }
    }
}

/// One cached query result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The memoized value.
    pub value: serde_json::Value,
    /// When the value was fetched.
    pub fetched_at: Instant,
    /// Explicitly invalidated since the fetch.
    pub stale: bool,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Fresh value.
    Hit(serde_json::Value),
    /// Value present but invalidated or past its TTL; refetch before trust.
    Stale(serde_json::Value),
    /// Nothing cached for this key.
    Miss,
}

/// Refetch callback invoked when an observed key is invalidated.
///
/// Runs on the invalidating task and must not block; spawn for real I/O.
pub type RefetchFn = Arc<dyn Fn(&CacheKey) + Send + Sync>;

/// Handle for removing an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStats {
    /// Get hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count (includes stale lookups).
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get invalidation count.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

/// Key-to-result store for previously fetched queries.
///
/// Mutations are linearizable per key: `DashMap` locks the entry for the
/// duration of a set or invalidation, so a read never observes a
/// half-applied update.
pub struct QueryCache {
    entries: DashMap<CacheKey, CacheEntry>,
    observers: DashMap<CacheKey, Vec<(ObserverId, RefetchFn)>>,
    ttls: HashMap<EntityKind, Duration>,
    next_observer_id: AtomicU64,
    stats: CacheStats,
}

impl QueryCache {
    /// Create a cache with per-entity TTLs.
    pub fn new(ttls: HashMap<EntityKind, Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            observers: DashMap::new(),
            ttls,
            next_observer_id: AtomicU64::new(1),
            stats: CacheStats::default(),
        }
    }

    fn ttl_for(&self, key: &CacheKey) -> Duration {
        self.ttls
            .get(&key.entity_kind())
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }

    /// Look up a key.
    pub fn get(&self, key: &CacheKey) -> Lookup {
        match self.entries.get(key) {
            Some(entry) => {
                let expired = entry.fetched_at.elapsed() > self.ttl_for(key);
                if entry.stale || expired {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    Lookup::Stale(entry.value.clone())
                } else {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Lookup::Hit(entry.value.clone())
                }
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss
            }
        }
    }

    /// Store a freshly fetched value.
    pub fn set(&self, key: CacheKey, value: serde_json::Value) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                fetched_at: Instant::now(),
                stale: false,
            },
        );
    }

    /// Mark a key stale.
    ///
    /// Observed keys get their refetch callbacks invoked immediately;
    /// unobserved keys refetch lazily on the next `get`.
    pub fn invalidate(&self, key: &CacheKey) {
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.stale = true;
        }
        debug!(key = %key, "cache entry invalidated");

        let callbacks: Vec<RefetchFn> = match self.observers.get(key) {
            Some(list) => list.iter().map(|(_, f)| f.clone()).collect(),
            None => return,
        };
        for refetch in callbacks {
            refetch(key);
        }
    }

    /// Register an active observer for a key.
    ///
    /// The callback runs once per invalidation of the key, scheduling the
    /// immediate refetch the observer needs.
    pub fn observe(&self, key: CacheKey, refetch: RefetchFn) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::SeqCst));
        self.observers.entry(key).or_default().push((id, refetch));
        id
    }

    /// Remove an observer.
    pub fn unobserve(&self, key: &CacheKey, observer: ObserverId) {
        let emptied = match self.observers.get_mut(key) {
            Some(mut list) => {
                list.retain(|(id, _)| *id != observer);
                list.is_empty()
            }
            None => false,
        };
        // Drop the emptied slot so a long-lived cache does not accumulate a
        // dead entry for every key ever observed.
        if emptied {
            self.observers.remove_if(key, |_, list| list.is_empty());
        }
    }

    /// Whether a key currently has active observers.
    pub fn is_observed(&self, key: &CacheKey) -> bool {
        self.observers
            .get(key)
            .map(|list| !list.is_empty())
            .unwrap_or(false)
    }

    /// Number of keys with at least one registered observer slot.
    pub fn observed_key_count(&self) -> usize {
        self.observers.len()
    }

    /// Cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn cache_with_ttl(ttl: Duration) -> QueryCache {
        QueryCache::new(HashMap::from([
            (EntityKind::Comment, ttl),
            (EntityKind::Notification, ttl),
            (EntityKind::ContentVersion, ttl),
        ]))
    }

    #[test]
    fn test_get_set_roundtrip() {
        let cache = cache_with_ttl(Duration::from_secs(60));
        let key = CacheKey::UnreadCount(UserId::new("u1"));

        assert_eq!(cache.get(&key), Lookup::Miss);
        cache.set(key.clone(), json!(3));
        assert_eq!(cache.get(&key), Lookup::Hit(json!(3)));
    }

    #[test]
    fn test_invalidate_marks_stale() {
        let cache = cache_with_ttl(Duration::from_secs(60));
        let key = CacheKey::CommentThread(ContentItemId(1));

        cache.set(key.clone(), json!(["a comment"]));
        cache.invalidate(&key);
        assert_eq!(cache.get(&key), Lookup::Stale(json!(["a comment"])));

        // A fresh set clears staleness.
        cache.set(key.clone(), json!(["a comment", "another"]));
        assert!(matches!(cache.get(&key), Lookup::Hit(_)));
    }

    #[test]
    fn test_ttl_expiry_counts_as_stale() {
        let cache = cache_with_ttl(Duration::from_millis(0));
        let key = CacheKey::VersionHistory(ContentItemId(2));

        cache.set(key.clone(), json!([]));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(cache.get(&key), Lookup::Stale(_)));
    }

    #[test]
    fn test_observer_runs_on_invalidation() {
        let cache = cache_with_ttl(Duration::from_secs(60));
        let key = CacheKey::NotificationList(UserId::new("u1"));
        let seen: Arc<Mutex<Vec<CacheKey>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let id = cache.observe(
            key.clone(),
            Arc::new(move |k| seen_clone.lock().push(k.clone())),
        );

        cache.set(key.clone(), json!([]));
        cache.invalidate(&key);
        assert_eq!(seen.lock().as_slice(), &[key.clone()]);

        cache.unobserve(&key, id);
        cache.invalidate(&key);
        assert_eq!(seen.lock().len(), 1);
        assert!(!cache.is_observed(&key));
    }

    #[test]
    fn test_unobserve_releases_the_key_slot() {
        let cache = cache_with_ttl(Duration::from_secs(60));
        let key_a = CacheKey::UnreadCount(UserId::new("u1"));
        let key_b = CacheKey::UnreadCount(UserId::new("u2"));

        let a = cache.observe(key_a.clone(), Arc::new(|_| {}));
        let b1 = cache.observe(key_b.clone(), Arc::new(|_| {}));
        let b2 = cache.observe(key_b.clone(), Arc::new(|_| {}));
        assert_eq!(cache.observed_key_count(), 2);

        // A key keeps its slot while any observer remains.
        cache.unobserve(&key_b, b1);
        assert_eq!(cache.observed_key_count(), 2);
        cache.unobserve(&key_b, b2);
        assert_eq!(cache.observed_key_count(), 1);

        cache.unobserve(&key_a, a);
        assert_eq!(cache.observed_key_count(), 0);
    }

    #[test]
    fn test_invalidating_absent_key_is_harmless() {
        let cache = cache_with_ttl(Duration::from_secs(60));
        let key = CacheKey::ReviewQueue("org-1".into());
        cache.invalidate(&key);
        assert_eq!(cache.get(&key), Lookup::Miss);
    }

    #[test]
    fn test_stats_track_lookups() {
        let cache = cache_with_ttl(Duration::from_secs(60));
        let key = CacheKey::UnreadCount(UserId::new("u2"));

        cache.get(&key); // miss
        cache.set(key.clone(), json!(0));
        cache.get(&key); // hit
        cache.invalidate(&key);

        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().invalidations(), 1);
    }
}
