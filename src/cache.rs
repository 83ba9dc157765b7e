//! In-memory LRU caches with TTL.
//!
//! Two instances sit between the fetch/HTTP layers and the parser: parsed
//! feed items keyed by feed id, and rewritten article HTML keyed by article
//! id. Both are bounded (capacity 100) with lazy 30-minute expiry: an entry
//! is only checked against its deadline when it is looked up, and eviction
//! beyond that is plain LRU. The only guarantee across a hit is "at most
//! TTL old".

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::storage::ParsedArticle;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CAPACITY: usize = 100;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

/// Bounded TTL cache, safe for concurrent readers and writers.
pub struct TtlCache<K: std::hash::Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K: std::hash::Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock();
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.inner.lock().put(key, entry);
    }

    pub fn invalidate(&self, key: &K) {
        self.inner.lock().pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The two caches the service actually runs.
pub struct ContentCaches {
    /// Parsed items per feed id — spares a refetch+reparse within the TTL
    pub parsed_feeds: TtlCache<i64, Vec<ParsedArticle>>,
    /// Rewritten article HTML per article id
    pub article_html: TtlCache<i64, String>,
}

impl ContentCaches {
    pub fn new() -> Self {
        Self {
            parsed_feeds: TtlCache::new(DEFAULT_CAPACITY, DEFAULT_TTL),
            article_html: TtlCache::new(DEFAULT_CAPACITY, DEFAULT_TTL),
        }
    }

    /// Drop everything related to one feed (on edit/unsubscribe).
    pub fn invalidate_feed(&self, feed_id: i64) {
        self.parsed_feeds.invalidate(&feed_id);
    }
}

impl Default for ContentCaches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let cache: TtlCache<i64, String> = TtlCache::new(10, Duration::from_secs(60));
        cache.put(1, "hello".into());
        assert_eq!(cache.get(&1), Some("hello".into()));
        assert_eq!(cache.get(&2), None);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache: TtlCache<i64, String> = TtlCache::new(10, Duration::from_millis(0));
        cache.put(1, "hello".into());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty(), "expired entries are dropped on lookup");
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache: TtlCache<i64, i64> = TtlCache::new(2, Duration::from_secs(60));
        cache.put(1, 10);
        cache.put(2, 20);
        cache.get(&1); // 1 becomes most recent
        cache.put(3, 30); // evicts 2
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn test_invalidate() {
        let cache: TtlCache<i64, i64> = TtlCache::new(4, Duration::from_secs(60));
        cache.put(1, 10);
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        let cache: Arc<TtlCache<i64, i64>> = Arc::new(TtlCache::new(64, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for t in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    cache.put(t * 100 + i, i);
                    cache.get(&(t * 100 + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
