use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// A bounded LRU cache with optional per-entry expiry.
///
/// `ttl = None` means entries never expire and the capacity bound alone
/// evicts. Values are returned by clone, so cache `Arc`s for anything
/// non-trivial.
pub struct TtlCache<K, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Option<Duration>,
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: NonZeroUsize, ttl: Option<Duration>) -> TtlCache<K, V> {
        TtlCache {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self
            .inner
            .lock()
            .expect("thread holding cache lock should not panic");
        let expired = matches!(
            inner.get(key),
            Some(entry) if entry.expires_at.is_some_and(|at| at <= Instant::now())
        );
        if expired {
            inner.pop(key);
            return None;
        }
        inner.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
        };
        self.inner
            .lock()
            .expect("thread holding cache lock should not panic")
            .put(key, entry);
    }

    pub fn remove(&self, key: &K) {
        self.inner
            .lock()
            .expect("thread holding cache lock should not panic")
            .pop(key);
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("thread holding cache lock should not panic")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn returns_inserted_values_until_expiry() {
        let cache = TtlCache::new(capacity(4), Some(Duration::from_millis(40)));
        cache.insert("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn no_ttl_means_no_expiry() {
        let cache = TtlCache::new(capacity(4), None);
        cache.insert("k", 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(&"k"), Some(1));
    }

    #[test]
    fn capacity_bound_evicts_least_recently_used() {
        let cache = TtlCache::new(capacity(2), None);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn remove_and_clear() {
        let cache = TtlCache::new(capacity(4), None);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.remove(&"a");
        assert_eq!(cache.get(&"a"), None);
        cache.clear();
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn overwrite_refreshes_value() {
        let cache = TtlCache::new(capacity(4), Some(Duration::from_secs(60)));
        cache.insert("k", 1);
        cache.insert("k", 2);
        assert_eq!(cache.get(&"k"), Some(2));
    }
}
