//! Internally synchronized, bounded LRU cache backing each registry index.

use std::hash::Hash;
use std::num::NonZeroUsize;

use log::trace;
use lru::LruCache;
use parking_lot::Mutex;

/// A bounded cache with least-recently-used eviction.
///
/// Reads promote the entry, so they take the lock exclusively as well. The lock is
/// never held across an await point.
pub struct BoundedCache<K: Hash + Eq, V> {
    name: &'static str,
    inner: Mutex<LruCache<K, V>>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + std::fmt::Debug,
    V: Clone,
{
    /// Creates a cache holding at most `capacity` entries (at least one).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        BoundedCache {
            name,
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Inserts or overwrites `key`, evicting the least-recently-used entry when full.
    pub fn put(&self, key: K, value: V) {
        let mut cache = self.inner.lock();
        let overwrite = cache.contains(&key);
        if let Some((evicted, _)) = cache.push(key, value) {
            if !overwrite {
                trace!("{} cache evicted {:?}", self.name, evicted);
            }
        }
    }

    /// Returns a clone of the value and marks the entry as recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    #[cfg(test)]
    fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = BoundedCache::new("test", 3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        // Touch "a" so "b" becomes the oldest entry.
        assert_eq!(cache.get(&"a"), Some(1));

        cache.put("d", 4);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.get(&"d"), Some(4));
    }

    #[test]
    fn test_overwrite_keeps_size() {
        let cache = BoundedCache::new("test", 2);
        cache.put("a", 1);
        cache.put("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn test_capacity_plus_one_evicts_first_key() {
        let cache = BoundedCache::new("test", 1000);
        for i in 0..=1000 {
            cache.put(i, i * 2);
        }
        assert_eq!(cache.len(), 1000);
        assert_eq!(cache.capacity(), 1000);
        assert!(!cache.contains(&0));
        assert_eq!(cache.get(&1000), Some(2000));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = BoundedCache::new("test", 0);
        cache.put("a", 1);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    fn test_concurrent_reads_during_writes() {
        let cache = Arc::new(BoundedCache::new("test", 64));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        cache.put(t * 10_000 + i, i);
                        let _ = cache.get(&(t * 10_000 + i / 2));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(cache.len(), 64);
    }
}
