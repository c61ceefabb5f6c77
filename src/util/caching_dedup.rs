//! Single-flight execution with memoized results.
//!
//! [`CachingDedup`] layers an LRU of prior successes over [`Dedup`]: a
//! hit returns immediately, a miss executes at most once regardless of
//! how many callers pile up, and the winning result is stored subject to
//! LRU eviction. Failures are never cached.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use super::dedup::Dedup;

/// Configuration for a [`CachingDedup`].
#[derive(Debug, Clone)]
pub struct CachingDedupConfig {
    /// Maximum number of memoized results.
    pub capacity: usize,
}

impl Default for CachingDedupConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// An LRU of successful results in front of single-flight execution.
pub struct CachingDedup<K: Hash + Eq, V, E> {
    cache: Mutex<LruCache<K, V>>,
    dedup: Dedup<K, V, E>,
}

impl<K, V, E> CachingDedup<K, V, E>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
    E: Clone + Send,
{
    pub fn new(config: CachingDedupConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            dedup: Dedup::new(),
        }
    }

    /// Return the memoized result for `id`, or run `op` under
    /// single-flight and memoize its success.
    pub async fn run<F, Fut>(&self, id: K, op: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.cache.lock().unwrap().get(&id).cloned() {
            return Ok(hit);
        }

        let result = self.dedup.run(id.clone(), op).await;
        if let Ok(ref value) = result {
            self.cache.lock().unwrap().put(id, value.clone());
        }
        result
    }

    /// Drop the memoized result for `id`, if any.
    pub fn invalidate(&self, id: &K) {
        self.cache.lock().unwrap().pop(id);
    }

    /// Drop every memoized result whose id satisfies `pred`.
    pub fn invalidate_where<F>(&self, pred: F)
    where
        F: Fn(&K) -> bool,
    {
        let mut cache = self.cache.lock().unwrap();
        let doomed: Vec<K> = cache
            .iter()
            .filter(|(id, _)| pred(id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in doomed {
            cache.pop(&id);
        }
    }

    /// Drop every memoized result.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Number of memoized results.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
