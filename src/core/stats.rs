use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;
use crate::core::config::Config;
use crate::core::error::Result;
use crate::storage::KvStore;
use crate::storage::key::Key;

/// Per-collection statistics handle used by the cost estimator.
///
/// Entry counts and per-value index counts are read from the store and
/// cached for `ttl`; the value-count cache is bounded by an LRU.
pub struct CollectionStats {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    total: Mutex<Option<(usize, Instant)>>,
    value_counts: Mutex<LruCache<(String, Key), (usize, Instant)>>,
    fanouts: Mutex<HashMap<String, (f64, Instant)>>,
    pub hit_count: AtomicUsize,
    pub miss_count: AtomicUsize,
}

impl CollectionStats {
    pub fn new(store: Arc<dyn KvStore>, config: &Config) -> Self {
        let capacity = NonZeroUsize::new(config.stats_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        CollectionStats {
            store,
            ttl: Duration::from_millis(config.stats_ttl_ms),
            total: Mutex::new(None),
            value_counts: Mutex::new(LruCache::new(capacity)),
            fanouts: Mutex::new(HashMap::new()),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    fn fresh(&self, at: Instant) -> bool {
        at.elapsed() < self.ttl
    }

    /// Approximate number of live records.
    pub fn total(&self) -> Result<usize> {
        let mut total = self.total.lock();
        if let Some((count, at)) = *total {
            if self.fresh(at) {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                return Ok(count);
            }
        }
        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let count = self.store.entry_count()?;
        debug!(count, "collection entry count refreshed");
        *total = Some((count, Instant::now()));
        Ok(count)
    }

    /// Approximate number of records whose `attribute` index holds `key`.
    pub fn value_count(&self, attribute: &str, key: &Key) -> Result<usize> {
        let cache_key = (attribute.to_string(), key.clone());
        {
            let mut cache = self.value_counts.lock();
            if let Some(&(count, at)) = cache.get(&cache_key) {
                if self.fresh(at) {
                    self.hit_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(count);
                }
            }
        }
        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let count = self.store.index_value_count(attribute, key)?;
        self.value_counts.lock().put(cache_key, (count, Instant::now()));
        Ok(count)
    }

    /// Average number of index entries per distinct key of `attribute`'s
    /// index; 1.0 for an empty index.
    pub fn index_fanout(&self, attribute: &str) -> Result<f64> {
        if let Some(&(fanout, at)) = self.fanouts.lock().get(attribute) {
            if self.fresh(at) {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                return Ok(fanout);
            }
        }
        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let (entries, distinct) = self.store.index_summary(attribute)?;
        let fanout = if distinct == 0 { 1.0 } else { entries as f64 / distinct as f64 };
        debug!(attribute, entries, distinct, fanout, "index fan-out refreshed");
        self.fanouts.lock().insert(attribute.to_string(), (fanout, Instant::now()));
        Ok(fanout)
    }

    /// Drop everything cached, e.g. after a commit or index build.
    pub fn invalidate(&self) {
        *self.total.lock() = None;
        self.value_counts.lock().clear();
        self.fanouts.lock().clear();
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let total = hits + self.miss_count.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
