//! # Read Cache
//!
//! Byte-budgeted value cache consulted on the read path. Two eviction
//! policies are available: plain LRU and two-choice (sample two random
//! entries, evict the colder), selected by configuration.
//!
//! Cache keys are plain strings: the database caches under the user key,
//! SST readers under `sstable:<table-id>:<key>` (immutable tables make
//! those entries safe forever).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use lru::LruCache as LruInner;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::debug;

use echodb_core::config::{CacheConfig, CachePolicy};
use echodb_core::metrics::Metrics;

/// Eviction-policy seam.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Bytes>;
    fn put(&self, key: String, value: Bytes);
    fn evict(&self, key: &str);
    fn clear(&self);
    fn size_bytes(&self) -> u64;
    fn entry_count(&self) -> usize;
}

/// LRU eviction over a byte budget.
pub struct LruCache {
    inner: Mutex<LruInner<String, Bytes>>,
    size_bytes: AtomicU64,
    max_bytes: u64,
}

impl LruCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(LruInner::unbounded()),
            size_bytes: AtomicU64::new(0),
            max_bytes,
        }
    }
}

impl Cache for LruCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().get(key).cloned()
    }

    fn put(&self, key: String, value: Bytes) {
        let mut inner = self.inner.lock();

        let value_len = value.len() as u64;
        if let Some(old) = inner.put(key, value) {
            self.size_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
        self.size_bytes.fetch_add(value_len, Ordering::Relaxed);

        while self.size_bytes.load(Ordering::Relaxed) > self.max_bytes {
            match inner.pop_lru() {
                Some((_, evicted)) => {
                    self.size_bytes
                        .fetch_sub(evicted.len() as u64, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    fn evict(&self, key: &str) {
        if let Some(old) = self.inner.lock().pop(key) {
            self.size_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
    }

    fn clear(&self) {
        self.inner.lock().clear();
        self.size_bytes.store(0, Ordering::Relaxed);
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    fn entry_count(&self) -> usize {
        self.inner.lock().len()
    }
}

struct TwoChoiceEntry {
    value: Bytes,
    access_count: AtomicU64,
}

/// Two-choice eviction: sample two random entries, drop the one with the
/// lower access count. Approximates LFU without bookkeeping.
pub struct TwoChoiceCache {
    entries: RwLock<HashMap<String, TwoChoiceEntry>>,
    size_bytes: AtomicU64,
    max_bytes: u64,
}

impl TwoChoiceCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            size_bytes: AtomicU64::new(0),
            max_bytes,
        }
    }

    fn remove_locked(&self, entries: &mut HashMap<String, TwoChoiceEntry>, key: &str) {
        if let Some(old) = entries.remove(key) {
            self.size_bytes
                .fetch_sub(old.value.len() as u64, Ordering::Relaxed);
        }
    }

    fn evict_two_choice(&self, entries: &mut HashMap<String, TwoChoiceEntry>) {
        let keys: Vec<String> = entries.keys().cloned().collect();
        match keys.len() {
            0 => {}
            1 => self.remove_locked(entries, &keys[0]),
            _ => {
                let mut rng = rand::thread_rng();
                let first = &keys[rng.gen_range(0..keys.len())];
                let second = &keys[rng.gen_range(0..keys.len())];

                let count = |key: &String| {
                    entries
                        .get(key)
                        .map(|e| e.access_count.load(Ordering::Relaxed))
                        .unwrap_or(0)
                };
                let victim = if count(first) > count(second) {
                    second.clone()
                } else {
                    first.clone()
                };
                self.remove_locked(entries, &victim);
            }
        }
    }
}

impl Cache for TwoChoiceCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        let entries = self.entries.read();
        entries.get(key).map(|entry| {
            entry.access_count.fetch_add(1, Ordering::Relaxed);
            entry.value.clone()
        })
    }

    fn put(&self, key: String, value: Bytes) {
        let mut entries = self.entries.write();

        let value_len = value.len() as u64;
        if let Some(old) = entries.insert(
            key,
            TwoChoiceEntry {
                value,
                access_count: AtomicU64::new(1),
            },
        ) {
            self.size_bytes
                .fetch_sub(old.value.len() as u64, Ordering::Relaxed);
        }
        self.size_bytes.fetch_add(value_len, Ordering::Relaxed);

        while self.size_bytes.load(Ordering::Relaxed) > self.max_bytes && !entries.is_empty() {
            self.evict_two_choice(&mut entries);
        }
    }

    fn evict(&self, key: &str) {
        let mut entries = self.entries.write();
        self.remove_locked(&mut entries, key);
    }

    fn clear(&self) {
        self.entries.write().clear();
        self.size_bytes.store(0, Ordering::Relaxed);
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    fn entry_count(&self) -> usize {
        self.entries.read().len()
    }
}

/// Policy-selecting facade with hit/miss accounting.
pub struct CacheManager {
    cache: Box<dyn Cache>,
    metrics: Metrics,
}

impl CacheManager {
    pub fn new(config: &CacheConfig, metrics: Metrics) -> Self {
        let cache: Box<dyn Cache> = match config.policy {
            CachePolicy::Lru => Box::new(LruCache::new(config.max_bytes)),
            CachePolicy::TwoChoice => Box::new(TwoChoiceCache::new(config.max_bytes)),
        };
        debug!(policy = ?config.policy, max_bytes = config.max_bytes, "cache initialized");
        Self { cache, metrics }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        match self.cache.get(key) {
            Some(value) => {
                self.metrics.record_cache_hit();
                Some(value)
            }
            None => {
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, value: Bytes) {
        self.cache.put(key.into(), value);
    }

    pub fn evict(&self, key: &str) {
        self.cache.evict(key);
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn size_bytes(&self) -> u64 {
        self.cache.size_bytes()
    }

    pub fn entry_count(&self) -> usize {
        self.cache.entry_count()
    }
}
