//! In-memory caches in front of the filter store.
//!
//! [`LruCache`] keeps hot filter records by id, [`TtlCache`] keeps derived
//! query results (the sorted active-filter list) for a bounded time.
//! [`ResultCache`] composes both and is what the engine talks to.

use crate::config::CacheConfig;
use crate::models::Filter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key of the priority-sorted active filter list.
pub const ACTIVE_FILTERS_KEY: &str = "active_filters_sorted";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    fn new(size: usize, hits: u64, misses: u64) -> Self {
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        Self {
            size,
            hits,
            misses,
            hit_rate,
        }
    }
}

/// Operations every cache kind exposes.
pub trait Cache<V> {
    fn get(&mut self, key: &str) -> Option<V>;
    fn put(&mut self, key: &str, value: V);
    fn invalidate(&mut self, key: &str) -> bool;
    fn clear(&mut self);
    fn stats(&self) -> CacheStats;
}

pub struct LruCache<V> {
    inner: lru::LruCache<String, V>,
    hits: u64,
    misses: u64,
}

impl<V: Clone> LruCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: lru::LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }
}

impl<V: Clone> Cache<V> for LruCache<V> {
    fn get(&mut self, key: &str) -> Option<V> {
        match self.inner.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn put(&mut self, key: &str, value: V) {
        self.inner.put(key.to_string(), value);
    }

    fn invalidate(&mut self, key: &str) -> bool {
        self.inner.pop(key).is_some()
    }

    fn clear(&mut self) {
        self.inner.clear();
    }

    fn stats(&self) -> CacheStats {
        CacheStats::new(self.inner.len(), self.hits, self.misses)
    }
}

#[derive(Debug)]
pub struct CacheEntry<T> {
    pub value: T,
    pub timestamp: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.timestamp.elapsed() > self.ttl
    }
}

pub struct TtlCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
    hits: u64,
    misses: u64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
            hits: 0,
            misses: 0,
        }
    }

    pub fn put_with_ttl(&mut self, key: &str, value: V, ttl: Duration) {
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    pub fn cleanup(&mut self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }
}

impl<V: Clone> Cache<V> for TtlCache<V> {
    fn get(&mut self, key: &str) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                self.hits += 1;
                return Some(entry.value.clone());
            }
            self.entries.remove(key);
        }
        self.misses += 1;
        None
    }

    fn put(&mut self, key: &str, value: V) {
        let ttl = self.default_ttl;
        self.put_with_ttl(key, value, ttl);
    }

    fn invalidate(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn stats(&self) -> CacheStats {
        CacheStats::new(self.entries.len(), self.hits, self.misses)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultCacheStats {
    pub records: CacheStats,
    pub queries: CacheStats,
    pub invalidations: u64,
}

struct RecordState {
    cache: LruCache<Filter>,
    // Bumped whenever any record is dropped.
    generation: u64,
}

struct QueryState {
    cache: TtlCache<Vec<Filter>>,
    // Bumped on every invalidation of the active list.
    generation: u64,
}

/// Filter-aware cache facade shared by the engine.
pub struct ResultCache {
    enabled: bool,
    records: Mutex<RecordState>,
    queries: Mutex<QueryState>,
    invalidations: AtomicU64,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            records: Mutex::new(RecordState {
                cache: LruCache::new(config.lru_capacity),
                generation: 0,
            }),
            queries: Mutex::new(QueryState {
                cache: TtlCache::new(config.ttl()),
                generation: 0,
            }),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn get_record(&self, filter_id: &str) -> Option<Filter> {
        if !self.enabled {
            return None;
        }
        self.records.lock().ok()?.cache.get(filter_id)
    }

    /// Current generation of the record cache; pass it back to
    /// [`ResultCache::put_record`] after reading from the store.
    pub fn record_generation(&self) -> u64 {
        self.records.lock().map(|r| r.generation).unwrap_or(0)
    }

    /// Cache a record read from the store unless some record was dropped
    /// since `generation` was read. Returns whether the record was stored.
    pub fn put_record(&self, filter: &Filter, generation: u64) -> bool {
        if !self.enabled {
            return false;
        }
        if let Ok(mut records) = self.records.lock() {
            if records.generation == generation {
                records.cache.put(&filter.filter_id, filter.clone());
                return true;
            }
            log::debug!("Discarding filter {} read before an invalidation", filter.filter_id);
        }
        false
    }

    /// Current generation of the active list; pass it back to
    /// [`ResultCache::put_active_filters`] after loading from the store.
    pub fn active_generation(&self) -> u64 {
        self.queries.lock().map(|q| q.generation).unwrap_or(0)
    }

    pub fn get_active_filters(&self) -> Option<Vec<Filter>> {
        if !self.enabled {
            return None;
        }
        self.queries.lock().ok()?.cache.get(ACTIVE_FILTERS_KEY)
    }

    /// Cache a freshly loaded active list unless it was invalidated since
    /// `generation` was read. Returns whether the list was stored.
    pub fn put_active_filters(&self, filters: &[Filter], generation: u64) -> bool {
        if !self.enabled {
            return false;
        }
        if let Ok(mut queries) = self.queries.lock() {
            if queries.generation == generation {
                queries.cache.put(ACTIVE_FILTERS_KEY, filters.to_vec());
                return true;
            }
            log::debug!("Discarding active filter list loaded before an invalidation");
        }
        false
    }

    /// Drop the sorted active list after a rule-set mutation.
    pub fn invalidate_active_filters(&self) {
        if let Ok(mut queries) = self.queries.lock() {
            queries.generation += 1;
            queries.cache.invalidate(ACTIVE_FILTERS_KEY);
        }
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a set of hot records in a single invalidation.
    pub fn invalidate_records(&self, filter_ids: &[String]) {
        if let Ok(mut records) = self.records.lock() {
            records.generation += 1;
            for id in filter_ids {
                records.cache.invalidate(id);
            }
        }
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one record and the active list together, as every rule-set
    /// mutation must.
    pub fn invalidate_filter(&self, filter_id: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.generation += 1;
            records.cache.invalidate(filter_id);
        }
        self.invalidate_active_filters();
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.generation += 1;
            records.cache.clear();
        }
        if let Ok(mut queries) = self.queries.lock() {
            queries.generation += 1;
            queries.cache.clear();
        }
    }

    pub fn cleanup_expired(&self) {
        if let Ok(mut queries) = self.queries.lock() {
            queries.cache.cleanup();
        }
    }

    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ResultCacheStats {
        ResultCacheStats {
            records: self.records.lock().map(|r| r.cache.stats()).unwrap_or_default(),
            queries: self.queries.lock().map(|q| q.cache.stats()).unwrap_or_default(),
            invalidations: self.invalidation_count(),
        }
    }
}
