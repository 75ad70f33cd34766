//! Byte-bounded LRU cache for fetched assets.
//!
//! Keys are content identities (`"{bucket}/{key}"`). Population is not
//! coordinated with in-flight fetches: two jobs missing the same key both
//! fetch it and the last insert wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::debug;

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: u64,
    pub bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

pub struct AssetCache {
    entries: Cache<String, Arc<Vec<u8>>>,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
}

fn weight(data: &Arc<Vec<u8>>) -> u32 {
    u32::try_from(data.len()).unwrap_or(u32::MAX)
}

impl AssetCache {
    pub fn new(max_bytes: usize) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let on_evict = evictions.clone();
        let entries = Cache::builder()
            .max_capacity(max_bytes as u64)
            .weigher(|_key: &String, data: &Arc<Vec<u8>>| weight(data))
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key: Arc<String>, data: Arc<Vec<u8>>, cause| {
                if cause == RemovalCause::Size {
                    on_evict.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, size = data.len(), "asset evicted");
                }
            })
            .build();

        Self {
            entries,
            max_bytes: max_bytes as u64,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let found = self.entries.get(key);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Insert or replace. Values larger than the whole cache are not stored.
    pub fn insert(&self, key: impl Into<String>, data: Arc<Vec<u8>>) {
        let key = key.into();
        if u64::from(weight(&data)) > self.max_bytes {
            debug!(key = %key, size = data.len(), max_bytes = self.max_bytes, "asset too large to cache");
            return;
        }
        self.entries.insert(key, data);
        // settle evictions now so the byte cap holds once insert returns
        self.entries.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.entry_count(),
            bytes: self.entries.weighted_size(),
        }
    }
}
