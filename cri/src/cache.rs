//! Rewrite result cache.
//!
//! Bounded LRU keyed by the raw image reference the kubelet sent, with a
//! per-entry TTL. Only registry probe outcomes are stored; a hit skips
//! probing.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

/// Cached outcome of one rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRewrite {
    pub image: String,
    /// Registry the reference was redirected to, if any.
    pub domain: Option<String>,
    pub replaced: bool,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub image_hits: u64,
    pub image_misses: u64,
    /// Entries dropped by TTL expiry or LRU displacement.
    pub image_evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub taken_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

struct Entry {
    value: CachedRewrite,
    expires_at: Instant,
}

/// LRU + TTL cache of rewrite results. Capacity 0 disables it.
pub struct RewriteCache {
    ttl: Duration,
    entries: Option<Mutex<LruCache<String, Entry>>>,
    metrics: CacheMetrics,
}

impl RewriteCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            metrics: CacheMetrics::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub fn get(&self, key: &str) -> Option<CachedRewrite> {
        let mut entries = self.entries.as_ref()?.lock();

        match entries.get(key) {
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) if entry.expires_at > Instant::now() => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }
        entries.pop(key);
        self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: &str, value: CachedRewrite) {
        let Some(entries) = &self.entries else {
            return;
        };
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        // `push` hands back either the replaced entry for `key` or the
        // least recently used one it displaced.
        if let Some((displaced, _)) = entries.lock().push(key.to_string(), entry) {
            if displaced != key {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop every entry.
    pub fn invalidate(&self) {
        let Some(entries) = &self.entries else {
            return;
        };
        entries.lock().clear();
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Rewrite cache invalidated");
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            image_hits: self.metrics.hits.load(Ordering::Relaxed),
            image_misses: self.metrics.misses.load(Ordering::Relaxed),
            image_evictions: self.metrics.evictions.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
            taken_at: Utc::now(),
        }
    }
}
