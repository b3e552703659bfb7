//! Decoded images kept in process memory, least recently used first out.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::DynamicImage;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::domain::entities::CacheKey;
use crate::domain::ports::ImageCachePort;

/// Images held when the config does not say otherwise.
pub const DEFAULT_CACHE_SIZE: usize = 50;

/// LRU of decoded images keyed by [`CacheKey`].
pub struct MemoryImageCache {
    entries: Mutex<LruCache<CacheKey, Arc<DynamicImage>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryImageCache {
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Current size and lookup counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (size, capacity) = {
            let entries = self.entries.lock();
            (entries.len(), entries.cap().get())
        };
        CacheStats {
            size,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Presence check that leaves recency and counters alone.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains(key)
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

/// Snapshot of the memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Images currently held.
    pub size: usize,
    /// Images the tier can hold.
    pub capacity: usize,
    /// Lookups answered from memory.
    pub hits: u64,
    /// Lookups that fell through.
    pub misses: u64,
}

impl CacheStats {
    /// Share of lookups that hit, from 0 to 1. `None` before any lookup.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        (lookups > 0).then(|| self.hits as f64 / lookups as f64)
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Memory: {}/{} images", self.size, self.capacity)?;
        match self.hit_ratio() {
            Some(ratio) => write!(
                f,
                ", {} hits, {} misses ({:.0}% hit)",
                self.hits,
                self.misses,
                ratio * 100.0
            ),
            None => write!(f, ", no lookups yet"),
        }
    }
}

#[async_trait::async_trait]
impl ImageCachePort for MemoryImageCache {
    async fn get(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        let found = self.entries.lock().get(key).cloned();
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, hit = found.is_some(), "Memory lookup");
        found
    }

    async fn put(&self, key: CacheKey, image: Arc<DynamicImage>) {
        let displaced = self.entries.lock().push(key.clone(), image);
        if let Some((old, _)) = displaced
            && old != key
        {
            debug!(key = %old, "Memory tier full, dropped oldest");
        }
    }

    async fn evict(&self, key: &CacheKey) -> bool {
        let removed = self.entries.lock().pop(key).is_some();
        if removed {
            debug!(key = %key, "Evicted from memory");
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    async fn clear(&self) {
        self.entries.lock().clear();
        debug!("Memory tier cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side: u32) -> Arc<DynamicImage> {
        Arc::new(DynamicImage::new_rgb8(side, side))
    }

    #[tokio::test]
    async fn test_get_returns_stored_image() {
        let cache = MemoryImageCache::new(4);
        let key = CacheKey::new("a");

        cache.put(key.clone(), square(12)).await;

        let image = cache.get(&key).await.unwrap();
        assert_eq!(image.width(), 12);
    }

    #[tokio::test]
    async fn test_oldest_is_dropped_when_full() {
        let cache = MemoryImageCache::new(2);
        let (a, b, c) = (CacheKey::new("a"), CacheKey::new("b"), CacheKey::new("c"));

        cache.put(a.clone(), square(1)).await;
        cache.put(b.clone(), square(1)).await;
        // Touching `a` makes `b` the oldest.
        let _ = cache.get(&a).await;
        cache.put(c.clone(), square(1)).await;

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_contains_does_not_refresh() {
        let cache = MemoryImageCache::new(2);
        let (a, b) = (CacheKey::new("a"), CacheKey::new("b"));

        cache.put(a.clone(), square(1)).await;
        cache.put(b.clone(), square(1)).await;
        assert!(cache.contains(&a));
        cache.put(CacheKey::new("c"), square(1)).await;

        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
    }

    #[tokio::test]
    async fn test_replacing_a_key_keeps_one_entry() {
        let cache = MemoryImageCache::new(2);
        let key = CacheKey::new("a");

        cache.put(key.clone(), square(1)).await;
        cache.put(key.clone(), square(5)).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key).await.unwrap().width(), 5);
    }

    #[tokio::test]
    async fn test_evict_reports_presence() {
        let cache = MemoryImageCache::new(4);
        let key = CacheKey::new("a");

        assert!(!cache.evict(&key).await);
        cache.put(key.clone(), square(1)).await;
        assert!(cache.evict(&key).await);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_stats_count_lookups() {
        let cache = MemoryImageCache::new(3);
        assert_eq!(cache.stats().hit_ratio(), None);

        cache.put(CacheKey::new("a"), square(1)).await;
        let _ = cache.get(&CacheKey::new("a")).await;
        let _ = cache.get(&CacheKey::new("a")).await;
        let _ = cache.get(&CacheKey::new("missing")).await;

        let stats = cache.stats();
        assert_eq!(
            stats,
            CacheStats {
                size: 1,
                capacity: 3,
                hits: 2,
                misses: 1,
            }
        );
        assert!(stats.to_string().contains("1/3 images"));
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let cache = MemoryImageCache::new(0);
        assert_eq!(cache.stats().capacity, 1);
    }
}
