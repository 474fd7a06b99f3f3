//! LRU cache of decoded images with entry and byte bounds
use {
    crate::images::{
        decode::{DecodedImage, byte_size},
        stats::CacheStats,
    },
    lru::LruCache,
    std::sync::{Mutex, atomic::Ordering},
    tracing::debug,
};

struct CacheInner {
    lru: LruCache<String, DecodedImage>,
    total_bytes: u64,
}

/// bounded cache of decoded images, keyed by path or scaled-variant key
///
/// two bounds hold after every insert: at most `max_entries` images and at
/// most `max_bytes` of decoded pixel data. eviction is least-recently-used
/// until both bounds are satisfied. an evicted image's buffer is freed as
/// soon as the last display holding it lets go.
pub struct ImageCache {
    inner: Mutex<CacheInner>,
    stats: CacheStats,
    max_entries: usize,
    max_bytes: u64,
}

impl ImageCache {
    /// make a cache bounded by `max_entries` items and `max_memory_mb` MB
    pub fn new(max_entries: usize, max_memory_mb: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                total_bytes: 0,
            }),
            stats: CacheStats::default(),
            max_entries: max_entries.max(1),
            max_bytes: max_memory_mb * 1024 * 1024,
        }
    }

    /// fetch an image, promoting it to most-recently-used
    pub fn get(&self, key: &str) -> Option<DecodedImage> {
        let mut inner = self.lock();
        let found = inner.lru.get(key).cloned();
        if found.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// whether a key is present, without promoting it
    pub fn contains(&self, key: &str) -> bool {
        self.lock().lru.contains(key)
    }

    /// insert an image and evict until both bounds hold
    pub fn put(&self, key: String, image: DecodedImage) {
        let mut inner = self.lock();
        let incoming = byte_size(&image);

        if let Some(previous) = inner.lru.put(key, image) {
            inner.total_bytes -= byte_size(&previous);
        }
        inner.total_bytes += incoming;

        while inner.lru.len() > self.max_entries || inner.total_bytes > self.max_bytes {
            let Some((evicted_key, evicted)) = inner.lru.pop_lru() else {
                break;
            };
            inner.total_bytes -= byte_size(&evicted);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("evicted decoded image: {}", evicted_key);
        }
    }

    /// hit/miss/eviction counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// number of cached images
    pub fn size(&self) -> usize {
        self.lock().lru.len()
    }

    /// decoded bytes currently held
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    /// drop everything
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.lru.clear();
        inner.total_bytes = 0;
        self.stats.reset();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("image cache lock poisoned")
    }
}
