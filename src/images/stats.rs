//! decoded cache stats
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
/// counters for the decoded image cache
pub struct CacheStats {
    /// the number of times an entry has been found
    pub hits: AtomicU64,
    /// the number of times an entry hasn't been found
    pub misses: AtomicU64,
    /// the number of entries that have been evicted
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// get the rate at which cache lookups result in a hit
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// reset stats
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Image Cache Statistics:\n- Hits: {}\n- Misses: {}\n- Hit Rate: {:.2}%\n- Evictions: {}",
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.hit_rate() * 100.0,
            self.evictions.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.hits.store(3, Ordering::Relaxed);
        stats.misses.store(1, Ordering::Relaxed);
        assert_eq!(stats.hit_rate(), 0.75);

        stats.reset();
        assert_eq!(stats.hits.load(Ordering::Relaxed), 0);
    }
}
