use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by every [`super::DataCache`] and the processor caches
/// built on it.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups answered by an existing entry
    pub hits: AtomicU64,
    /// Lookups that inserted a new entry
    pub misses: AtomicU64,
    /// Entries removed by invalidation, maintenance or disposal
    pub evictions: AtomicU64,
    /// Registration passes repeated because a scope invalidated the key
    /// mid-registration
    pub registration_retries: AtomicU64,
    /// Lookups for targets the factory declared uncacheable
    pub uncacheable: AtomicU64,
    /// Per-identity results served from a scoped entry
    pub result_hits: AtomicU64,
    /// Calls into the wrapped processor
    pub processor_invocations: AtomicU64,
    /// Async requests that joined an in-flight computation
    pub coalesced: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            registration_retries: self.registration_retries.load(Ordering::Relaxed),
            uncacheable: self.uncacheable.load(Ordering::Relaxed),
            result_hits: self.result_hits.load(Ordering::Relaxed),
            processor_invocations: self.processor_invocations.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub registration_retries: u64,
    pub uncacheable: u64,
    pub result_hits: u64,
    pub processor_invocations: u64,
    pub coalesced: u64,
}

impl CacheStatsSnapshot {
    /// Fraction of scoped lookups served without inserting an entry.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Combine the counters of several caches.
    pub fn merge(&self, other: &CacheStatsSnapshot) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            evictions: self.evictions + other.evictions,
            registration_retries: self.registration_retries + other.registration_retries,
            uncacheable: self.uncacheable + other.uncacheable,
            result_hits: self.result_hits + other.result_hits,
            processor_invocations: self.processor_invocations + other.processor_invocations,
            coalesced: self.coalesced + other.coalesced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_ratio() {
        let stats = CacheStats::new();
        CacheStats::bump(&stats.hits);
        CacheStats::bump(&stats.hits);
        CacheStats::bump(&stats.hits);
        CacheStats::bump(&stats.misses);
        stats.evictions.fetch_add(4, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 3);
        assert_eq!(snapshot.evictions, 4);
        assert!((snapshot.hit_ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStatsSnapshot::default().hit_ratio(), 0.0);
    }

    #[test]
    fn test_merge() {
        let a = CacheStatsSnapshot {
            hits: 1,
            processor_invocations: 2,
            ..Default::default()
        };
        let b = CacheStatsSnapshot {
            hits: 4,
            coalesced: 1,
            ..Default::default()
        };
        let merged = a.merge(&b);
        assert_eq!(merged.hits, 5);
        assert_eq!(merged.processor_invocations, 2);
        assert_eq!(merged.coalesced, 1);
    }
}
