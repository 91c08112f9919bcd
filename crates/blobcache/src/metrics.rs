use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Counters/timers fed by the cache. An external collaborator in the
/// source system — this crate only defines the sink interface and a
/// couple of trivial implementations, never a concrete metrics backend.
pub trait CacheMetrics: Send + Sync + fmt::Debug {
    fn region_hit(&self) {}
    fn region_miss(&self) {}
    fn region_evicted(&self) {}
    fn gap_filled(&self, bytes: u64) {
        let _ = bytes;
    }
    fn populate_failed(&self) {}
    fn no_capacity(&self) {}
}

/// Discards every observation. The default when a caller doesn't wire up
/// a real sink.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {}

/// Plain atomic counters, useful in tests that assert on cache behavior
/// without standing up a real metrics backend.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub bytes_filled: AtomicU64,
    pub populate_failures: AtomicU64,
    pub no_capacity: AtomicU64,
}

impl CacheMetrics for CountingMetrics {
    fn region_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn region_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn region_evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn gap_filled(&self, bytes: u64) {
        self.bytes_filled.fetch_add(bytes, Ordering::Relaxed);
    }

    fn populate_failed(&self) {
        self.populate_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn no_capacity(&self) {
        self.no_capacity.fetch_add(1, Ordering::Relaxed);
    }
}
