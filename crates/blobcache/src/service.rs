use std::{
    hash::Hash,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    cache_file_region::{Listener, Reader, Writer},
    clock::Clock,
    config::{CacheConfig, NodeRoleSet, ResolvedCacheConfig},
    error::{Error, Result},
    executor::Executors,
    metrics::{CacheMetrics, NoopMetrics},
    region_key::RegionKey,
    registry::Shared,
    shared_bytes::SharedBytes,
};

/// Shared, fixed-size, disk-backed block cache for one node.
///
/// One instance per node, constructed once at startup and held for the
/// node's lifetime — never a process-global singleton.
/// `K` is the caller's opaque blob identifier (a path, a blob id, ...).
pub struct SharedBlobCacheService<K> {
    resolved: ResolvedCacheConfig,
    shared: Arc<Shared<K>>,
    executors: Executors,
    closed: AtomicBool,
}

impl<K> SharedBlobCacheService<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Validates `config` against `roles`/`total_disk_bytes`, then creates
    /// and memory-maps the backing file at `path`. Fails fast on any
    /// invalid configuration before touching the filesystem.
    pub fn open(
        path: &Path,
        config: &CacheConfig,
        total_disk_bytes: u64,
        roles: NodeRoleSet,
        clock: Arc<dyn Clock>,
        executors: Executors,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Result<Self> {
        let resolved = config.resolve(total_disk_bytes, roles)?;

        if resolved.is_disabled() {
            debug!("shared cache disabled (resolved size 0)");
        } else {
            let remainder = resolved.shared_cache_size % resolved.region_size;
            if remainder != 0 {
                warn!(
                    "shared_cache.size {} is not a multiple of region_size {}; {} bytes discarded",
                    resolved.shared_cache_size, resolved.region_size, remainder
                );
            }
        }

        let bytes = SharedBytes::create(path, resolved.num_regions, resolved.region_size)?;
        let shared = Shared::new(bytes, clock, metrics, resolved.min_time_delta_millis);

        Ok(Self {
            resolved,
            shared,
            executors,
            closed: AtomicBool::new(false),
        })
    }

    /// Convenience constructor for tests: no-op metrics, caller-provided
    /// clock/executors.
    pub fn open_for_test(
        path: &Path,
        config: &CacheConfig,
        total_disk_bytes: u64,
        roles: NodeRoleSet,
        clock: Arc<dyn Clock>,
        executors: Executors,
    ) -> Result<Self> {
        Self::open(path, config, total_disk_bytes, roles, clock, executors, Arc::new(NoopMetrics))
    }

    pub fn config(&self) -> &ResolvedCacheConfig {
        &self.resolved
    }

    pub fn is_disabled(&self) -> bool {
        self.resolved.is_disabled()
    }

    /// Stops accepting new operations; in-flight populations already
    /// scheduled on an executor still run to completion.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    fn region_len_for(&self, blob_len: u64, region_idx: u64) -> Result<u64> {
        let region_size = self.resolved.region_size;
        let num_regions = blob_len.div_ceil(region_size).max(1);
        if region_idx >= num_regions {
            return Err(Error::InvalidRegionIndex {
                region_idx,
                blob_len,
                region_size,
            });
        }
        Ok(region_size.min(blob_len - region_idx * region_size))
    }

    fn validate_range(range: (u64, u64), region_len: u64) -> Result<()> {
        if range.0 > range.1 || range.1 > region_len {
            return Err(Error::RangeOutOfBounds {
                start: range.0,
                end: range.1,
                region_len,
            });
        }
        Ok(())
    }

    /// Reads `range_to_read` from one region of `file_key`, populating
    /// `range_to_write` (which must cover `range_to_read`) first if
    /// necessary, coalescing with any concurrent caller doing the same
    ///. Takes and releases a reference on the region across
    /// the whole operation so it can't be evicted out from under a
    /// populate in flight.
    pub fn get<T>(
        &self,
        file_key: K,
        blob_len: u64,
        region_idx: u64,
        range_to_write: (u64, u64),
        range_to_read: (u64, u64),
        writer: Writer,
        reader: Reader<T>,
        listener: Listener<T>,
    ) -> Result<()>
    where
        T: Send + 'static,
    {
        self.ensure_open()?;
        let region_len = self.region_len_for(blob_len, region_idx)?;
        Self::validate_range(range_to_write, region_len)?;
        Self::validate_range(range_to_read, region_len)?;

        let key = RegionKey::new(file_key, region_idx);
        let region = self.shared.get_or_create(key, region_len)?;

        if region.is_range_available(range_to_read) {
            self.shared.metrics.region_hit();
        } else {
            self.shared.metrics.region_miss();
        }

        let release = region.clone();
        let metrics = self.shared.metrics.clone();
        let wrapped: Listener<T> = Box::new(move |result| {
            if result.is_err() {
                metrics.populate_failed();
            }
            release.dec_ref();
            listener(result);
        });

        region.populate_and_read(range_to_write, range_to_read, writer, reader, self.executors.generic.as_ref(), wrapped);
        Ok(())
    }

    /// Unconditionally evicts one region by key, even with outstanding
    /// references. Returns whether a region was
    /// present to evict. Never fails.
    pub fn force_evict(&self, file_key: K, region_idx: u64) -> bool {
        self.shared.force_evict(&RegionKey::new(file_key, region_idx))
    }

    /// Unconditionally evicts every resident region whose blob key
    /// matches `predicate`. Returns the count
    /// evicted. Never fails.
    pub fn remove_from_cache(&self, predicate: impl FnMut(&K) -> bool) -> usize {
        self.shared.force_evict_matching(predicate)
    }

    /// Best-effort whole-entry prefetch: proceeds only if there is enough
    /// free-or-evictable capacity for every region of `blob_len` that
    /// isn't already resident. Never blocks on the populate it schedules.
    /// Residency alone doesn't mean a region is fully populated (a prior
    /// fill may have failed or only covered part of it), so every region
    /// is handed to `populate`, which decides per-region whether there is
    /// any gap left to fill; `listener` fires once, after every region's
    /// populate settles, with the first failure if any.
    pub fn maybe_fetch_full_entry(&self, file_key: K, blob_len: u64, writer: Writer, listener: Listener<()>) -> bool {
        if self.ensure_open().is_err() || self.is_disabled() {
            return false;
        }
        let region_size = self.resolved.region_size;
        let num_regions = blob_len.div_ceil(region_size).max(1);

        let new_allocations = (0..num_regions)
            .filter(|&idx| !self.shared.is_resident(&RegionKey::new(file_key.clone(), idx)))
            .count();
        if self.shared.available_capacity() < new_allocations {
            self.shared.metrics.no_capacity();
            return false;
        }

        let mut regions = Vec::with_capacity(num_regions as usize);
        for region_idx in 0..num_regions {
            let region_len = region_size.min(blob_len - region_idx * region_size);
            let key = RegionKey::new(file_key.clone(), region_idx);
            match self.shared.get_or_create(key, region_len) {
                Ok(region) => regions.push((region, region_len)),
                Err(_) => {
                    for (region, _) in regions {
                        region.dec_ref();
                    }
                    self.shared.metrics.no_capacity();
                    return false;
                }
            }
        }

        let remaining = Arc::new(AtomicUsize::new(regions.len()));
        let listener = Arc::new(Mutex::new(Some(listener)));
        for (region, region_len) in regions {
            let release = region.clone();
            let metrics = self.shared.metrics.clone();
            let remaining = remaining.clone();
            let listener = listener.clone();
            region.populate((0, region_len), writer.clone(), self.executors.bulk.as_ref(), move |result| {
                release.dec_ref();
                match result {
                    Ok(_) => {
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1
                            && let Some(listener) = listener.lock().take()
                        {
                            listener(Ok(()));
                        }
                    }
                    Err(e) => {
                        metrics.populate_failed();
                        if let Some(listener) = listener.lock().take() {
                            listener(Err(e));
                        }
                    }
                }
            });
        }
        true
    }

    /// Best-effort single-region prefetch. Always hands the region to
    /// `populate`, whether or not it was already resident, since
    /// residency doesn't guarantee full population; the return value and
    /// `listener` report `populate`'s own did-work answer, not mere
    /// presence in the cache.
    pub fn maybe_fetch_region(&self, file_key: K, blob_len: u64, region_idx: u64, writer: Writer, listener: Listener<()>) -> bool {
        if self.ensure_open().is_err() || self.is_disabled() {
            return false;
        }
        let region_len = match self.region_len_for(blob_len, region_idx) {
            Ok(len) => len,
            Err(_) => return false,
        };
        let key = RegionKey::new(file_key, region_idx);
        match self.shared.get_or_create(key, region_len) {
            Ok(region) => {
                let release = region.clone();
                let metrics = self.shared.metrics.clone();
                region.populate((0, region_len), writer, self.executors.bulk.as_ref(), move |result| {
                    if result.is_err() {
                        metrics.populate_failed();
                    }
                    release.dec_ref();
                    listener(result.map(|_| ()));
                })
            }
            Err(_) => {
                self.shared.metrics.no_capacity();
                false
            }
        }
    }

    /// Evicts the single least-used unreferenced region, if any.
    /// Respects the decay gate implicitly: `freq` only ever drops via
    /// [`Self::compute_decay`], so a just-decayed region is the one this
    /// picks first.
    pub fn maybe_evict_least_used(&self) -> bool {
        self.shared.evict_one()
    }

    /// Runs one decay tick over every resident region's frequency counter
    ///. Callers schedule this periodically; the cache itself has
    /// no timer.
    pub fn compute_decay(&self) {
        self.shared.decay_all();
    }

    pub fn free_region_count(&self) -> usize {
        self.shared.free_region_count()
    }

    /// Total resident (non-evicted) regions, for sanity-checking
    /// invariants in tests.
    pub fn region_count(&self) -> usize {
        self.shared.region_count()
    }

    pub fn metrics(&self) -> &dyn CacheMetrics {
        self.shared.metrics.as_ref()
    }
}
