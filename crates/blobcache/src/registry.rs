use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    cache_file_region::CacheFileRegion, clock::Clock, metrics::CacheMetrics, region_key::RegionKey,
    shared_bytes::SharedBytes,
};

/// Everything protected by the single service lock: the free-slot
/// pool and the key -> region map. `CacheFileRegion` never reaches into
/// this directly; it calls back through [`WeakShared::upgrade`] only to
/// finalize an eviction it observed going to zero refs.
pub(crate) struct Shared<K> {
    pub(crate) bytes: SharedBytes,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Arc<dyn CacheMetrics>,
    pub(crate) min_time_delta_millis: u64,
    state: Mutex<RegistryState<K>>,
}

struct RegistryState<K> {
    by_key: HashMap<RegionKey<K>, Arc<CacheFileRegion<K>>>,
    slots: Vec<Option<Arc<CacheFileRegion<K>>>>,
    free_slots: Vec<usize>,
}

impl<K: Clone + Eq + Hash + Send + Sync + 'static> Shared<K> {
    pub(crate) fn new(
        bytes: SharedBytes,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn CacheMetrics>,
        min_time_delta_millis: u64,
    ) -> Arc<Self> {
        let num_regions = bytes.num_regions();
        Arc::new(Self {
            bytes,
            clock,
            metrics,
            min_time_delta_millis,
            state: Mutex::new(RegistryState {
                by_key: HashMap::new(),
                slots: (0..num_regions).map(|_| None).collect(),
                free_slots: (0..num_regions).rev().collect(),
            }),
        })
    }

    pub(crate) fn weak(self: &Arc<Self>) -> WeakShared<K> {
        WeakShared(Arc::downgrade(self))
    }

    pub(crate) fn num_regions(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub(crate) fn free_region_count(&self) -> usize {
        self.state.lock().free_slots.len()
    }

    pub(crate) fn region_count(&self) -> usize {
        self.state.lock().by_key.len()
    }

    pub(crate) fn is_resident(&self, key: &RegionKey<K>) -> bool {
        self.state.lock().by_key.contains_key(key)
    }

    /// Free slots plus currently-unreferenced resident regions: the
    /// capacity available to a caller willing to trigger eviction to make
    /// room (used by `maybeFetchFullEntry`'s all-or-nothing precheck).
    pub(crate) fn available_capacity(&self) -> usize {
        let state = self.state.lock();
        let evictable = state.by_key.values().filter(|r| r.ref_count() == 0).count();
        state.free_slots.len() + evictable
    }

    pub(crate) fn decay_all(&self) {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        for region in state.by_key.values() {
            region.decay(now, self.min_time_delta_millis);
        }
    }

    /// Returns the cached region for `key` if resident, allocating (and
    /// possibly evicting a region to free a slot) if not. `region_len` is
    /// the logical length of this specific region (the last region of a
    /// blob may be shorter than `region_size`). Promotes the found
    /// region's frequency on a hit; a freshly allocated region
    /// already starts at `freq = 1` and is not also touched, so a zero
    /// `min_time_delta` can't double-promote it.
    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        key: RegionKey<K>,
        region_len: u64,
    ) -> crate::error::Result<Arc<CacheFileRegion<K>>> {
        loop {
            let mut state = self.state.lock();

            if let Some(region) = state.by_key.get(&key).cloned() {
                drop(state);
                if region.try_inc_ref() {
                    region.touch(self.clock.now_millis(), self.min_time_delta_millis);
                    return Ok(region);
                }
                // Lost the race with an in-flight eviction of this exact
                // region; retry, which will either find it gone (and
                // allocate fresh) or find a newer incarnation.
                continue;
            }

            let slot = match state.free_slots.pop() {
                Some(slot) => slot,
                None => {
                    drop(state);
                    if !self.evict_for_allocation() {
                        return Err(crate::error::Error::NoEvictableRegion);
                    }
                    continue;
                }
            };

            let now = self.clock.now_millis();
            let region = CacheFileRegion::new(key.clone(), slot, region_len, now, self.weak());
            state.slots[slot] = Some(region.clone());
            state.by_key.insert(key.clone(), region.clone());
            return Ok(region);
        }
    }

    /// Evicts a victim to satisfy an allocation when the free pool is
    /// exhausted: prefers a region with `freq == 0`, else the minimum-`freq`
    /// unreferenced region. Unlike [`Self::evict_one`], this evicts
    /// regardless of whether any region has actually decayed to zero — an
    /// allocation must make room somehow.
    pub(crate) fn evict_for_allocation(self: &Arc<Self>) -> bool {
        let victim = {
            let mut state = self.state.lock();
            let key = state
                .by_key
                .values()
                .filter(|r| r.ref_count() == 0)
                .min_by_key(|r| (r.freq(), r.last_access_millis(), r.slot()))
                .map(|r| r.key().clone());
            key.and_then(|k| state.by_key.remove(&k))
        };
        match victim {
            Some(region) => {
                self.force_evict_region(&region);
                true
            }
            None => false,
        }
    }

    /// `maybeEvictLeastUsed`: evicts one unreferenced region
    /// whose frequency has decayed to zero, tie-broken by lowest
    /// `last_access_millis` then lowest slot index. Returns `false` if no
    /// such region exists, even when evictable regions with `freq > 0` do —
    /// decay gates eligibility, this operation never overrides it.
    pub(crate) fn evict_one(self: &Arc<Self>) -> bool {
        let victim = {
            let mut state = self.state.lock();
            let key = state
                .by_key
                .values()
                .filter(|r| r.ref_count() == 0 && r.freq() == 0)
                .min_by_key(|r| (r.last_access_millis(), r.slot()))
                .map(|r| r.key().clone());
            key.and_then(|k| state.by_key.remove(&k))
        };
        match victim {
            Some(region) => {
                self.force_evict_region(&region);
                true
            }
            None => false,
        }
    }

    /// Unconditionally removes `key` from the cache if present, evicting
    /// it even if it has outstanding references. The
    /// slot is reclaimed immediately if unreferenced, or deferred to the
    /// final `dec_ref` otherwise. Never fails.
    pub(crate) fn force_evict(&self, key: &RegionKey<K>) -> bool {
        let region = {
            let mut state = self.state.lock();
            state.by_key.remove(key)
        };
        match region {
            Some(region) => {
                self.force_evict_region(&region);
                true
            }
            None => false,
        }
    }

    /// Unconditionally evicts every resident region matching `predicate`
    ///. Returns the number evicted.
    pub(crate) fn force_evict_matching(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let matched: Vec<Arc<CacheFileRegion<K>>> = {
            let mut state = self.state.lock();
            let keys: Vec<RegionKey<K>> = state
                .by_key
                .keys()
                .filter(|k| predicate(&k.file_key))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| state.by_key.remove(k)).collect()
        };
        let count = matched.len();
        for region in matched {
            self.force_evict_region(&region);
        }
        count
    }

    fn force_evict_region(&self, region: &Arc<CacheFileRegion<K>>) {
        self.metrics.region_evicted();
        if region.force_evict() {
            self.reclaim_slot(region.slot());
        }
    }

    /// Called by [`CacheFileRegion::dec_ref`] once a region that was
    /// marked evicted while still referenced finally reaches zero refs.
    pub(crate) fn finalize_eviction(&self, slot: usize) {
        self.reclaim_slot(slot);
    }

    fn reclaim_slot(&self, slot: usize) {
        let mut state = self.state.lock();
        state.slots[slot] = None;
        state.free_slots.push(slot);
    }
}

/// Weak back-reference a [`CacheFileRegion`] holds to the registry that
/// owns its slot: a region never outlives the registry in normal use, so
/// `upgrade` panicking is the contract, not a case the caller needs to
/// handle.
pub(crate) struct WeakShared<K>(Weak<Shared<K>>);

impl<K> Clone for WeakShared<K> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<K> WeakShared<K> {
    pub(crate) fn upgrade(&self) -> Arc<Shared<K>> {
        self.0
            .upgrade()
            .expect("cache registry dropped while a region still exists")
    }

    pub(crate) fn finalize_eviction(&self, slot: usize) {
        self.upgrade().finalize_eviction(slot);
    }
}
