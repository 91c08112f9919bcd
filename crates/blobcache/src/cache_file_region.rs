use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc,
};

use crate::{
    error::Result,
    executor::Executor,
    region_key::RegionKey,
    registry::WeakShared,
    shared_bytes::RegionChannel,
    sparse_file_tracker::{Gap, SparseFileTracker},
};

/// Fills a claimed [`Gap`], writing through the given channel and reporting
/// progress/outcome on the gap itself.
pub type Writer = Arc<dyn Fn(&RegionChannel, &Gap) -> Result<()> + Send + Sync>;

/// Reads already-populated bytes out of a region once a read range is
/// satisfied.
pub type Reader<T> = Arc<dyn Fn(&RegionChannel) -> T + Send + Sync>;

/// One-shot completion callback for a `populate_and_read` call.
pub type Listener<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Highest frequency counter value. Chosen to match the source
/// system's 3-bit-ish saturating counter: enough headroom to separate a
/// handful of repeat accesses from one-shot reads without the counter
/// dominating the decay schedule.
pub const FREQ_MAX: u8 = 3;

/// One physical region: a fixed-size slot of the backing file, the
/// coverage tracker over it, and the reference-counted eviction state
/// machine.
///
/// Resident / EvictPending / Evicted is encoded as a single packed
/// `AtomicU64` (bit 63 = evicted, low 63 bits = ref count) rather than a
/// separate bool and counter: `try_inc_ref` must observe "not evicted" and
/// bump the count as one atomic step, or a racing evictor could hand out a
/// reference to a slot already reclaimed.
pub struct CacheFileRegion<K> {
    key: RegionKey<K>,
    slot: usize,
    region_len: u64,
    tracker: SparseFileTracker,
    /// bit 63: evicted. bits 0..63: ref count.
    state: AtomicU64,
    freq: AtomicU8,
    last_access_millis: AtomicU64,
    owner: WeakShared<K>,
}

impl<K> CacheFileRegion<K> {
    const EVICTED_BIT: u64 = 1 << 63;

    /// `state` starts at one reference, not zero: the caller allocating this
    /// region (`Shared::get_or_create`'s miss path) always holds an implicit
    /// ref it releases like any other `get`/`populate` caller would, and
    /// starting at zero would let a concurrent eviction pass steal the slot
    /// before the allocator ever gets to use it. `freq`
    /// starts at 1 and `last_access_millis` at `now_millis` — a fresh miss
    /// is born with one access already counted, so the caller
    /// must not also `touch()` a freshly created region, or it would
    /// double-promote under a zero `min_time_delta`.
    pub(crate) fn new(key: RegionKey<K>, slot: usize, region_len: u64, now_millis: u64, owner: WeakShared<K>) -> Arc<Self> {
        Arc::new(Self {
            key,
            slot,
            region_len,
            tracker: SparseFileTracker::new(region_len),
            state: AtomicU64::new(1),
            freq: AtomicU8::new(1),
            last_access_millis: AtomicU64::new(now_millis),
            owner,
        })
    }

    pub fn key(&self) -> &RegionKey<K> {
        &self.key
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn region_len(&self) -> u64 {
        self.region_len
    }

    pub fn ref_count(&self) -> u64 {
        self.state.load(Ordering::Acquire) & !Self::EVICTED_BIT
    }

    pub fn is_evicted(&self) -> bool {
        self.state.load(Ordering::Acquire) & Self::EVICTED_BIT != 0
    }

    pub fn freq(&self) -> u8 {
        self.freq.load(Ordering::Relaxed)
    }

    pub fn last_access_millis(&self) -> u64 {
        self.last_access_millis.load(Ordering::Relaxed)
    }

    /// Attempts to take a reference; fails once the region is evicted.
    /// The CAS loop is what makes "not evicted" and "ref count bumped"
    /// indivisible — see the struct-level note on why a separate bool
    /// and counter would race.
    pub fn try_inc_ref(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & Self::EVICTED_BIT != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases a reference taken by `try_inc_ref`. If this was the last
    /// reference on a region already marked evicted, finalizes the
    /// eviction by reclaiming the slot through the owning registry — the
    /// deferred half of a `forceEvict`/`removeFromCache` on a region
    /// that still had readers.
    pub fn dec_ref(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        let count_before = prev & !Self::EVICTED_BIT;
        debug_assert!(count_before > 0, "dec_ref on a region already at zero refs");
        if prev & Self::EVICTED_BIT != 0 && count_before == 1 {
            self.owner.finalize_eviction(self.slot);
        }
    }

    /// Evicts this region only if it is currently unreferenced. Used by
    /// the least-used sweep and miss-path eviction, both of which must
    /// never evict something another caller is actively reading.
    pub fn try_evict(&self) -> bool {
        self.state
            .compare_exchange(0, Self::EVICTED_BIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally marks this region evicted, regardless of ref
    /// count. Returns `true` if the slot is immediately reclaimable
    /// (no outstanding refs), `false` if a later `dec_ref` must finish the
    /// job.
    pub fn force_evict(&self) -> bool {
        let prev = self.state.fetch_or(Self::EVICTED_BIT, Ordering::AcqRel);
        (prev & !Self::EVICTED_BIT) == 0
    }

    /// Bumps the frequency counter, gated by `min_time_delta_millis` since
    /// the last bump: back-to-back accesses within the gate don't
    /// inflate the counter, so a single hot loop isn't indistinguishable
    /// from genuinely repeated access over time.
    pub fn touch(&self, now_millis: u64, min_time_delta_millis: u64) {
        let last = self.last_access_millis.load(Ordering::Relaxed);
        if now_millis.saturating_sub(last) < min_time_delta_millis {
            return;
        }
        if self
            .last_access_millis
            .compare_exchange(last, now_millis, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let _ = self.freq.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |f| {
                if f < FREQ_MAX {
                    Some(f + 1)
                } else {
                    None
                }
            });
        }
    }

    /// Decrements the frequency counter by one, floored at zero, but only
    /// if this region hasn't been accessed in at least `2 *
    /// min_time_delta_millis`: decay lowers eligibility for regions
    /// that have gone cold, it doesn't race ahead of a region still being
    /// actively promoted. Called periodically across every resident region.
    pub fn decay(&self, now_millis: u64, min_time_delta_millis: u64) {
        let last = self.last_access_millis.load(Ordering::Relaxed);
        if now_millis.saturating_sub(last) < 2 * min_time_delta_millis {
            return;
        }
        let _ = self
            .freq
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |f| f.checked_sub(1));
    }

    /// True if `range` is already fully populated.
    pub fn is_range_available(&self, range: (u64, u64)) -> bool {
        self.tracker.is_fully_covered(range)
    }

    /// Synchronous fast path: returns `Some` immediately if `range` is
    /// already populated, `None` if it would require waiting on a gap.
    pub fn try_read<T>(&self, range: (u64, u64), reader: &Reader<T>) -> Option<T> {
        if self.tracker.is_fully_covered(range) {
            Some(self.with_channel(|ch| reader(ch)))
        } else {
            None
        }
    }

    /// Core populate-then-read operation.
    /// Claims whatever gaps of `write_range` aren't already covered or
    /// already claimed by a concurrent caller, schedules `writer` for each
    /// on `executor`, and fires `listener` with `reader`'s result once
    /// `read_range` is fully populated.
    pub fn populate_and_read<T>(
        self: &Arc<Self>,
        write_range: (u64, u64),
        read_range: (u64, u64),
        writer: Writer,
        reader: Reader<T>,
        executor: &dyn Executor,
        listener: Listener<T>,
    ) where
        T: Send + 'static,
    {
        let this = self.clone();
        let gaps = self.tracker.wait_for_range(write_range, read_range, move |outcome| {
            let result = outcome.map(|()| this.with_channel(|ch| reader(ch)));
            listener(result);
        });
        self.spawn_gap_fills(gaps, writer, executor);
    }

    /// Eagerly populates `write_range`, reporting whether this exact call
    /// is the one that scheduled new work: `true` if it
    /// claimed at least one gap, `false` if the range was already fully
    /// present or this call's claim coalesced onto someone else's
    /// in-flight fill. The same answer is both returned synchronously and
    /// passed to `on_done` once the range finishes covering.
    /// Population failures are still recorded in the tracker so a later
    /// real read retries the gap.
    pub fn populate<F>(self: &Arc<Self>, write_range: (u64, u64), writer: Writer, executor: &dyn Executor, on_done: F) -> bool
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        let (gaps, did_claim) = self.tracker.claim_full_range(write_range, on_done);
        self.spawn_gap_fills(gaps, writer, executor);
        did_claim
    }

    fn spawn_gap_fills(self: &Arc<Self>, gaps: Vec<Gap>, writer: Writer, executor: &dyn Executor) {
        for gap in gaps {
            let this = self.clone();
            let writer = writer.clone();
            executor.spawn(Box::new(move || {
                let (start, end) = (gap.start(), gap.end());
                let outcome = this.with_channel(|ch| writer(ch, &gap));
                match outcome {
                    Ok(()) => {
                        this.owner.upgrade().metrics.gap_filled(end - start);
                        gap.on_completion();
                    }
                    Err(e) => gap.on_failure(crate::error::Error::PopulateFailed {
                        start,
                        end,
                        source: Box::new(e),
                    }),
                }
            }));
        }
    }

    fn with_channel<T>(&self, f: impl FnOnce(&RegionChannel) -> T) -> T {
        let owner = self.owner.upgrade();
        let channel = owner.bytes.channel(self.slot);
        f(&channel)
    }
}
