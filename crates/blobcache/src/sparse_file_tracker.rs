use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::error::{Error, Result};

type Listener = Box<dyn FnOnce(Result<()>) + Send>;

/// Tracks which byte ranges of one region are already populated and
/// coalesces concurrent population requests onto a single fill.
///
/// Lives with its owning region; accumulates populated ranges
/// monotonically until the region is evicted.
#[derive(Clone)]
pub struct SparseFileTracker {
    length: u64,
    inner: Arc<Mutex<TrackerState>>,
}

struct TrackerState {
    /// Disjoint, merged populated ranges, keyed by start.
    completed: BTreeMap<u64, u64>,
    /// Disjoint in-flight gaps, keyed by start.
    gaps: BTreeMap<u64, Arc<GapInner>>,
}

impl SparseFileTracker {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            inner: Arc::new(Mutex::new(TrackerState {
                completed: BTreeMap::new(),
                gaps: BTreeMap::new(),
            })),
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Returns whether `[start, end)` is already fully populated. Mostly
    /// useful for tests and `populate`'s idempotence check.
    pub fn is_fully_covered(&self, range: (u64, u64)) -> bool {
        subtract_sorted(self.inner.lock().completed.iter().map(copy_pair), range).is_empty()
    }

    /// Computes the gaps in `write_range` this caller must fill (claiming
    /// each one), and arranges for `listener` to fire once `read_range` is
    /// fully populated — immediately, if it already is.
    ///
    /// Concurrent callers requesting overlapping ranges attach to the
    /// gaps already claimed by someone else instead of re-claiming them:
    /// they get zero gaps back for the overlapping portion, and their
    /// listener rides the same completion.
    pub fn wait_for_range<F>(&self, write_range: (u64, u64), read_range: (u64, u64), listener: F) -> Vec<Gap>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let claim = self.claim(write_range, read_range);
        Self::fire_when_covered(claim.overlapping, listener);
        claim.claimed
    }

    /// Like [`Self::wait_for_range`] with `write_range == read_range ==
    /// range`, but reports whether *this* call is the one that claimed new
    /// work, both synchronously (the returned `bool`) and to `listener`
    /// (which fires once `range` is fully covered): `true` iff this
    /// call scheduled at least one gap, `false` if `range` was already
    /// fully covered or this call's claim was entirely coalesced onto an
    /// existing fill.
    pub fn claim_full_range<F>(&self, range: (u64, u64), listener: F) -> (Vec<Gap>, bool)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        let claim = self.claim(range, range);
        let did_claim = claim.did_claim;
        Self::fire_when_covered(claim.overlapping, move |outcome: Result<()>| {
            listener(outcome.map(|()| did_claim));
        });
        (claim.claimed, did_claim)
    }

    /// Claims whatever sub-ranges of `write_range` aren't already covered
    /// or already claimed by a concurrent caller, and collects every
    /// currently in-flight gap overlapping `read_range` (this call's own
    /// newly-claimed gaps included) so the caller can wait on all of them.
    fn claim(&self, write_range: (u64, u64), read_range: (u64, u64)) -> Claim {
        assert!(write_range.0 <= write_range.1 && write_range.1 <= self.length);
        assert!(read_range.0 <= read_range.1 && read_range.1 <= self.length);

        let mut state = self.inner.lock();

        let uncovered = subtract_sorted(state.completed.iter().map(copy_pair), write_range);

        let mut claimed_inner = Vec::new();
        for segment in uncovered {
            let free = subtract_sorted(state.gaps.values().map(|g| (g.start, g.end)), segment);
            for (start, end) in free {
                let gap = Arc::new(GapInner::new(start, end));
                state.gaps.insert(start, gap.clone());
                claimed_inner.push(gap);
            }
        }
        let did_claim = !claimed_inner.is_empty();

        let overlapping: Vec<Arc<GapInner>> = state
            .gaps
            .values()
            .filter(|g| ranges_overlap((g.start, g.end), read_range))
            .cloned()
            .collect();

        drop(state);

        let claimed = claimed_inner
            .into_iter()
            .map(|inner| Gap {
                inner,
                tracker: self.inner.clone(),
            })
            .collect();

        Claim { claimed, overlapping, did_claim }
    }

    /// Fires `listener` once every gap in `overlapping` has resolved —
    /// immediately if `overlapping` is empty. The first gap to fail wins;
    /// otherwise `listener` runs exactly once, after the last one completes.
    fn fire_when_covered<F>(overlapping: Vec<Arc<GapInner>>, listener: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if overlapping.is_empty() {
            listener(Ok(()));
            return;
        }
        let remaining = Arc::new(AtomicUsize::new(overlapping.len()));
        let listener: Arc<Mutex<Option<F>>> = Arc::new(Mutex::new(Some(listener)));
        for gap in &overlapping {
            let remaining = remaining.clone();
            let listener = listener.clone();
            gap.add_waiter(Box::new(move |outcome: Result<()>| match outcome {
                Ok(()) => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1
                        && let Some(listener) = listener.lock().take()
                    {
                        listener(Ok(()));
                    }
                }
                Err(e) => {
                    if let Some(listener) = listener.lock().take() {
                        listener(Err(e));
                    }
                }
            }));
        }
    }
}

struct Claim {
    claimed: Vec<Gap>,
    overlapping: Vec<Arc<GapInner>>,
    did_claim: bool,
}

fn copy_pair((s, e): (&u64, &u64)) -> (u64, u64) {
    (*s, *e)
}

fn ranges_overlap(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

/// Subtracts a sorted, disjoint set of occupied intervals from `range`,
/// returning the uncovered sub-ranges in order.
fn subtract_sorted(occupied: impl Iterator<Item = (u64, u64)>, range: (u64, u64)) -> Vec<(u64, u64)> {
    let (mut cursor, end) = range;
    let mut gaps = Vec::new();
    for (ostart, oend) in occupied {
        if oend <= cursor {
            continue;
        }
        if ostart >= end {
            break;
        }
        if ostart > cursor {
            gaps.push((cursor, ostart.min(end)));
        }
        cursor = cursor.max(oend);
        if cursor >= end {
            break;
        }
    }
    if cursor < end {
        gaps.push((cursor, end));
    }
    gaps
}

fn merge_range(completed: &mut BTreeMap<u64, u64>, (mut start, mut end): (u64, u64)) {
    let mut absorbed = Vec::new();
    for (&cstart, &cend) in completed.iter() {
        if cend < start {
            continue;
        }
        if cstart > end {
            break;
        }
        start = start.min(cstart);
        end = end.max(cend);
        absorbed.push(cstart);
    }
    for key in absorbed {
        completed.remove(&key);
    }
    completed.insert(start, end);
}

struct GapWaitState {
    outcome: Option<Result<()>>,
    waiters: Vec<Listener>,
}

struct GapInner {
    start: u64,
    end: u64,
    progress: AtomicU64,
    state: Mutex<GapWaitState>,
}

impl GapInner {
    fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            progress: AtomicU64::new(0),
            state: Mutex::new(GapWaitState {
                outcome: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Registers `waiter` to run once this gap resolves; runs it
    /// immediately if the gap has already resolved. Outcome-check and
    /// waiter-registration share one lock so a concurrent `finish` can
    /// never complete between the check and the registration.
    fn add_waiter(&self, waiter: Listener) {
        let mut state = self.state.lock();
        match &state.outcome {
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                waiter(outcome);
            }
            None => state.waiters.push(waiter),
        }
    }
}

/// A contiguous unpopulated sub-range claimed by one populator. The
/// holder must eventually call exactly one of
/// [`Gap::on_completion`] / [`Gap::on_failure`].
pub struct Gap {
    inner: Arc<GapInner>,
    tracker: Arc<Mutex<TrackerState>>,
}

impl Gap {
    pub fn start(&self) -> u64 {
        self.inner.start
    }

    pub fn end(&self) -> u64 {
        self.inner.end
    }

    pub fn len(&self) -> u64 {
        self.inner.end - self.inner.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records that `bytes` further bytes of this gap have been written.
    /// The writer contract requires monotonically increasing progress
    /// summing to exactly [`Gap::len`] by the time [`Gap::on_completion`]
    /// is called.
    pub fn on_progress(&self, bytes: u64) {
        self.inner.progress.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Marks the gap as fully populated, merging it into the tracker's
    /// completed ranges and waking every coalesced waiter.
    pub fn on_completion(self) {
        debug_assert_eq!(
            self.inner.progress.load(Ordering::Relaxed),
            self.len(),
            "writer completed without reporting the full gap length"
        );
        self.finish(Ok(()));
    }

    /// Marks the gap as failed; the range remains unpopulated and a later
    /// caller may retry it. Every coalesced waiter sees the error.
    pub fn on_failure(self, err: Error) {
        self.finish(Err(err));
    }

    fn finish(&self, outcome: Result<()>) {
        let waiters = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.waiters)
        };

        {
            let mut tracker = self.tracker.lock();
            tracker.gaps.remove(&self.inner.start);
            if outcome.is_ok() {
                merge_range(&mut tracker.completed, (self.inner.start, self.inner.end));
            }
        }

        for waiter in waiters {
            waiter(outcome.clone());
        }
    }
}
