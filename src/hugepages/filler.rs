//! The filler: a multiset of per-huge-page trackers, binned by
//! fragmentation class, that routes page-run allocations to the best-fit
//! huge page and selects release candidates.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Duration;

use super::clock::Clock;
use super::page_tracker::PageTracker;
use super::pages::{HugeLength, Length, PageId, HUGE_PAGE_SIZE, PAGES_PER_HUGE_PAGE};
use super::stats::{safe_div_lengths, BackingStats, LargeSpanStats, PbtxtRegion, SmallSpanStats};
use super::stats_tracker::{
    FillerPool, FillerStats, FillerStatsTracker, SkipSubreleaseIntervals, SubreleaseStats,
};
use super::tracker_lists::{HintedTrackerLists, TrackerId, TrackerSlab};
use super::vm::Unback;

/// Predicted access density of the small-object spans placed on allocated
/// pages. Densely-accessed spans pack into their own huge pages when the
/// filler is configured with separate pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessDensityPrediction {
    Sparse = 0,
    Dense = 1,
}

const SPARSE: usize = AccessDensityPrediction::Sparse as usize;
const DENSE: usize = AccessDensityPrediction::Dense as usize;
/// Per-density array slots: sparse, dense, and their sum.
const BOTH: usize = 2;

/// Span metadata supplied with every allocation. Only the density is
/// observed by the core.
#[derive(Clone, Copy, Debug)]
pub struct SpanAllocInfo {
    pub density: AccessDensityPrediction,
    pub objects_per_span: usize,
}

/// Whether sparse and dense spans share the regular tracker pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillerAllocsOption {
    UnifiedAllocs,
    SeparateAllocs,
}

/// Upper bound on `chunks_per_alloc`, the logarithmic quantization of
/// per-tracker allocation counts.
pub const MAX_CHUNKS_PER_ALLOC: usize = 16;

/// Candidate huge pages examined per release iteration.
pub const CANDIDATES_FOR_RELEASING_MEMORY: usize = PAGES_PER_HUGE_PAGE;

/// When releasing free pages from partial allocs is requested, raise the
/// target to this fraction of the free pages in those allocs.
pub const PARTIAL_ALLOC_PAGES_RELEASE: f64 = 0.1;

pub struct TryGetResult {
    pub tracker: TrackerId,
    pub page: PageId,
    pub from_released: bool,
}

/// Huge-page counts per pool kind. Arrays are indexed sparse (0), dense
/// (1), combined (2).
#[derive(Clone, Copy, Debug, Default)]
pub struct HugePageFillerStats {
    pub n_fully_released: [HugeLength; 3],
    pub n_partial_released: [HugeLength; 3],
    pub n_released: [HugeLength; 3],
    pub n_total: [HugeLength; 3],
    pub n_full: [HugeLength; 3],
    pub n_partial: [HugeLength; 3],
}

/// Release-candidate key: fewer used pages first, sparse before dense.
/// Ordering ignores the id.
struct Candidate {
    used: Length,
    dense: bool,
    id: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.used == other.used && self.dense == other.dense
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.used, self.dense).cmp(&(other.used, other.dense))
    }
}

/// Packs page-run allocations into partially-filled huge pages.
///
/// Allocation policy in brief: prefer already-used huge pages over freshly
/// donated ones, prefer both over subreleased ones, and within a pool
/// prefer the huge page with the shortest longest-free-range, breaking
/// ties toward more existing allocations. Fragmentation stays bounded and
/// lightly-used huge pages drain so they can be returned whole.
///
/// Trackers are binned by `(longest free range, quantized allocation
/// count)`; a bitmap over bins finds the least bin able to serve a request
/// in O(1). All calls require the external page-heap lock.
pub struct HugePageFiller<U: Unback> {
    chunks_per_alloc: usize,
    allocs_option: FillerAllocsOption,

    slab: TrackerSlab,
    /// Huge pages from which nothing has been returned to the OS.
    regular_alloc: [HintedTrackerLists; 2],
    /// Donated huge pages; only ever serves sparse allocations.
    donated_alloc: HintedTrackerLists,
    /// Subreleased huge pages that still have backed-but-free pages.
    regular_alloc_partial_released: [HintedTrackerLists; 2],
    /// Subreleased huge pages whose pages are all either allocated or
    /// returned to the OS.
    regular_alloc_released: [HintedTrackerLists; 2],

    /// Used pages on trackers in `regular_alloc_released`.
    n_used_released: [Length; 2],
    /// Used pages on trackers in `regular_alloc_partial_released`.
    n_used_partial_released: [Length; 2],
    /// Huge pages that were subreleased at some point but later refilled.
    n_was_released: [HugeLength; 2],

    size: HugeLength,
    pages_allocated: [Length; 2],
    unmapped: Length,
    /// Pages eagerly unbacked (while draining released huge pages) but not
    /// yet credited to a `release_pages` call.
    unmapping_unaccounted: Length,

    subrelease_stats: SubreleaseStats,
    fillerstats_tracker: FillerStatsTracker,
    unback: U,
}

impl<U: Unback> HugePageFiller<U> {
    pub fn new(allocs_option: FillerAllocsOption, chunks_per_alloc: usize, unback: U) -> Self {
        Self::with_clock(Clock::system(), allocs_option, chunks_per_alloc, unback)
    }

    /// For testing with a mock clock.
    pub fn with_clock(
        clock: Clock,
        allocs_option: FillerAllocsOption,
        chunks_per_alloc: usize,
        unback: U,
    ) -> Self {
        assert!(chunks_per_alloc > 0 && chunks_per_alloc <= MAX_CHUNKS_PER_ALLOC);
        // One bin per (longest free range, chunk) pair; the longest free
        // range of a tracker in the filler may be anywhere in [0, P].
        let num_lists = (PAGES_PER_HUGE_PAGE + 1) * chunks_per_alloc;
        Self {
            chunks_per_alloc,
            allocs_option,
            slab: TrackerSlab::new(),
            regular_alloc: [
                HintedTrackerLists::new(num_lists),
                HintedTrackerLists::new(num_lists),
            ],
            donated_alloc: HintedTrackerLists::new(PAGES_PER_HUGE_PAGE + 1),
            regular_alloc_partial_released: [
                HintedTrackerLists::new(num_lists),
                HintedTrackerLists::new(num_lists),
            ],
            regular_alloc_released: [
                HintedTrackerLists::new(num_lists),
                HintedTrackerLists::new(num_lists),
            ],
            n_used_released: [Length::new(0); 2],
            n_used_partial_released: [Length::new(0); 2],
            n_was_released: [HugeLength::new(0); 2],
            size: HugeLength::new(0),
            pages_allocated: [Length::new(0); 2],
            unmapped: Length::new(0),
            unmapping_unaccounted: Length::new(0),
            subrelease_stats: SubreleaseStats::default(),
            fillerstats_tracker: FillerStatsTracker::new(
                clock,
                Duration::from_secs(600),
                Duration::from_secs(300),
                600,
            ),
            unback,
        }
    }

    /// Allocate `n` pages from the best-fit huge page, or `None` if no
    /// tracked huge page has a free run of `n` pages. Callers are expected
    /// to obtain a new huge page and `contribute` it on failure.
    pub fn try_get(&mut self, n: Length, span_alloc_info: SpanAllocInfo) -> Option<TryGetResult> {
        assert!(n > Length::new(0));
        debug_assert!(n.raw_num() <= PAGES_PER_HUGE_PAGE);

        let density = self.density_for(span_alloc_info.density);
        let (id, was_released) = self.select_tracker(n, density)?;

        debug_assert!(self.slab.tracker(id).longest_free_range() >= n);
        // A dense-pool hit implies the tracker is dense (and thus not
        // donated).
        debug_assert!(density == SPARSE || self.slab.tracker(id).has_dense_spans());

        let page_allocation = self.slab.tracker_mut(id).get(n);
        self.add_to_filler_list(id);
        self.pages_allocated[density] += n;

        // A released huge page about to be full again: latch that it
        // toggled back.
        if was_released {
            let pt = self.slab.tracker(id);
            if !pt.released() && !pt.was_released() {
                self.slab.tracker_mut(id).set_was_released(true);
                self.n_was_released[density] += HugeLength::new(1);
            }
        }

        debug_assert!(was_released || page_allocation.previously_unbacked == Length::new(0));
        debug_assert!(self.unmapped >= page_allocation.previously_unbacked);
        self.unmapped -= page_allocation.previously_unbacked;
        debug_assert!(!self.slab.tracker(id).donated());
        self.update_filler_stats_tracker();

        Some(TryGetResult {
            tracker: TrackerId(id),
            page: page_allocation.page,
            from_released: was_released,
        })
    }

    /// Free `[p, p + n)` back into the tracker. Returns the tracker itself
    /// when the huge page became entirely free; the caller then owns it
    /// (typically returning the huge page upstream).
    ///
    /// Draining a partially-released huge page unbacks its remaining
    /// backed tail through [`Unback::unback_unlocked`]; see that method for
    /// the locking contract.
    pub fn put(&mut self, id: TrackerId, p: PageId, n: Length) -> Option<PageTracker> {
        let id = id.0;
        self.remove_from_filler_list(id);
        self.slab.tracker_mut(id).put(p, n);

        let density = if self.slab.tracker(id).has_dense_spans() {
            DENSE
        } else {
            SPARSE
        };
        debug_assert!(self.pages_allocated[density] >= n);
        self.pages_allocated[density] -= n;

        if self.slab.tracker(id).longest_free_range() == Length::new(PAGES_PER_HUGE_PAGE) {
            debug_assert_eq!(self.slab.tracker(id).nallocs(), 0);
            self.size -= HugeLength::new(1);

            if self.slab.tracker(id).released() {
                let free_pages = self.slab.tracker(id).free_pages();
                let released_pages = self.slab.tracker(id).released_pages();
                debug_assert!(free_pages >= released_pages);
                debug_assert!(self.unmapped >= released_pages);
                self.unmapped -= released_pages;

                if free_pages > released_pages {
                    // The huge page is only partially released, but from
                    // here on the rest of the allocator works in whole huge
                    // pages. Unback the backed remainder now so the
                    // tracker's state need not be retained.
                    let addr = self.slab.tracker(id).location().start_addr();
                    if self.unback.unback_unlocked(addr, HUGE_PAGE_SIZE) {
                        self.unmapping_unaccounted += free_pages - released_pages;
                    }
                }
            }

            if self.slab.tracker(id).was_released() {
                self.slab.tracker_mut(id).set_was_released(false);
                self.n_was_released[density] -= HugeLength::new(1);
            }

            self.update_filler_stats_tracker();
            return Some(self.slab.remove(id));
        }

        self.add_to_filler_list(id);
        self.update_filler_stats_tracker();
        None
    }

    /// Hand a tracker to the filler. A donated tracker is the tail of a
    /// multi-huge-page allocation and is kept on a separate pool that is
    /// only consumed once the regular pools are exhausted.
    pub fn contribute(
        &mut self,
        pt: PageTracker,
        donated: bool,
        span_alloc_info: SpanAllocInfo,
    ) -> TrackerId {
        // A contributed huge page must not already be subreleased.
        assert!(pt.released_pages() == Length::new(0));

        let density = self.density_for(span_alloc_info.density);
        assert!(!(density == DENSE && donated));
        self.pages_allocated[density] += pt.used_pages();

        let id = self.slab.insert(pt);
        if donated {
            debug_assert!(self.slab.tracker(id).was_donated());
            self.donate_to_filler_list(id);
        } else {
            if density == DENSE {
                self.slab.tracker_mut(id).set_has_dense_spans();
            }
            self.add_to_filler_list(id);
        }

        self.size += HugeLength::new(1);
        self.update_filler_stats_tracker();
        TrackerId(id)
    }

    /// Release up to `desired` free pages to the OS by subreleasing from
    /// the emptiest huge pages, preferring ones already partially released.
    /// The target may be reduced by the skip-subrelease policy (disabled
    /// when all `intervals` are zero, or when `hit_limit` signals memory
    /// pressure), and the release may overshoot it by up to one huge page's
    /// worth of free runs.
    pub fn release_pages(
        &mut self,
        mut desired: Length,
        intervals: SkipSubreleaseIntervals,
        release_partial_alloc_pages: bool,
        hit_limit: bool,
    ) -> Length {
        let mut total_released = Length::new(0);

        // Releasing all free pages in partial allocs is disabled under
        // memory-limit pressure; the plain target serves better there.
        let release_all_from_partial_allocs = release_partial_alloc_pages && !hit_limit;
        if release_all_from_partial_allocs {
            let from_partial = (PARTIAL_ALLOC_PAGES_RELEASE
                * self.free_pages_in_partial_allocs().raw_num() as f64)
                as usize;
            desired = std::cmp::max(desired, Length::new(from_partial));
        }

        // Eagerly claim credit for unbacking already done while draining
        // released huge pages.
        if self.unmapping_unaccounted.raw_num() > 0 {
            let n = self.unmapping_unaccounted;
            self.unmapping_unaccounted = Length::new(0);
            self.subrelease_stats.num_pages_subreleased += n;
            total_released += n;
        }

        if total_released >= desired {
            return total_released;
        }

        // Skip-subrelease never applies when the limit was hit; OOM may be
        // imminent.
        if intervals.skip_subrelease_enabled() && !hit_limit {
            desired = self.get_desired_subrelease_pages(desired, total_released, intervals);
            if desired <= total_released {
                return total_released;
            }
        }

        self.subrelease_stats.set_limit_hit(hit_limit);

        // First pass: huge pages that are already partially released. The
        // first `chunks_per_alloc` bins hold full huge pages and are
        // skipped.
        while total_released < desired {
            let mut candidates = BinaryHeap::new();
            self.select_candidates(
                &mut candidates,
                &self.regular_alloc_partial_released[SPARSE],
                self.chunks_per_alloc,
            );
            self.select_candidates(
                &mut candidates,
                &self.regular_alloc_partial_released[DENSE],
                self.chunks_per_alloc,
            );

            let released = self.release_candidates(candidates, desired - total_released);
            self.subrelease_stats.num_partial_alloc_pages_subreleased += released;
            if released == Length::new(0) {
                break;
            }
            total_released += released;
        }

        // Second pass: break up whole huge pages, sparse pools first (they
        // are expected to drain earlier), donated last.
        while total_released < desired {
            let mut candidates = BinaryHeap::new();
            self.select_candidates(
                &mut candidates,
                &self.regular_alloc[SPARSE],
                self.chunks_per_alloc,
            );
            self.select_candidates(
                &mut candidates,
                &self.regular_alloc[DENSE],
                self.chunks_per_alloc,
            );
            self.select_candidates(&mut candidates, &self.donated_alloc, 0);

            let released = self.release_candidates(candidates, desired - total_released);
            if released == Length::new(0) {
                break;
            }
            total_released += released;
        }

        total_released
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> HugeLength {
        self.size
    }

    #[must_use]
    pub fn pages_allocated_for(&self, density: AccessDensityPrediction) -> Length {
        self.pages_allocated[density as usize]
    }

    #[inline]
    #[must_use]
    pub fn pages_allocated(&self) -> Length {
        self.pages_allocated[SPARSE] + self.pages_allocated[DENSE]
    }

    #[inline]
    #[must_use]
    pub fn used_pages(&self) -> Length {
        self.pages_allocated()
    }

    #[inline]
    #[must_use]
    pub fn unmapped_pages(&self) -> Length {
        self.unmapped
    }

    #[inline]
    #[must_use]
    pub fn free_pages(&self) -> Length {
        self.size.in_pages() - self.used_pages() - self.unmapped
    }

    #[must_use]
    pub fn used_pages_in_released(&self) -> Length {
        self.n_used_released[SPARSE] + self.n_used_released[DENSE]
    }

    #[must_use]
    pub fn used_pages_in_partial_released(&self) -> Length {
        self.n_used_partial_released[SPARSE] + self.n_used_partial_released[DENSE]
    }

    #[must_use]
    pub fn used_pages_in_any_subreleased(&self) -> Length {
        self.used_pages_in_released() + self.used_pages_in_partial_released()
    }

    /// Huge pages that were subreleased at some point, then became full
    /// again.
    #[must_use]
    pub fn previously_released_huge_pages(&self) -> HugeLength {
        self.n_was_released[SPARSE] + self.n_was_released[DENSE]
    }

    /// Free (backed) pages on huge pages that have been subreleased.
    #[must_use]
    pub fn free_pages_in_partial_allocs(&self) -> Length {
        let subreleased_pages = HugeLength::new(
            self.regular_alloc_partial_released[SPARSE].size()
                + self.regular_alloc_partial_released[DENSE].size()
                + self.regular_alloc_released[SPARSE].size()
                + self.regular_alloc_released[DENSE].size(),
        )
        .in_pages();
        subreleased_pages - self.used_pages_in_any_subreleased() - self.unmapped_pages()
    }

    /// Fraction of used pages on huge pages that have not been broken up,
    /// and thus remain eligible for transparent-huge-page backing.
    #[must_use]
    pub fn hugepage_frac(&self) -> f64 {
        let used = self.used_pages();
        let used_on_released = self.used_pages_in_any_subreleased();
        debug_assert!(used >= used_on_released);
        let used_on_huge = used - used_on_released;
        let denom = if used > Length::new(0) {
            used
        } else {
            Length::new(1)
        };
        safe_div_lengths(used_on_huge, denom).clamp(0.0, 1.0)
    }

    #[inline]
    #[must_use]
    pub fn subrelease_stats(&self) -> SubreleaseStats {
        self.subrelease_stats
    }

    #[must_use]
    pub fn tracker(&self, id: TrackerId) -> &PageTracker {
        self.slab.tracker(id.0)
    }

    #[cfg(test)]
    pub(crate) fn fillerstats_tracker(&self) -> &FillerStatsTracker {
        &self.fillerstats_tracker
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.size.in_bytes(),
            free_bytes: self.free_pages().in_bytes(),
            unmapped_bytes: self.unmapped_pages().in_bytes(),
        }
    }

    #[must_use]
    pub fn get_stats(&self) -> HugePageFillerStats {
        let mut stats = HugePageFillerStats::default();

        // Full huge pages sit in the longest-free-0 bins.
        for chunk in 0..self.chunks_per_alloc {
            let i = self.list_for(Length::new(0), chunk);
            stats.n_full[SPARSE] += HugeLength::new(self.regular_alloc[SPARSE].len_of(i));
            stats.n_full[DENSE] += HugeLength::new(self.regular_alloc[DENSE].len_of(i));
        }
        stats.n_full[BOTH] = stats.n_full[SPARSE] + stats.n_full[DENSE];

        // Donated huge pages only serve sparse allocations.
        stats.n_total[SPARSE] = HugeLength::new(self.donated_alloc.size());
        for density in [SPARSE, DENSE] {
            stats.n_fully_released[density] =
                HugeLength::new(self.regular_alloc_released[density].size());
            stats.n_partial_released[density] =
                HugeLength::new(self.regular_alloc_partial_released[density].size());
            stats.n_released[density] =
                stats.n_fully_released[density] + stats.n_partial_released[density];
            stats.n_total[density] +=
                stats.n_released[density] + HugeLength::new(self.regular_alloc[density].size());
            stats.n_partial[density] =
                stats.n_total[density] - stats.n_released[density] - stats.n_full[density];
        }

        stats.n_fully_released[BOTH] =
            stats.n_fully_released[SPARSE] + stats.n_fully_released[DENSE];
        stats.n_partial_released[BOTH] =
            stats.n_partial_released[SPARSE] + stats.n_partial_released[DENSE];
        stats.n_released[BOTH] = stats.n_released[SPARSE] + stats.n_released[DENSE];
        stats.n_total[BOTH] = self.size();
        stats.n_partial[BOTH] = self.size() - stats.n_released[BOTH] - stats.n_full[BOTH];
        stats
    }

    pub fn add_span_stats(
        &self,
        mut small: Option<&mut SmallSpanStats>,
        mut large: Option<&mut LargeSpanStats>,
    ) {
        let mut visit = |id: u32| {
            self.slab
                .tracker(id)
                .add_span_stats(small.as_deref_mut(), large.as_deref_mut());
        };
        self.donated_alloc.iter(&self.slab, 0, &mut visit);
        for density in [DENSE, SPARSE] {
            // The first chunks_per_alloc bins are full huge pages with no
            // free spans to report.
            self.regular_alloc[density].iter(&self.slab, self.chunks_per_alloc, &mut visit);
            self.regular_alloc_partial_released[density].iter(&self.slab, 0, &mut visit);
            self.regular_alloc_released[density].iter(&self.slab, 0, &mut visit);
        }
    }

    pub fn print(&self, out: &mut dyn fmt::Write, everything: bool) -> fmt::Result {
        writeln!(out, "HugePageFiller: densely pack small requests into hugepages")?;
        let stats = self.get_stats();

        // A full donated huge page would never have been donated.
        debug_assert_eq!(self.donated_alloc.len_of(0), 0);

        writeln!(
            out,
            "HugePageFiller: Overall, {} total, {} full, {} partial, {} released ({} partially)",
            self.size().raw_num(),
            stats.n_full[BOTH].raw_num(),
            stats.n_partial[BOTH].raw_num(),
            stats.n_released[BOTH].raw_num(),
            stats.n_partial_released[BOTH].raw_num()
        )?;
        for (density, name) in [(SPARSE, "sparsely"), (DENSE, "densely")] {
            writeln!(
                out,
                "HugePageFiller: those with {name}-accessed spans, {} total, {} full, \
                 {} partial, {} released ({} partially)",
                stats.n_total[density].raw_num(),
                stats.n_full[density].raw_num(),
                stats.n_partial[density].raw_num(),
                stats.n_released[density].raw_num(),
                stats.n_partial_released[density].raw_num()
            )?;
        }

        writeln!(
            out,
            "HugePageFiller: {} pages free in {} hugepages, {:.4} free",
            self.free_pages().raw_num(),
            self.size().raw_num(),
            safe_div_lengths(self.free_pages(), self.size().in_pages())
        )?;

        let n_nonfull = stats.n_partial[BOTH] + stats.n_partial_released[BOTH];
        debug_assert!(self.free_pages() <= n_nonfull.in_pages());
        writeln!(
            out,
            "HugePageFiller: among non-fulls, {:.4} free",
            safe_div_lengths(self.free_pages(), n_nonfull.in_pages())
        )?;

        writeln!(
            out,
            "HugePageFiller: {} used pages in subreleased hugepages ({} of them in partially \
             released)",
            self.used_pages_in_any_subreleased().raw_num(),
            self.used_pages_in_partial_released().raw_num()
        )?;
        writeln!(
            out,
            "HugePageFiller: {} hugepages partially released, {:.4} released",
            stats.n_released[BOTH].raw_num(),
            safe_div_lengths(self.unmapped_pages(), stats.n_released[BOTH].in_pages())
        )?;
        writeln!(
            out,
            "HugePageFiller: {:.4} of used pages hugepageable",
            self.hugepage_frac()
        )?;
        writeln!(
            out,
            "HugePageFiller: {} hugepages were previously released, but later became full.",
            self.previously_released_huge_pages().raw_num()
        )?;

        writeln!(
            out,
            "HugePageFiller: Since startup, {} pages subreleased, {} hugepages broken, ({} \
             pages, {} hugepages due to reaching limit)",
            self.subrelease_stats.total_pages_subreleased.raw_num(),
            self.subrelease_stats.total_hugepages_broken.raw_num(),
            self.subrelease_stats
                .total_pages_subreleased_due_to_limit
                .raw_num(),
            self.subrelease_stats
                .total_hugepages_broken_due_to_limit
                .raw_num()
        )?;

        if !everything {
            return Ok(());
        }

        let usage = self.collect_usage_info();
        writeln!(out)?;
        writeln!(out, "HugePageFiller: fullness histograms")?;
        usage.print(out)?;

        writeln!(out)?;
        self.fillerstats_tracker.print(out)
    }

    pub fn print_in_pbtxt(&self, hpaa: &mut PbtxtRegion<'_>) -> fmt::Result {
        let stats = self.get_stats();
        debug_assert_eq!(self.donated_alloc.len_of(0), 0);

        hpaa.print_i64("filler_full_huge_pages", stats.n_full[BOTH].raw_num() as i64)?;
        hpaa.print_i64(
            "filler_partial_huge_pages",
            stats.n_partial[BOTH].raw_num() as i64,
        )?;
        hpaa.print_i64(
            "filler_released_huge_pages",
            stats.n_released[BOTH].raw_num() as i64,
        )?;
        hpaa.print_i64(
            "filler_partially_released_huge_pages",
            stats.n_partial_released[BOTH].raw_num() as i64,
        )?;

        for (density, field) in [
            (SPARSE, "filler_sparsely_accessed_alloc_stats"),
            (DENSE, "filler_densely_accessed_alloc_stats"),
        ] {
            hpaa.sub_region(field, |r| {
                r.print_i64("full_huge_pages", stats.n_full[density].raw_num() as i64)?;
                r.print_i64("partial_huge_pages", stats.n_partial[density].raw_num() as i64)?;
                r.print_i64(
                    "released_huge_pages",
                    stats.n_released[density].raw_num() as i64,
                )?;
                r.print_i64(
                    "partially_released_huge_pages",
                    stats.n_partial_released[density].raw_num() as i64,
                )
            })?;
        }

        hpaa.print_i64("filler_free_pages", self.free_pages().raw_num() as i64)?;
        hpaa.print_i64(
            "filler_used_pages_in_subreleased",
            self.used_pages_in_any_subreleased().raw_num() as i64,
        )?;
        hpaa.print_i64(
            "filler_used_pages_in_partial_released",
            self.used_pages_in_partial_released().raw_num() as i64,
        )?;
        hpaa.print_i64(
            "filler_unmapped_bytes",
            (stats.n_released[BOTH].raw_num() as f64
                * safe_div_lengths(self.unmapped_pages(), stats.n_released[BOTH].in_pages()))
                as i64,
        )?;
        hpaa.print_i64(
            "filler_hugepageable_used_bytes",
            (self.hugepage_frac()
                * (self.pages_allocated[SPARSE].in_bytes() + self.pages_allocated[DENSE].in_bytes())
                    as f64) as i64,
        )?;
        hpaa.print_i64(
            "filler_previously_released_huge_pages",
            self.previously_released_huge_pages().raw_num() as i64,
        )?;
        hpaa.print_i64(
            "filler_num_pages_subreleased",
            self.subrelease_stats.total_pages_subreleased.raw_num() as i64,
        )?;
        hpaa.print_i64(
            "filler_num_hugepages_broken",
            self.subrelease_stats.total_hugepages_broken.raw_num() as i64,
        )?;
        hpaa.print_i64(
            "filler_num_pages_subreleased_due_to_limit",
            self.subrelease_stats
                .total_pages_subreleased_due_to_limit
                .raw_num() as i64,
        )?;
        hpaa.print_i64(
            "filler_num_hugepages_broken_due_to_limit",
            self.subrelease_stats
                .total_hugepages_broken_due_to_limit
                .raw_num() as i64,
        )?;

        let usage = self.collect_usage_info();
        usage.print_in_pbtxt(hpaa)?;

        self.fillerstats_tracker.print_in_pbtxt(hpaa)
    }

    /// Resolve the pool density for a request.
    fn density_for(&self, density: AccessDensityPrediction) -> usize {
        if self.allocs_option == FillerAllocsOption::SeparateAllocs
            && density == AccessDensityPrediction::Dense
        {
            DENSE
        } else {
            SPARSE
        }
    }

    /// Resolve the pool density of a tracker already in the filler.
    fn density_of(&self, pt: &PageTracker) -> usize {
        if self.allocs_option == FillerAllocsOption::SeparateAllocs && pt.has_dense_spans() {
            DENSE
        } else {
            SPARSE
        }
    }

    /// Quantized allocation count: `chunks_per_alloc - 1` for a single
    /// allocation, decreasing logarithmically toward 0 for many. Trackers
    /// with many allocations bin earlier, and earlier bins are preferred,
    /// because (to first order) allocations of any size are equally likely
    /// to be freed: a huge page holding many of them empties out later.
    fn index_for(&self, pt: &PageTracker) -> usize {
        // A tracker with no allocations quantizes like a single allocation.
        let na = std::cmp::max(pt.nallocs(), 1);
        // 63 - ceil(log2(na))
        let neg_ceil_log = (2 * na - 1).leading_zeros() as usize;
        // Spread over [0, chunks_per_alloc), clamped at the left edge, by
        // pinning na == 1 to chunks_per_alloc - 1.
        let offset = (1usize).leading_zeros() as usize - (self.chunks_per_alloc - 1);
        let i = std::cmp::max(neg_ceil_log, offset) - offset;
        debug_assert!(i < self.chunks_per_alloc);
        i
    }

    fn list_for(&self, longest: Length, chunk: usize) -> usize {
        debug_assert!(chunk < self.chunks_per_alloc);
        debug_assert!(longest.raw_num() <= PAGES_PER_HUGE_PAGE);
        longest.raw_num() * self.chunks_per_alloc + chunk
    }

    fn select_tracker(&mut self, n: Length, density: usize) -> Option<(u32, bool)> {
        let bound = n.raw_num() * self.chunks_per_alloc;

        if let Some(id) = self.regular_alloc[density].get_least(&mut self.slab, bound) {
            debug_assert!(!self.slab.tracker(id).donated());
            return Some((id, false));
        }
        // Donated huge pages are consumed only after the regulars are
        // exhausted, so they stay reassemblable; they never serve dense
        // spans.
        if density == SPARSE {
            if let Some(id) = self.donated_alloc.get_least(&mut self.slab, n.raw_num()) {
                return Some((id, false));
            }
        }
        if let Some(id) =
            self.regular_alloc_partial_released[density].get_least(&mut self.slab, bound)
        {
            debug_assert!(!self.slab.tracker(id).donated());
            let used = self.slab.tracker(id).used_pages();
            debug_assert!(self.n_used_partial_released[density] >= used);
            self.n_used_partial_released[density] -= used;
            return Some((id, true));
        }
        if let Some(id) = self.regular_alloc_released[density].get_least(&mut self.slab, bound) {
            debug_assert!(!self.slab.tracker(id).donated());
            let used = self.slab.tracker(id).used_pages();
            debug_assert!(self.n_used_released[density] >= used);
            self.n_used_released[density] -= used;
            return Some((id, true));
        }
        None
    }

    fn remove_from_filler_list(&mut self, id: u32) {
        let (longest, donated) = {
            let pt = self.slab.tracker(id);
            (pt.longest_free_range(), pt.donated())
        };

        if donated {
            self.donated_alloc
                .remove(&mut self.slab, id, longest.raw_num());
            return;
        }

        let (chunk, density, used, released, fully_released) = {
            let pt = self.slab.tracker(id);
            (
                self.index_for(pt),
                self.density_of(pt),
                pt.used_pages(),
                pt.released(),
                pt.free_pages() <= pt.released_pages(),
            )
        };
        let i = self.list_for(longest, chunk);

        if !released {
            self.regular_alloc[density].remove(&mut self.slab, id, i);
        } else if fully_released {
            self.regular_alloc_released[density].remove(&mut self.slab, id, i);
            debug_assert!(self.n_used_released[density] >= used);
            self.n_used_released[density] -= used;
        } else {
            self.regular_alloc_partial_released[density].remove(&mut self.slab, id, i);
            debug_assert!(self.n_used_partial_released[density] >= used);
            self.n_used_partial_released[density] -= used;
        }
    }

    fn add_to_filler_list(&mut self, id: u32) {
        // Once a donated huge page is used in any way it degenerates into a
        // regular one. The algorithm keeps filling it (we were desperate
        // enough to touch it), which preserves the other donated pages.
        self.slab.tracker_mut(id).set_donated(false);

        let (longest, chunk, density, used, released, fully_released) = {
            let pt = self.slab.tracker(id);
            (
                pt.longest_free_range(),
                self.index_for(pt),
                self.density_of(pt),
                pt.used_pages(),
                pt.released(),
                pt.free_pages() <= pt.released_pages(),
            )
        };
        let i = self.list_for(longest, chunk);

        if !released {
            self.regular_alloc[density].add(&mut self.slab, id, i);
        } else if fully_released {
            self.regular_alloc_released[density].add(&mut self.slab, id, i);
            self.n_used_released[density] += used;
        } else {
            self.regular_alloc_partial_released[density].add(&mut self.slab, id, i);
            self.n_used_partial_released[density] += used;
        }
    }

    fn donate_to_filler_list(&mut self, id: u32) {
        let longest = {
            let pt = self.slab.tracker(id);
            // Already-released trackers are never donated.
            debug_assert!(!pt.released());
            pt.longest_free_range()
        };
        self.slab.tracker_mut(id).set_donated(true);
        self.donated_alloc.add(&mut self.slab, id, longest.raw_num());
    }

    /// Bounded top-K selection of release candidates from one tracker
    /// list: keep the `CANDIDATES_FOR_RELEASING_MEMORY` most releasable
    /// (fewest used pages, sparse before dense).
    fn select_candidates(
        &self,
        candidates: &mut BinaryHeap<Candidate>,
        list: &HintedTrackerLists,
        start: usize,
    ) {
        list.iter(&self.slab, start, |id| {
            let pt = self.slab.tracker(id);
            debug_assert!(pt.free_pages() > Length::new(0));
            debug_assert!(pt.free_pages() > pt.released_pages());
            let candidate = Candidate {
                used: pt.used_pages(),
                dense: pt.has_dense_spans(),
                id,
            };
            if candidates.len() < CANDIDATES_FOR_RELEASING_MEMORY {
                candidates.push(candidate);
            } else if let Some(worst_kept) = candidates.peek() {
                // The heap top is the least releasable kept candidate;
                // replace it if this tracker releases better.
                if candidate < *worst_kept {
                    candidates.pop();
                    candidates.push(candidate);
                }
            }
        });
    }

    /// Subrelease from candidates, most releasable first, until `target`
    /// pages have been returned or candidates run out.
    fn release_candidates(&mut self, candidates: BinaryHeap<Candidate>, target: Length) -> Length {
        let sorted = candidates.into_sorted_vec();

        let mut total_released = Length::new(0);
        let mut total_broken = HugeLength::new(0);
        #[cfg(debug_assertions)]
        let mut last = Length::new(0);

        for candidate in sorted {
            if total_released >= target {
                break;
            }
            let id = candidate.id;
            {
                let pt = self.slab.tracker(id);
                debug_assert!(pt.free_pages() > Length::new(0));
                debug_assert!(pt.free_pages() > pt.released_pages());
                #[cfg(debug_assertions)]
                {
                    debug_assert!(last <= pt.used_pages());
                    last = pt.used_pages();
                }
                if pt.unbroken() {
                    total_broken += HugeLength::new(1);
                }
            }

            self.remove_from_filler_list(id);
            let released = self.slab.tracker_mut(id).release_free(&mut self.unback);
            self.unmapped += released;
            debug_assert!(self.unmapped >= self.slab.tracker(id).released_pages());
            total_released += released;
            self.add_to_filler_list(id);
        }

        self.subrelease_stats.num_pages_subreleased += total_released;
        self.subrelease_stats.num_hugepages_broken += total_broken;

        // Separate cumulative accounting when the release was forced by a
        // memory limit.
        if self.subrelease_stats.limit_hit() {
            self.subrelease_stats.total_pages_subreleased_due_to_limit += total_released;
            self.subrelease_stats.total_hugepages_broken_due_to_limit += total_broken;
        }
        total_released
    }

    /// Reduce the release target when recent demand history predicts the
    /// memory will be needed again soon. Mapped pages are not allowed to
    /// drop below the demand requirement; free memory beyond it may still
    /// be subreleased.
    fn get_desired_subrelease_pages(
        &mut self,
        desired: Length,
        total_released: Length,
        intervals: SkipSubreleaseIntervals,
    ) -> Length {
        debug_assert!(total_released < desired);
        if !intervals.skip_subrelease_enabled() {
            return desired;
        }
        self.update_filler_stats_tracker();

        // The peak interval takes priority over the fluctuation-plus-trend
        // estimate.
        let required_pages = if intervals.is_peak_interval_set() {
            self.fillerstats_tracker
                .get_recent_peak(intervals.peak_interval)
        } else {
            self.fillerstats_tracker
                .get_recent_demand(intervals.short_interval, intervals.long_interval)
        };

        let current_pages = self.used_pages() + self.free_pages();

        if required_pages != Length::new(0) {
            let new_desired = if required_pages >= current_pages {
                total_released
            } else {
                total_released + (current_pages - required_pages)
            };

            if new_desired >= desired {
                return desired;
            }

            // Pages not released due to this policy, never counting more
            // than the free pages the policy actually withheld.
            let releasable_pages = std::cmp::min(self.free_pages(), new_desired - total_released);
            let skipped_pages = std::cmp::min(
                self.free_pages() - releasable_pages,
                desired - new_desired,
            );
            self.fillerstats_tracker.report_skipped_subrelease_pages(
                skipped_pages,
                std::cmp::min(current_pages, required_pages),
            );
            return new_desired;
        }

        desired
    }

    fn update_filler_stats_tracker(&mut self) {
        let mut stats = FillerStats {
            num_pages: self.pages_allocated(),
            free_pages: self.free_pages(),
            unmapped_pages: self.unmapped_pages(),
            used_pages_in_subreleased_huge_pages: self.used_pages_in_any_subreleased(),
            ..FillerStats::default()
        };
        stats.huge_pages[FillerPool::Donated as usize] =
            HugeLength::new(self.donated_alloc.size());
        for density in [DENSE, SPARSE] {
            stats.huge_pages[FillerPool::Regular as usize] +=
                HugeLength::new(self.regular_alloc[density].size());
            stats.huge_pages[FillerPool::PartialReleased as usize] +=
                HugeLength::new(self.regular_alloc_partial_released[density].size());
            stats.huge_pages[FillerPool::Released as usize] +=
                HugeLength::new(self.regular_alloc_released[density].size());
        }
        stats.num_pages_subreleased = self.subrelease_stats.num_pages_subreleased;
        stats.num_partial_alloc_pages_subreleased =
            self.subrelease_stats.num_partial_alloc_pages_subreleased;
        stats.num_hugepages_broken = self.subrelease_stats.num_hugepages_broken;
        self.fillerstats_tracker.report(stats);
        self.subrelease_stats.reset();
    }

    fn collect_usage_info(&self) -> UsageInfo {
        let mut usage = UsageInfo::new();
        let mut record = |kind: TrackerKind, lists: &HintedTrackerLists| {
            lists.iter(&self.slab, 0, |id| usage.record(self.slab.tracker(id), kind));
        };
        record(TrackerKind::Donated, &self.donated_alloc);
        record(TrackerKind::SparseRegular, &self.regular_alloc[SPARSE]);
        record(TrackerKind::DenseRegular, &self.regular_alloc[DENSE]);
        record(
            TrackerKind::SparsePartialReleased,
            &self.regular_alloc_partial_released[SPARSE],
        );
        record(
            TrackerKind::DensePartialReleased,
            &self.regular_alloc_partial_released[DENSE],
        );
        record(
            TrackerKind::SparseReleased,
            &self.regular_alloc_released[SPARSE],
        );
        record(
            TrackerKind::DenseReleased,
            &self.regular_alloc_released[DENSE],
        );
        usage
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TrackerKind {
    SparseRegular,
    DenseRegular,
    Donated,
    SparsePartialReleased,
    DensePartialReleased,
    SparseReleased,
    DenseReleased,
}

const NUM_TRACKER_KINDS: usize = 7;

const TRACKER_KINDS: [TrackerKind; NUM_TRACKER_KINDS] = [
    TrackerKind::SparseRegular,
    TrackerKind::DenseRegular,
    TrackerKind::Donated,
    TrackerKind::SparsePartialReleased,
    TrackerKind::DensePartialReleased,
    TrackerKind::SparseReleased,
    TrackerKind::DenseReleased,
];

impl TrackerKind {
    fn describe(self) -> &'static str {
        match self {
            TrackerKind::SparseRegular => "sparsely-accessed regular",
            TrackerKind::DenseRegular => "densely-accessed regular",
            TrackerKind::Donated => "donated",
            TrackerKind::SparsePartialReleased => "sparsely-accessed partial released",
            TrackerKind::DensePartialReleased => "densely-accessed partial released",
            TrackerKind::SparseReleased => "sparsely-accessed released",
            TrackerKind::DenseReleased => "densely-accessed released",
        }
    }

    fn alloc_type(self) -> &'static str {
        match self {
            TrackerKind::SparseRegular | TrackerKind::DenseRegular => "REGULAR",
            TrackerKind::Donated => "DONATED",
            TrackerKind::SparsePartialReleased | TrackerKind::DensePartialReleased => "PARTIAL",
            TrackerKind::SparseReleased | TrackerKind::DenseReleased => "RELEASED",
        }
    }

    fn object_type(self) -> &'static str {
        match self {
            TrackerKind::SparseRegular
            | TrackerKind::Donated
            | TrackerKind::SparsePartialReleased
            | TrackerKind::SparseReleased => "SPARSELY_ACCESSED",
            TrackerKind::DenseRegular
            | TrackerKind::DensePartialReleased
            | TrackerKind::DenseReleased => "DENSELY_ACCESSED",
        }
    }
}

/// Fullness histograms per tracker kind. Nearly empty and nearly full huge
/// pages are the interesting ones, so there are four single-page buckets at
/// each end with 16 even buckets between.
const BUCKET_CAPACITY: usize = 4 + 16 + 4;

struct UsageInfo {
    bucket_bounds: [usize; BUCKET_CAPACITY],
    buckets_size: usize,
    free_page_histo: [[usize; BUCKET_CAPACITY]; NUM_TRACKER_KINDS],
    longest_free_histo: [[usize; BUCKET_CAPACITY]; NUM_TRACKER_KINDS],
    nalloc_histo: [[usize; BUCKET_CAPACITY]; NUM_TRACKER_KINDS],
}

impl UsageInfo {
    fn new() -> Self {
        let mut bucket_bounds = [0usize; BUCKET_CAPACITY];
        let mut buckets_size = 0;
        let mut i = 0;
        while i <= 4 && i < PAGES_PER_HUGE_PAGE {
            bucket_bounds[buckets_size] = i;
            buckets_size += 1;
            i += 1;
        }
        if i < PAGES_PER_HUGE_PAGE - 4 {
            let step = PAGES_PER_HUGE_PAGE / 16;
            // Round i up to the next step boundary.
            i = ((i - 1) | (step - 1)) + 1;
            while i < PAGES_PER_HUGE_PAGE - 4 {
                bucket_bounds[buckets_size] = i;
                buckets_size += 1;
                i += step;
            }
            i = PAGES_PER_HUGE_PAGE - 4;
        }
        while i < PAGES_PER_HUGE_PAGE {
            bucket_bounds[buckets_size] = i;
            buckets_size += 1;
            i += 1;
        }
        assert!(buckets_size <= BUCKET_CAPACITY);
        Self {
            bucket_bounds,
            buckets_size,
            free_page_histo: [[0; BUCKET_CAPACITY]; NUM_TRACKER_KINDS],
            longest_free_histo: [[0; BUCKET_CAPACITY]; NUM_TRACKER_KINDS],
            nalloc_histo: [[0; BUCKET_CAPACITY]; NUM_TRACKER_KINDS],
        }
    }

    fn record(&mut self, pt: &PageTracker, kind: TrackerKind) {
        let free = PAGES_PER_HUGE_PAGE - pt.used_pages().raw_num();
        let longest = pt.longest_free_range().raw_num();
        let nallocs = pt.nallocs();
        // The nallocs buckets are offset by one: nallocs is in [1, P] while
        // free pages and longest free range are in [0, P].
        let free_bucket = self.bucket_num(free.min(PAGES_PER_HUGE_PAGE - 1));
        let longest_bucket = self.bucket_num(longest.min(PAGES_PER_HUGE_PAGE - 1));
        let nalloc_bucket = self.bucket_num(nallocs.saturating_sub(1));
        let k = kind as usize;
        self.free_page_histo[k][free_bucket] += 1;
        self.longest_free_histo[k][longest_bucket] += 1;
        self.nalloc_histo[k][nalloc_bucket] += 1;
    }

    fn print(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for kind in TRACKER_KINDS {
            self.print_histo(
                out,
                &self.free_page_histo[kind as usize],
                kind,
                "hps with a<= # of free pages <b",
                0,
            )?;
        }
        // For donated huge pages the longest free range equals the free
        // page count and there is exactly one allocation, so the remaining
        // histograms skip them.
        for kind in TRACKER_KINDS {
            if kind == TrackerKind::Donated {
                continue;
            }
            self.print_histo(
                out,
                &self.longest_free_histo[kind as usize],
                kind,
                "hps with a<= longest free range <b",
                0,
            )?;
        }
        for kind in TRACKER_KINDS {
            if kind == TrackerKind::Donated {
                continue;
            }
            self.print_histo(
                out,
                &self.nalloc_histo[kind as usize],
                kind,
                "hps with a<= # of allocations <b",
                1,
            )?;
        }
        Ok(())
    }

    fn print_in_pbtxt(&self, hpaa: &mut PbtxtRegion<'_>) -> fmt::Result {
        for kind in TRACKER_KINDS {
            hpaa.sub_region("filler_tracker", |r| {
                r.print_raw("type", kind.alloc_type())?;
                r.print_raw("objects", kind.object_type())?;
                self.print_histo_pbtxt(
                    r,
                    &self.free_page_histo[kind as usize],
                    "free_pages_histogram",
                    0,
                )?;
                self.print_histo_pbtxt(
                    r,
                    &self.longest_free_histo[kind as usize],
                    "longest_free_range_histogram",
                    0,
                )?;
                self.print_histo_pbtxt(
                    r,
                    &self.nalloc_histo[kind as usize],
                    "allocations_histogram",
                    1,
                )
            })?;
        }
        Ok(())
    }

    fn bucket_num(&self, page: usize) -> usize {
        let bounds = &self.bucket_bounds[..self.buckets_size];
        let it = bounds.partition_point(|&b| b <= page);
        debug_assert!(it > 0);
        it - 1
    }

    fn print_histo(
        &self,
        out: &mut dyn fmt::Write,
        h: &[usize; BUCKET_CAPACITY],
        kind: TrackerKind,
        blurb: &str,
        offset: usize,
    ) -> fmt::Result {
        write!(out, "\nHugePageFiller: # of {} {}", kind.describe(), blurb)?;
        for i in 0..self.buckets_size {
            if i % 6 == 0 {
                write!(out, "\nHugePageFiller:")?;
            }
            write!(out, " <{:3}<={:6}", self.bucket_bounds[i] + offset, h[i])?;
        }
        writeln!(out)
    }

    fn print_histo_pbtxt(
        &self,
        region: &mut PbtxtRegion<'_>,
        h: &[usize; BUCKET_CAPACITY],
        key: &str,
        offset: usize,
    ) -> fmt::Result {
        for i in 0..self.buckets_size {
            region.sub_region(key, |hist| {
                hist.print_i64("lower_bound", (self.bucket_bounds[i] + offset) as i64)?;
                let upper = if i == self.buckets_size - 1 {
                    self.bucket_bounds[i]
                } else {
                    self.bucket_bounds[i + 1] - 1
                };
                hist.print_i64("upper_bound", (upper + offset) as i64)?;
                hist.print_i64("value", h[i] as i64)
            })?;
        }
        Ok(())
    }
}
