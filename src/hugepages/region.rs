//! A fixed-size run of many huge pages, backed lazily on first touch, for
//! allocations too large for the filler but too small to round up to whole
//! huge pages without unacceptable fragmentation.

use std::fmt;

use super::bitmap::RangeTracker;
use super::clock::Clock;
use super::pages::{
    HugeLength, HugePage, HugeRange, Length, PageId, PAGES_PER_HUGE_PAGE,
};
use super::stats::{record_free_run, BackingStats, LargeSpanStats, PbtxtRegion, SmallSpanStats};
use super::vm::Unback;

/// Default region length: 512 huge pages (1 GiB).
pub const REGION_HUGE_PAGES: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HugeRegionUsageOption {
    /// Release empty huge pages as allocations are returned.
    Default,
    /// Keep empty huge pages backed on put and rely on periodic release.
    UseForAllLargeAllocs,
}

pub struct RegionAllocation {
    pub page: PageId,
    /// True iff some huge page in the returned range was just backed.
    pub from_released: bool,
}

/// Tracks allocations from a contiguous multi-huge-page range. Differs from
/// a per-huge-page tracker in that it crosses huge pages, backs them on
/// demand, and can give up empty ones individually.
pub struct HugeRegion<U: Unback> {
    tracker: RangeTracker,
    location: HugeRange,

    /// Used pages within each huge page.
    pages_used: Vec<Length>,
    backed: Vec<bool>,
    last_touched: Vec<i64>,
    nbacked: HugeLength,
    total_unbacked: HugeLength,

    clock: Clock,
    unback: U,
}

impl<U: Unback> HugeRegion<U> {
    /// `range` must be currently unbacked.
    pub fn new(range: HugeRange, clock: Clock, unback: U) -> Self {
        assert!(!range.is_empty());
        let n = range.len().raw_num();
        let now = clock.now_ticks();
        Self {
            tracker: RangeTracker::new(range.len().in_pages().raw_num()),
            location: range,
            pages_used: vec![Length::new(0); n],
            backed: vec![false; n],
            last_touched: vec![now; n],
            nbacked: HugeLength::new(0),
            total_unbacked: HugeLength::new(0),
            clock,
            unback,
        }
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> HugeLength {
        self.location.len()
    }

    /// Allocate a run of `n` free pages, backing any huge pages it touches
    /// for the first time. `from_released` reports whether backing
    /// happened. Returns `None` when no free run is long enough.
    pub fn maybe_get(&mut self, n: Length) -> Option<RegionAllocation> {
        assert!(n > Length::new(0));
        if n > self.longest_free() {
            return None;
        }
        let index = Length::new(self.tracker.find_and_mark(n.raw_num()));
        let page = self.location.start().first_page() + index;
        let from_released = self.inc(page, n);
        Some(RegionAllocation { page, from_released })
    }

    /// Return `[p, p + n)`, which must be the result of a previous
    /// `maybe_get`. If `release`, huge pages made empty by this are
    /// unbacked.
    pub fn put(&mut self, p: PageId, n: Length, release: bool) {
        let index = p - self.location.start().first_page();
        self.tracker.unmark(index.raw_num(), n.raw_num());
        self.dec(p, n, release);
    }

    /// Unback `release_fraction` (clamped to [0, 1]) of the free-but-backed
    /// huge pages, at least one. Returns the huge pages actually unbacked;
    /// a refused unback leaves its run backed and uncounted.
    pub fn release(&mut self, release_fraction: f64) -> HugeLength {
        let free_yet_backed = self.free_backed().raw_num();
        let to_release = std::cmp::max(
            (free_yet_backed as f64 * release_fraction.clamp(0.0, 1.0)) as usize,
            1,
        );

        let n = self.size().raw_num();
        let mut should_unback = vec![false; n];
        let mut marked = 0usize;
        for i in 0..n {
            if self.backed[i] && self.pages_used[i] == Length::new(0) {
                should_unback[i] = true;
                marked += 1;
            }
            if marked >= to_release {
                break;
            }
        }
        self.unback_hugepages(&should_unback)
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, p: PageId) -> bool {
        self.location.contains(p)
    }

    #[inline]
    #[must_use]
    pub fn used_pages(&self) -> Length {
        Length::new(self.tracker.used())
    }

    #[must_use]
    pub fn free_pages(&self) -> Length {
        self.size().in_pages() - self.unmapped_pages() - self.used_pages()
    }

    #[must_use]
    pub fn unmapped_pages(&self) -> Length {
        (self.size() - self.nbacked).in_pages()
    }

    #[must_use]
    pub fn backed(&self) -> HugeLength {
        self.nbacked
    }

    /// Huge pages with no allocated pages that are still backed. Nonzero
    /// between deallocation and release when puts do not auto-release.
    #[must_use]
    pub fn free_backed(&self) -> HugeLength {
        let mut r = HugeLength::new(0);
        for i in 0..self.size().raw_num() {
            if self.backed[i] && self.pages_used[i] == Length::new(0) {
                r += HugeLength::new(1);
            }
        }
        r
    }

    /// Classify every free run, split at backed/unbacked huge-page
    /// boundaries, into the span histograms.
    pub fn add_span_stats(
        &self,
        mut small: Option<&mut SmallSpanStats>,
        mut large: Option<&mut LargeSpanStats>,
    ) {
        let nhp = self.size().raw_num();
        let mut free_seen = Length::new(0);
        let mut unmapped_seen = Length::new(0);
        let mut index = 0usize;
        while let Some((start, run)) = self.tracker.next_free_range(index) {
            // The run may cross huge pages with different backed states;
            // truncate it to a uniformly backed or unbacked piece.
            let mut p = self.location.start().first_page() + Length::new(start);
            let mut i = (HugePage::containing(p) - self.location.start()).raw_num();
            let backed = self.backed[i];
            let mut remaining = run;
            let mut truncated = 0usize;
            loop {
                let lim = (self.location.start() + HugeLength::new(i + 1)).first_page();
                let here = std::cmp::min(Length::new(remaining), lim - p).raw_num();
                truncated += here;
                remaining -= here;
                p = p + Length::new(here);
                i += 1;
                if remaining == 0 {
                    break;
                }
                debug_assert!(i < nhp);
                if self.backed[i] != backed {
                    break;
                }
            }

            let released = !backed;
            if released {
                unmapped_seen += Length::new(truncated);
            } else {
                free_seen += Length::new(truncated);
            }
            record_free_run(&mut small, &mut large, truncated, released);
            index = start + truncated;
        }
        debug_assert_eq!(free_seen, self.free_pages());
        debug_assert_eq!(unmapped_seen, self.unmapped_pages());
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.location.len().in_bytes(),
            free_bytes: self.free_pages().in_bytes(),
            unmapped_bytes: self.unmapped_pages().in_bytes(),
        }
    }

    /// A rather specialized order, so not `Ord`: the more fragmented
    /// region (shorter longest free run) is the better allocation target.
    #[must_use]
    pub fn better_to_alloc_than(&self, rhs: &Self) -> bool {
        self.longest_free() < rhs.longest_free()
    }

    pub fn print(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let unbacked = self.size() - self.backed();
        writeln!(
            out,
            "HugeRegion: {} KiB used, {} KiB free, {} KiB contiguous space, {} MiB unbacked, \
             {} MiB unbacked lifetime",
            self.used_pages().in_bytes() / 1024,
            self.free_pages().in_bytes() / 1024,
            self.longest_free().in_bytes() / 1024,
            unbacked.in_mib(),
            self.total_unbacked.in_mib()
        )
    }

    pub fn print_in_pbtxt(&self, detail: &mut PbtxtRegion<'_>) -> fmt::Result {
        detail.print_i64("used_bytes", self.used_pages().in_bytes() as i64)?;
        detail.print_i64("free_bytes", self.free_pages().in_bytes() as i64)?;
        detail.print_i64(
            "longest_free_range_bytes",
            self.longest_free().in_bytes() as i64,
        )?;
        let unbacked = self.size() - self.backed();
        detail.print_i64("unbacked_bytes", unbacked.in_bytes() as i64)?;
        detail.print_i64("total_unbacked_bytes", self.total_unbacked.in_bytes() as i64)?;
        detail.print_i64("backed_fully_free_bytes", self.free_backed().in_bytes() as i64)
    }

    fn longest_free(&self) -> Length {
        Length::new(self.tracker.longest_free())
    }

    /// Account `[p, p + n)` as allocated, backing untouched huge pages.
    /// Returns true iff any huge page was newly backed.
    fn inc(&mut self, p: PageId, n: Length) -> bool {
        let mut should_back = false;
        let now = self.clock.now_ticks();
        let mut p = p;
        let mut n = n;
        while n > Length::new(0) {
            let hp = HugePage::containing(p);
            let i = (hp - self.location.start()).raw_num();
            let lim = (hp + HugeLength::new(1)).first_page();
            let here = std::cmp::min(n, lim - p);
            if self.pages_used[i] == Length::new(0) && !self.backed[i] {
                self.backed[i] = true;
                should_back = true;
                self.nbacked += HugeLength::new(1);
                self.last_touched[i] = now;
            }
            self.pages_used[i] += here;
            debug_assert!(self.pages_used[i] <= Length::new(PAGES_PER_HUGE_PAGE));
            p = p + here;
            n -= here;
        }
        should_back
    }

    fn dec(&mut self, p: PageId, n: Length, release: bool) {
        let now = self.clock.now_ticks();
        let mut should_unback = vec![false; self.size().raw_num()];
        let mut p = p;
        let mut n = n;
        while n > Length::new(0) {
            let hp = HugePage::containing(p);
            let i = (hp - self.location.start()).raw_num();
            let lim = (hp + HugeLength::new(1)).first_page();
            let here = std::cmp::min(n, lim - p);
            debug_assert!(here > Length::new(0));
            debug_assert!(self.pages_used[i] >= here);
            debug_assert!(self.backed[i]);
            // Age the huge page by the share of its pages still in use.
            self.last_touched[i] = Self::average_whens(
                here,
                now,
                Length::new(PAGES_PER_HUGE_PAGE) - self.pages_used[i],
                self.last_touched[i],
            );
            self.pages_used[i] -= here;
            if self.pages_used[i] == Length::new(0) {
                should_unback[i] = true;
            }
            p = p + here;
            n -= here;
        }
        if release {
            self.unback_hugepages(&should_unback);
        }
    }

    /// Unback each maximal run of flagged huge pages with one call.
    /// Returns the huge pages successfully unbacked; a failed call leaves
    /// its whole run backed.
    fn unback_hugepages(&mut self, should_unback: &[bool]) -> HugeLength {
        let now = self.clock.now_ticks();
        let n = should_unback.len();
        let mut released = HugeLength::new(0);
        let mut i = 0;
        while i < n {
            if !should_unback[i] {
                i += 1;
                continue;
            }
            let mut j = i;
            while j < n && should_unback[j] {
                j += 1;
            }

            let hl = HugeLength::new(j - i);
            let hp = self.location.start() + HugeLength::new(i);
            if self.unback.unback(hp.start_addr(), hl.in_bytes()) {
                self.nbacked -= hl;
                self.total_unbacked += hl;
                released += hl;
                for k in i..j {
                    self.backed[k] = false;
                    self.last_touched[k] = now;
                }
            }
            i = j;
        }
        released
    }

    fn average_whens(a: Length, a_when: i64, b: Length, b_when: i64) -> i64 {
        let aw = a.raw_num() as f64 * a_when as f64;
        let bw = b.raw_num() as f64 * b_when as f64;
        ((aw + bw) / (a.raw_num() + b.raw_num()) as f64) as i64
    }
}

/// A set of regions, kept sorted so allocations carve into the most
/// fragmented region that fits.
pub struct HugeRegionSet<U: Unback> {
    // Sorted by longest free run, ascending.
    regions: Vec<HugeRegion<U>>,
    use_huge_region_more_often: HugeRegionUsageOption,
}

impl<U: Unback> HugeRegionSet<U> {
    #[must_use]
    pub fn new(use_huge_region_more_often: HugeRegionUsageOption) -> Self {
        Self {
            regions: Vec::new(),
            use_huge_region_more_often,
        }
    }

    #[must_use]
    pub fn use_huge_region_more_often(&self) -> bool {
        self.use_huge_region_more_often == HugeRegionUsageOption::UseForAllLargeAllocs
    }

    #[must_use]
    pub fn active_regions(&self) -> usize {
        self.regions.len()
    }

    /// Allocate `n` pages from the first (most fragmented) region that can
    /// hold them.
    pub fn maybe_get(&mut self, n: Length) -> Option<RegionAllocation> {
        for idx in 0..self.regions.len() {
            if let Some(allocation) = self.regions[idx].maybe_get(n) {
                self.fix(idx);
                return Some(allocation);
            }
        }
        None
    }

    /// Return an allocation to the region containing it, if any. Empty
    /// huge pages are released immediately unless the set is configured to
    /// hold them for periodic release.
    pub fn maybe_put(&mut self, p: PageId, n: Length) -> bool {
        let release = !self.use_huge_region_more_often();
        for idx in 0..self.regions.len() {
            if self.regions[idx].contains(p) {
                self.regions[idx].put(p, n, release);
                self.fix(idx);
                return true;
            }
        }
        false
    }

    /// Add a region to the set, in sorted position.
    pub fn contribute(&mut self, region: HugeRegion<U>) {
        let pos = self
            .regions
            .iter()
            .position(|r| region.better_to_alloc_than(r))
            .unwrap_or(self.regions.len());
        self.regions.insert(pos, region);
    }

    /// Unback up to `release_fraction` of the free-but-backed huge pages
    /// of every region. Returns the total in pages.
    pub fn release_pages(&mut self, release_fraction: f64) -> Length {
        let mut released = Length::new(0);
        for region in &mut self.regions {
            released += region.release(release_fraction).in_pages();
        }
        released
    }

    pub fn add_span_stats(
        &self,
        mut small: Option<&mut SmallSpanStats>,
        mut large: Option<&mut LargeSpanStats>,
    ) {
        for region in &self.regions {
            region.add_span_stats(small.as_deref_mut(), large.as_deref_mut());
        }
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        let mut stats = BackingStats::default();
        for region in &self.regions {
            stats += region.stats();
        }
        stats
    }

    #[must_use]
    pub fn free_backed(&self) -> HugeLength {
        let mut pages = HugeLength::new(0);
        for region in &self.regions {
            pages += region.free_backed();
        }
        pages
    }

    pub fn print(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "HugeRegionSet: 1 MiB+ allocations best-fit into {} MiB slabs",
            HugeLength::new(REGION_HUGE_PAGES).in_mib()
        )?;
        writeln!(out, "HugeRegionSet: {} total regions", self.regions.len())?;

        let mut total_free = Length::new(0);
        let mut total_backed = HugeLength::new(0);
        let mut total_free_backed = HugeLength::new(0);
        let mut total_size = HugeLength::new(0);
        for region in &self.regions {
            region.print(out)?;
            total_free += region.free_pages();
            total_backed += region.backed();
            total_free_backed += region.free_backed();
            total_size += region.size();
        }

        writeln!(
            out,
            "HugeRegionSet: {} hugepages backed, {} backed and free, out of {} total",
            total_backed.raw_num(),
            total_free_backed.raw_num(),
            total_size.raw_num()
        )?;

        let in_pages = total_backed.in_pages();
        writeln!(
            out,
            "HugeRegionSet: {} pages free in backed region, {:.4} free",
            total_free.raw_num(),
            if in_pages > Length::new(0) {
                total_free.raw_num() as f64 / in_pages.raw_num() as f64
            } else {
                0.0
            }
        )
    }

    pub fn print_in_pbtxt(&self, hpaa: &mut PbtxtRegion<'_>) -> fmt::Result {
        hpaa.print_i64("min_huge_region_alloc_size", 1024 * 1024)?;
        hpaa.print_i64(
            "huge_region_size",
            HugeLength::new(REGION_HUGE_PAGES).in_bytes() as i64,
        )?;
        for region in &self.regions {
            hpaa.sub_region("huge_region_details", |detail| region.print_in_pbtxt(detail))?;
        }
        Ok(())
    }

    /// The region at `idx` changed fragmentation; walk it to its sorted
    /// place.
    fn fix(&mut self, mut idx: usize) {
        while idx > 0 && self.regions[idx].better_to_alloc_than(&self.regions[idx - 1]) {
            self.regions.swap(idx, idx - 1);
            idx -= 1;
        }
        while idx + 1 < self.regions.len()
            && self.regions[idx + 1].better_to_alloc_than(&self.regions[idx])
        {
            self.regions.swap(idx, idx + 1);
            idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hugepages::pages::HUGE_PAGE_SIZE;
    use crate::hugepages::testing::MockUnback;

    fn region_at(start: usize, n: usize) -> HugeRegion<MockUnback> {
        HugeRegion::new(
            HugeRange::new(HugePage::new(start), HugeLength::new(n)),
            Clock::system(),
            MockUnback::default(),
        )
    }

    fn len(n: usize) -> Length {
        Length::new(n)
    }

    #[test]
    fn test_lazy_backing_and_release() {
        let mut r = region_at(16, 8);
        let alloc = r.maybe_get(len(300)).unwrap();
        assert_eq!(alloc.page, HugePage::new(16).first_page());
        assert!(alloc.from_released);
        assert_eq!(r.backed(), HugeLength::new(2));
        assert_eq!(r.used_pages(), len(300));
        assert_eq!(r.pages_used[0], len(256));
        assert_eq!(r.pages_used[1], len(44));
        assert!(r.backed[0] && r.backed[1] && !r.backed[2]);

        r.put(alloc.page, len(300), true);
        assert_eq!(r.backed(), HugeLength::new(0));
        assert_eq!(r.total_unbacked, HugeLength::new(2));
        // One contiguous unback call covering both huge pages.
        assert_eq!(
            r.unback.calls(),
            vec![(HugePage::new(16).start_addr() as usize, 2 * HUGE_PAGE_SIZE)]
        );
    }

    #[test]
    fn test_second_alloc_on_backed_pages_is_not_from_released() {
        let mut r = region_at(0, 4);
        let a = r.maybe_get(len(100)).unwrap();
        assert!(a.from_released);
        // The second run fits in the already-backed first huge page.
        let b = r.maybe_get(len(100)).unwrap();
        assert!(!b.from_released);
        assert_eq!(r.backed(), HugeLength::new(1));
    }

    #[test]
    fn test_full_region_allocation() {
        let mut r = region_at(0, 8);
        let total = 8 * PAGES_PER_HUGE_PAGE;
        let a = r.maybe_get(len(total)).unwrap();
        assert!(a.from_released);
        assert_eq!(r.backed(), HugeLength::new(8));
        assert_eq!(r.free_pages(), len(0));
        assert!(r.maybe_get(len(1)).is_none());

        // Only a fully free region can hold a full-size request.
        let mut r2 = region_at(8, 8);
        r2.maybe_get(len(1)).unwrap();
        assert!(r2.maybe_get(len(total)).is_none());
    }

    #[test]
    fn test_put_without_release_keeps_backing() {
        let mut r = region_at(0, 4);
        let a = r.maybe_get(len(512)).unwrap();
        r.put(a.page, len(512), false);
        assert_eq!(r.backed(), HugeLength::new(2));
        assert_eq!(r.free_backed(), HugeLength::new(2));
        assert!(r.unback.calls().is_empty());

        // A later allocation reuses the backing without a remap.
        let b = r.maybe_get(len(10)).unwrap();
        assert!(!b.from_released);
    }

    #[test]
    fn test_release_fraction() {
        let mut r = region_at(0, 8);
        let a = r.maybe_get(len(4 * PAGES_PER_HUGE_PAGE)).unwrap();
        r.put(a.page, len(4 * PAGES_PER_HUGE_PAGE), false);
        assert_eq!(r.free_backed(), HugeLength::new(4));

        assert_eq!(r.release(0.5), HugeLength::new(2));
        assert_eq!(r.free_backed(), HugeLength::new(2));
        assert_eq!(r.backed(), HugeLength::new(2));

        // Out-of-range fractions clamp; 2.0 behaves as 1.0.
        assert_eq!(r.release(2.0), HugeLength::new(2));
        assert_eq!(r.backed(), HugeLength::new(0));
        assert_eq!(r.total_unbacked, HugeLength::new(4));
    }

    #[test]
    fn test_release_zero_fraction_still_releases_one() {
        let mut r = region_at(0, 4);
        let a = r.maybe_get(len(2 * PAGES_PER_HUGE_PAGE)).unwrap();
        r.put(a.page, len(2 * PAGES_PER_HUGE_PAGE), false);
        assert_eq!(r.release(0.0), HugeLength::new(1));
        assert_eq!(r.free_backed(), HugeLength::new(1));
    }

    #[test]
    fn test_unback_failure_keeps_accounting() {
        let mut r = region_at(0, 4);
        let a = r.maybe_get(len(256)).unwrap();
        r.unback.set_fail(true);
        r.put(a.page, len(256), true);
        assert_eq!(r.backed(), HugeLength::new(1));
        assert_eq!(r.free_backed(), HugeLength::new(1));
        assert_eq!(r.total_unbacked, HugeLength::new(0));
        assert_eq!(r.release(1.0), HugeLength::new(0));

        // Once the kernel cooperates the huge page goes away.
        r.unback.set_fail(false);
        assert_eq!(r.release(1.0), HugeLength::new(1));
        assert_eq!(r.backed(), HugeLength::new(0));
    }

    #[test]
    fn test_span_stats_split_at_backing_boundary() {
        let mut r = region_at(0, 4);
        // Back the first two huge pages, then free the tail of the run so
        // a backed free run sits next to unbacked huge pages.
        let a = r.maybe_get(len(2 * PAGES_PER_HUGE_PAGE)).unwrap();
        r.put(a.page, len(2 * PAGES_PER_HUGE_PAGE), false);
        let _b = r.maybe_get(len(10)).unwrap();

        let mut small = SmallSpanStats::default();
        let mut large = LargeSpanStats::default();
        r.add_span_stats(Some(&mut small), Some(&mut large));
        // Backed free piece: pages 10..512. Unbacked piece: 512..1024.
        assert_eq!(large.spans, 2);
        assert_eq!(large.normal_pages, len(2 * PAGES_PER_HUGE_PAGE - 10));
        assert_eq!(large.returned_pages, len(2 * PAGES_PER_HUGE_PAGE));
    }

    #[test]
    fn test_contains() {
        let r = region_at(4, 2);
        assert!(!r.contains(HugePage::new(3).first_page() + len(255)));
        assert!(r.contains(HugePage::new(4).first_page()));
        assert!(r.contains(HugePage::new(5).first_page() + len(255)));
        assert!(!r.contains(HugePage::new(6).first_page()));
    }

    #[test]
    fn test_region_stats() {
        let mut r = region_at(0, 8);
        r.maybe_get(len(100)).unwrap();
        let stats = r.stats();
        assert_eq!(stats.system_bytes, 8 * HUGE_PAGE_SIZE);
        assert_eq!(stats.free_bytes, len(156).in_bytes());
        assert_eq!(stats.unmapped_bytes, 7 * HUGE_PAGE_SIZE);
    }

    fn set_is_sorted<U: Unback>(set: &HugeRegionSet<U>) -> bool {
        set.regions
            .windows(2)
            .all(|w| !w[1].better_to_alloc_than(&w[0]))
    }

    #[test]
    fn test_set_allocates_from_most_fragmented() {
        let mut set = HugeRegionSet::new(HugeRegionUsageOption::Default);
        set.contribute(region_at(0, 4));
        set.contribute(region_at(4, 4));

        // Fragment one region so its longest run is shorter.
        let a = set.maybe_get(len(4 * PAGES_PER_HUGE_PAGE - 50)).unwrap();
        assert!(set_is_sorted(&set));

        // The small request lands in the fragmented region, not the
        // untouched one.
        let b = set.maybe_get(len(20)).unwrap();
        assert_eq!(
            HugePage::containing(b.page),
            HugePage::containing(a.page + len(4 * PAGES_PER_HUGE_PAGE - 50))
        );
        assert!(set_is_sorted(&set));
    }

    #[test]
    fn test_set_put_routes_to_containing_region() {
        let mut set = HugeRegionSet::new(HugeRegionUsageOption::Default);
        set.contribute(region_at(0, 4));
        set.contribute(region_at(4, 4));

        let a = set.maybe_get(len(300)).unwrap();
        assert!(set.maybe_put(a.page, len(300)));
        assert!(set_is_sorted(&set));
        // Default usage releases the emptied huge pages on put.
        assert_eq!(set.free_backed(), HugeLength::new(0));

        // A page outside every region is rejected.
        assert!(!set.maybe_put(HugePage::new(100).first_page(), len(1)));
    }

    #[test]
    fn test_set_defers_release_when_used_more_often() {
        let mut set = HugeRegionSet::new(HugeRegionUsageOption::UseForAllLargeAllocs);
        set.contribute(region_at(0, 4));
        let a = set.maybe_get(len(300)).unwrap();
        assert!(set.maybe_put(a.page, len(300)));
        assert_eq!(set.free_backed(), HugeLength::new(2));

        // The backing is dropped by the periodic release instead.
        assert_eq!(set.release_pages(1.0), len(2 * PAGES_PER_HUGE_PAGE));
        assert_eq!(set.free_backed(), HugeLength::new(0));
    }

    #[test]
    fn test_set_stats_aggregate() {
        let mut set = HugeRegionSet::new(HugeRegionUsageOption::Default);
        set.contribute(region_at(0, 4));
        set.contribute(region_at(4, 4));
        set.maybe_get(len(100)).unwrap();
        assert_eq!(set.active_regions(), 2);
        let stats = set.stats();
        assert_eq!(stats.system_bytes, 8 * HUGE_PAGE_SIZE);
        assert_eq!(stats.free_bytes, len(156).in_bytes());
    }

    #[test]
    fn test_set_print_smoke() {
        let mut set = HugeRegionSet::new(HugeRegionUsageOption::Default);
        set.contribute(region_at(0, 4));
        set.maybe_get(len(100)).unwrap();

        let mut buf = String::new();
        set.print(&mut buf).unwrap();
        assert!(buf.contains("HugeRegionSet: 1 total regions"));
        assert!(buf.contains("HugeRegion:"));

        let mut buf = String::new();
        let mut region = PbtxtRegion::new(&mut buf);
        set.print_in_pbtxt(&mut region).unwrap();
        for key in [
            "min_huge_region_alloc_size",
            "huge_region_size",
            "huge_region_details",
            "used_bytes",
            "longest_free_range_bytes",
            "backed_fully_free_bytes",
        ] {
            assert!(buf.contains(key), "missing pbtxt key {key}");
        }
    }
}
