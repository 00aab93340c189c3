//! Allocation state of the small pages inside one huge page.

use super::bitmap::{Bitmap, RangeTracker};
use super::pages::{HugePage, Length, PageId, PAGES_PER_HUGE_PAGE};
use super::stats::{record_free_run, LargeSpanStats, SmallSpanStats};
use super::vm::Unback;

pub struct PageAllocation {
    pub page: PageId,
    /// Pages in the returned run that were flagged released and must be
    /// re-backed by the caller.
    pub previously_unbacked: Length,
}

/// Packs page runs into one huge page and accounts which of its pages are
/// currently returned to the kernel.
///
/// All mutation happens through `get`/`put`/`release_free` with the
/// page-heap lock held by the caller.
pub struct PageTracker {
    location: HugePage,

    /// Cached population count of `released_by_page`.
    released_count: u16,
    abandoned_count: u16,
    donated: bool,
    was_donated: bool,
    was_released: bool,
    abandoned: bool,
    unbroken: bool,
    has_dense_spans: bool,

    free: RangeTracker,
    /// Pages currently returned to the kernel. A set bit implies the page
    /// is also free in `free`; not-yet-released pages are clear and read as
    /// "backed" by the release walk.
    released_by_page: Bitmap,
}

impl PageTracker {
    #[must_use]
    pub fn new(location: HugePage, was_donated: bool) -> Self {
        Self {
            location,
            released_count: 0,
            abandoned_count: 0,
            donated: false,
            was_donated,
            was_released: false,
            abandoned: false,
            unbroken: true,
            has_dense_spans: false,
            free: RangeTracker::new(PAGES_PER_HUGE_PAGE),
            released_by_page: Bitmap::new(PAGES_PER_HUGE_PAGE),
        }
    }

    /// Allocate the leftmost free run of `n` pages.
    ///
    /// Requires a free range of at least `n` pages
    /// (`longest_free_range() >= n`). Released bits covered by the run are
    /// cleared; the count of such pages is returned so the caller can
    /// re-back them.
    pub fn get(&mut self, n: Length) -> PageAllocation {
        let index = self.free.find_and_mark(n.raw_num());

        debug_assert_eq!(
            self.released_by_page.count(0, PAGES_PER_HUGE_PAGE),
            usize::from(self.released_count)
        );

        let mut unbacked = 0;
        if self.released_count > 0 {
            unbacked = self.released_by_page.count(index, n.raw_num());
            self.released_by_page.clear_range(index, n.raw_num());
            debug_assert!(usize::from(self.released_count) >= unbacked);
            self.released_count -= unbacked as u16;
        }

        PageAllocation {
            page: self.location.first_page() + Length::new(index),
            previously_unbacked: Length::new(unbacked),
        }
    }

    /// Free `[p, p + n)`, which must be the result of a previous `get`.
    /// Released bits are untouched: a page released before the allocation
    /// becomes released-and-free again.
    pub fn put(&mut self, p: PageId, n: Length) {
        let index = p - self.location.first_page();
        self.free.unmark(index.raw_num(), n.raw_num());
    }

    /// Return every backed-and-free run to the kernel, one `unback` call per
    /// maximal run. Pages whose unback fails stay backed and unreleased.
    /// Returns the number of pages successfully released.
    pub fn release_free(&mut self, unback: &mut dyn Unback) -> Length {
        let mut count = 0usize;
        let mut index = 0usize;
        // Walk the still-backed regions (clear bits of the released bitmap)
        // and release any free range overlapping each.
        while let Some((start, n)) = self.released_by_page.next_clear_range(index) {
            match self.free.next_free_range(start) {
                Some((free_index, free_n)) if free_index < start + n => {
                    let end = std::cmp::min(free_index + free_n, start + n);
                    let len = end - free_index;
                    debug_assert_eq!(self.released_by_page.count(free_index, len), 0);
                    let p = self.location.first_page() + Length::new(free_index);
                    if self.release_pages(p, Length::new(len), unback) {
                        self.released_by_page.set_range(free_index, len);
                        count += len;
                    }
                    index = end;
                }
                _ => index = start + n,
            }
        }

        self.released_count += count as u16;
        debug_assert!(usize::from(self.released_count) <= PAGES_PER_HUGE_PAGE);
        debug_assert_eq!(
            self.released_by_page.count(0, PAGES_PER_HUGE_PAGE),
            usize::from(self.released_count)
        );
        Length::new(count)
    }

    /// Classify every free run, split at backed/released boundaries, into
    /// the span histograms.
    pub fn add_span_stats(
        &self,
        mut small: Option<&mut SmallSpanStats>,
        mut large: Option<&mut LargeSpanStats>,
    ) {
        let mut index = 0;
        while let Some((start, run)) = self.free.next_free_range(index) {
            let is_released = self.released_by_page.get(start);
            // Truncate the run at the first page whose released state differs.
            let end = if start >= PAGES_PER_HUGE_PAGE - 1 {
                PAGES_PER_HUGE_PAGE
            } else if is_released {
                self.released_by_page
                    .find_clear(start + 1)
                    .unwrap_or(PAGES_PER_HUGE_PAGE)
            } else {
                self.released_by_page
                    .find_set(start + 1)
                    .unwrap_or(PAGES_PER_HUGE_PAGE)
            };
            let n = std::cmp::min(end - start, run);
            debug_assert!(n > 0);
            record_free_run(&mut small, &mut large, n, is_released);
            index = start + n;
        }
    }

    #[inline]
    #[must_use]
    pub fn longest_free_range(&self) -> Length {
        Length::new(self.free.longest_free())
    }

    #[inline]
    #[must_use]
    pub fn nallocs(&self) -> usize {
        self.free.allocs()
    }

    #[inline]
    #[must_use]
    pub fn used_pages(&self) -> Length {
        Length::new(self.free.used())
    }

    #[inline]
    #[must_use]
    pub fn released_pages(&self) -> Length {
        Length::new(usize::from(self.released_count))
    }

    #[inline]
    #[must_use]
    pub fn free_pages(&self) -> Length {
        Length::new(PAGES_PER_HUGE_PAGE) - self.used_pages()
    }

    /// True if any unused pages are currently returned to the kernel.
    #[inline]
    #[must_use]
    pub fn released(&self) -> bool {
        self.released_count > 0
    }

    #[inline]
    #[must_use]
    pub fn empty(&self) -> bool {
        self.free.used() == 0
    }

    /// Is this tracker currently in the filler's donated pool? Only
    /// meaningful while the tracker is held by a filler.
    #[inline]
    #[must_use]
    pub fn donated(&self) -> bool {
        self.donated
    }

    pub fn set_donated(&mut self, status: bool) {
        self.donated = status;
    }

    /// Whether the tracker entered the filler as the tail of a
    /// multi-huge-page allocation. Never cleared.
    #[inline]
    #[must_use]
    pub fn was_donated(&self) -> bool {
        self.was_donated
    }

    #[inline]
    #[must_use]
    pub fn was_released(&self) -> bool {
        self.was_released
    }

    pub fn set_was_released(&mut self, status: bool) {
        self.was_released = status;
    }

    #[inline]
    #[must_use]
    pub fn abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn set_abandoned(&mut self, status: bool) {
        self.abandoned = status;
    }

    /// Pages stranded in the filler when the originating allocation of a
    /// donated huge page was freed while other allocations remained.
    /// Maintained by the upstream huge-page allocator.
    #[inline]
    #[must_use]
    pub fn abandoned_count(&self) -> Length {
        Length::new(usize::from(self.abandoned_count))
    }

    /// Requires `was_donated()`.
    pub fn set_abandoned_count(&mut self, count: Length) {
        assert!(self.was_donated);
        self.abandoned_count = count.raw_num() as u16;
    }

    #[inline]
    #[must_use]
    pub fn has_dense_spans(&self) -> bool {
        self.has_dense_spans
    }

    pub fn set_has_dense_spans(&mut self) {
        self.has_dense_spans = true;
    }

    /// False once any part of the huge page has been returned to the
    /// kernel, even if those pages were later re-backed.
    #[inline]
    #[must_use]
    pub fn unbroken(&self) -> bool {
        self.unbroken
    }

    #[inline]
    #[must_use]
    pub fn location(&self) -> HugePage {
        self.location
    }

    fn release_pages(&mut self, p: PageId, n: Length, unback: &mut dyn Unback) -> bool {
        let success = unback.unback(p.start_addr(), n.in_bytes());
        if success {
            self.unbroken = false;
        }
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hugepages::testing::MockUnback;

    fn tracker() -> PageTracker {
        PageTracker::new(HugePage::new(1), false)
    }

    #[test]
    fn test_basic_pack() {
        let mut t = tracker();
        let first = t.location().first_page();
        let a = t.get(Length::new(10));
        let b = t.get(Length::new(10));
        let c = t.get(Length::new(1));
        assert_eq!(a.page, first);
        assert_eq!(b.page, first + Length::new(10));
        assert_eq!(c.page, first + Length::new(20));
        assert_eq!(a.previously_unbacked, Length::new(0));
        assert_eq!(b.previously_unbacked, Length::new(0));
        assert_eq!(c.previously_unbacked, Length::new(0));
        assert_eq!(t.used_pages(), Length::new(21));
        assert_eq!(t.longest_free_range(), Length::new(235));
        assert_eq!(t.nallocs(), 3);
        assert!(t.unbroken());
    }

    #[test]
    fn test_release_and_reuse() {
        let mut t = tracker();
        let first = t.location().first_page();
        t.get(Length::new(10));
        t.get(Length::new(10));
        t.get(Length::new(1));

        let mut unback = MockUnback::default();
        let released = t.release_free(&mut unback);
        assert_eq!(released, Length::new(235));
        assert_eq!(t.released_pages(), Length::new(235));
        assert!(t.released());
        assert!(!t.unbroken());
        // One maximal backed-and-free run.
        assert_eq!(
            unback.calls(),
            vec![(
                (first + Length::new(21)).start_addr() as usize,
                Length::new(235).in_bytes()
            )]
        );

        // Allocating from the released tail re-backs exactly those pages.
        let a = t.get(Length::new(5));
        assert_eq!(a.page, first + Length::new(21));
        assert_eq!(a.previously_unbacked, Length::new(5));
        assert_eq!(t.released_pages(), Length::new(230));

        // Putting it back leaves the pages released-and-free again.
        t.put(a.page, Length::new(5));
        assert_eq!(t.released_pages(), Length::new(230));
        assert_eq!(t.free_pages(), Length::new(235));
    }

    #[test]
    fn test_release_free_skips_released_runs() {
        let mut t = tracker();
        let first = t.location().first_page();
        let a = t.get(Length::new(16));
        t.get(Length::new(16));
        let mut unback = MockUnback::default();
        // Release the 224-page tail.
        assert_eq!(t.release_free(&mut unback), Length::new(224));

        // Free the first run; a second pass releases only that run.
        t.put(a.page, Length::new(16));
        unback.clear();
        assert_eq!(t.release_free(&mut unback), Length::new(16));
        assert_eq!(
            unback.calls(),
            vec![(first.start_addr() as usize, Length::new(16).in_bytes())]
        );
        assert_eq!(t.released_pages(), Length::new(240));
    }

    #[test]
    fn test_release_free_second_call_is_noop() {
        let mut t = tracker();
        t.get(Length::new(40));
        let mut unback = MockUnback::default();
        assert_eq!(t.release_free(&mut unback), Length::new(216));
        assert_eq!(t.release_free(&mut unback), Length::new(0));
        assert_eq!(t.released_pages(), Length::new(216));
    }

    #[test]
    fn test_unback_failure_leaves_state() {
        let mut t = tracker();
        t.get(Length::new(8));
        let mut unback = MockUnback::default();
        unback.set_fail(true);
        assert_eq!(t.release_free(&mut unback), Length::new(0));
        assert_eq!(t.released_pages(), Length::new(0));
        assert!(t.unbroken());
        assert!(!t.released());

        // Once the kernel cooperates, the same pages release normally.
        unback.set_fail(false);
        assert_eq!(t.release_free(&mut unback), Length::new(248));
    }

    #[test]
    fn test_exact_refill_of_released_run() {
        let mut t = tracker();
        let a = t.get(Length::new(64));
        let mut unback = MockUnback::default();
        t.release_free(&mut unback);
        t.put(a.page, Length::new(64));

        // The freed head run is backed, the tail released; an allocation
        // exactly covering the released tail reports every page unbacked.
        let b = t.get(Length::new(64));
        assert_eq!(b.previously_unbacked, Length::new(0));
        let c = t.get(Length::new(192));
        assert_eq!(c.previously_unbacked, Length::new(192));
        assert_eq!(t.released_pages(), Length::new(0));
    }

    #[test]
    fn test_full_tracker() {
        let mut t = tracker();
        let a = t.get(Length::new(PAGES_PER_HUGE_PAGE));
        assert_eq!(a.page, t.location().first_page());
        assert_eq!(t.longest_free_range(), Length::new(0));
        assert!(!t.empty());
        t.put(a.page, Length::new(PAGES_PER_HUGE_PAGE));
        assert!(t.empty());
        assert_eq!(t.longest_free_range(), Length::new(PAGES_PER_HUGE_PAGE));
    }

    #[test]
    fn test_span_stats_split_at_release_boundary() {
        let mut t = tracker();
        let a = t.get(Length::new(8));
        t.get(Length::new(8));
        let mut unback = MockUnback::default();
        t.release_free(&mut unback);
        t.put(a.page, Length::new(8));

        // Free space: 8 backed pages at offset 0, 240 released at offset 16.
        let mut small = SmallSpanStats::default();
        let mut large = LargeSpanStats::default();
        t.add_span_stats(Some(&mut small), Some(&mut large));
        assert_eq!(small.normal_length[8], 1);
        assert_eq!(large.spans, 1);
        assert_eq!(large.returned_pages, Length::new(240));
        assert_eq!(large.normal_pages, Length::new(0));
    }

    #[test]
    fn test_donated_flags() {
        let mut t = PageTracker::new(HugePage::new(7), true);
        assert!(t.was_donated());
        assert!(!t.donated());
        t.set_donated(true);
        assert!(t.donated());
        t.set_abandoned_count(Length::new(12));
        assert_eq!(t.abandoned_count(), Length::new(12));
        t.set_abandoned(true);
        assert!(t.abandoned());
    }

    #[test]
    #[should_panic(expected = "was_donated")]
    fn test_abandoned_count_requires_donated() {
        let mut t = tracker();
        t.set_abandoned_count(Length::new(1));
    }

    #[test]
    fn test_was_released_latch() {
        let mut t = tracker();
        assert!(!t.was_released());
        t.set_was_released(true);
        assert!(t.was_released());
        t.set_was_released(false);
        assert!(!t.was_released());
    }
}
