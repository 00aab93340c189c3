//! Word-array bit set and the range tracker built on it.
//!
//! Both are runtime-capacity: a `PageTracker` needs 256 bits, a default
//! `HugeRegion` needs 131072, and neither size is hot enough to justify
//! const-generic word arrays.

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

const WORD_BITS: usize = 64;

/// Fixed-capacity bit set with range set/clear/count/find operations.
pub(crate) struct Bitmap {
    size: usize,
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            words: vec![0u64; size.div_ceil(WORD_BITS)],
        }
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.size);
        (self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 == 1
    }

    /// Set `[i, i + len)`.
    pub fn set_range(&mut self, i: usize, len: usize) {
        self.for_each_word(i, len, |word, mask| *word |= mask);
    }

    /// Clear `[i, i + len)`.
    pub fn clear_range(&mut self, i: usize, len: usize) {
        self.for_each_word(i, len, |word, mask| *word &= !mask);
    }

    /// Number of set bits in `[i, i + len)`.
    pub fn count(&self, i: usize, len: usize) -> usize {
        debug_assert!(i + len <= self.size);
        let mut total = 0;
        let mut bit = i;
        let end = i + len;
        while bit < end {
            let word = bit / WORD_BITS;
            let lo = bit % WORD_BITS;
            let hi = std::cmp::min(WORD_BITS, lo + (end - bit));
            total += (self.words[word] & Self::mask(lo, hi)).count_ones() as usize;
            bit += hi - lo;
        }
        total
    }

    /// Index of the first set bit at or after `from`.
    pub fn find_set(&self, from: usize) -> Option<usize> {
        self.find(from, |w| w)
    }

    /// Index of the first clear bit at or after `from`.
    pub fn find_clear(&self, from: usize) -> Option<usize> {
        self.find(from, |w| !w)
    }

    /// The maximal run of clear bits starting at the first clear bit at or
    /// after `from`, as `(start, len)`.
    pub fn next_clear_range(&self, from: usize) -> Option<(usize, usize)> {
        let start = self.find_clear(from)?;
        let end = self.find_set(start + 1).unwrap_or(self.size);
        Some((start, end - start))
    }

    fn find(&self, from: usize, xform: impl Fn(u64) -> u64) -> Option<usize> {
        if from >= self.size {
            return None;
        }
        let mut word = from / WORD_BITS;
        // Bits below `from` in the first word are masked off.
        let mut cur = xform(self.words[word]) & !Self::mask(0, from % WORD_BITS);
        loop {
            if cur != 0 {
                let i = word * WORD_BITS + cur.trailing_zeros() as usize;
                return (i < self.size).then_some(i);
            }
            word += 1;
            if word >= self.words.len() {
                return None;
            }
            cur = xform(self.words[word]);
        }
    }

    /// Mask selecting bits `[lo, hi)` of a word.
    #[inline]
    fn mask(lo: usize, hi: usize) -> u64 {
        debug_assert!(lo <= hi && hi <= WORD_BITS);
        let high = if hi == WORD_BITS { u64::MAX } else { (1u64 << hi) - 1 };
        high & !((1u64 << lo) - 1)
    }

    fn for_each_word(&mut self, i: usize, len: usize, f: impl Fn(&mut u64, u64)) {
        debug_assert!(i + len <= self.size);
        let mut bit = i;
        let end = i + len;
        while bit < end {
            let word = bit / WORD_BITS;
            let lo = bit % WORD_BITS;
            let hi = std::cmp::min(WORD_BITS, lo + (end - bit));
            f(&mut self.words[word], Self::mask(lo, hi));
            bit += hi - lo;
        }
    }
}

/// Tracks used/free state of a run of pages: leftmost-fit allocation,
/// exact-range deallocation, and free-range traversal.
///
/// A set bit means the page is used.
pub(crate) struct RangeTracker {
    bits: Bitmap,
    nused: usize,
    nallocs: usize,
    /// Debug-only shadow of allocation start offsets, to catch `unmark`
    /// calls that do not match a prior `find_and_mark`.
    #[cfg(debug_assertions)]
    alloc_starts: FixedBitSet,
}

impl RangeTracker {
    pub fn new(size: usize) -> Self {
        Self {
            bits: Bitmap::new(size),
            nused: 0,
            nallocs: 0,
            #[cfg(debug_assertions)]
            alloc_starts: FixedBitSet::with_capacity(size),
        }
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.nused
    }

    #[inline]
    pub fn allocs(&self) -> usize {
        self.nallocs
    }

    /// Mark the leftmost free run of at least `n` pages as used and return
    /// its offset. Panics if no such run exists; callers check
    /// `longest_free()` first.
    pub fn find_and_mark(&mut self, n: usize) -> usize {
        assert!(n > 0);
        let mut from = 0;
        let start = loop {
            match self.bits.next_clear_range(from) {
                Some((s, len)) if len >= n => break s,
                Some((s, len)) => from = s + len,
                None => panic!("find_and_mark: no free run of {n} pages"),
            }
        };
        self.bits.set_range(start, n);
        self.nused += n;
        self.nallocs += 1;
        #[cfg(debug_assertions)]
        {
            debug_assert!(!self.alloc_starts.contains(start));
            self.alloc_starts.insert(start);
        }
        start
    }

    /// Unmark `[i, i + n)`, which must exactly match a prior `find_and_mark`.
    pub fn unmark(&mut self, i: usize, n: usize) {
        debug_assert!(
            self.bits.count(i, n) == n,
            "unmark of not-fully-marked range [{i}, {})",
            i + n
        );
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.alloc_starts.contains(i),
                "unmark at {i} does not match an allocation start"
            );
            self.alloc_starts.remove(i);
        }
        self.bits.clear_range(i, n);
        debug_assert!(self.nused >= n && self.nallocs > 0);
        self.nused -= n;
        self.nallocs -= 1;
    }

    /// The maximal free run starting at the first free page at or after
    /// `from`, as `(start, len)`.
    #[inline]
    pub fn next_free_range(&self, from: usize) -> Option<(usize, usize)> {
        self.bits.next_clear_range(from)
    }

    /// Length of the longest contiguous free run.
    pub fn longest_free(&self) -> usize {
        let mut longest = 0;
        let mut from = 0;
        while let Some((start, len)) = self.bits.next_clear_range(from) {
            longest = std::cmp::max(longest, len);
            from = start + len;
        }
        longest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_set_clear_count() {
        let mut b = Bitmap::new(256);
        assert_eq!(b.count(0, 256), 0);
        b.set_range(10, 100);
        assert_eq!(b.count(0, 256), 100);
        assert_eq!(b.count(0, 10), 0);
        assert_eq!(b.count(10, 100), 100);
        assert!(b.get(10) && b.get(109) && !b.get(110));
        b.clear_range(50, 10);
        assert_eq!(b.count(0, 256), 90);
        assert!(!b.get(55));
    }

    #[test]
    fn test_bitmap_find_across_words() {
        let mut b = Bitmap::new(200);
        b.set_range(60, 10);
        assert_eq!(b.find_set(0), Some(60));
        assert_eq!(b.find_set(61), Some(61));
        assert_eq!(b.find_set(70), None);
        assert_eq!(b.find_clear(60), Some(70));
        assert_eq!(b.next_clear_range(0), Some((0, 60)));
        assert_eq!(b.next_clear_range(60), Some((70, 130)));
    }

    #[test]
    fn test_bitmap_full_word_boundaries() {
        let mut b = Bitmap::new(128);
        b.set_range(0, 128);
        assert_eq!(b.count(0, 128), 128);
        assert_eq!(b.find_clear(0), None);
        b.clear_range(63, 2);
        assert_eq!(b.next_clear_range(0), Some((63, 2)));
    }

    #[test]
    fn test_range_tracker_leftmost_fit() {
        let mut t = RangeTracker::new(256);
        assert_eq!(t.find_and_mark(10), 0);
        assert_eq!(t.find_and_mark(10), 10);
        assert_eq!(t.find_and_mark(1), 20);
        assert_eq!(t.used(), 21);
        assert_eq!(t.allocs(), 3);
        assert_eq!(t.longest_free(), 235);
    }

    #[test]
    fn test_range_tracker_reuses_gap() {
        let mut t = RangeTracker::new(64);
        let a = t.find_and_mark(8);
        let b = t.find_and_mark(8);
        let _c = t.find_and_mark(8);
        t.unmark(b, 8);
        // A gap of exactly 8 opens at b; a request for 4 takes its head.
        assert_eq!(t.find_and_mark(4), b);
        // A request that does not fit in the remaining 4-page gap skips it.
        assert_eq!(t.find_and_mark(8), 24);
        assert_eq!(a, 0);
    }

    #[test]
    fn test_range_tracker_next_free_range() {
        let mut t = RangeTracker::new(64);
        t.find_and_mark(10);
        let m = t.find_and_mark(6);
        t.unmark(m, 6);
        assert_eq!(t.next_free_range(0), Some((10, 54)));
        assert_eq!(t.next_free_range(30), Some((30, 34)));
        t.find_and_mark(64 - 10);
        assert_eq!(t.next_free_range(0), None);
    }

    #[test]
    fn test_range_tracker_counts_balance() {
        let mut t = RangeTracker::new(128);
        let a = t.find_and_mark(16);
        let b = t.find_and_mark(32);
        t.unmark(a, 16);
        t.unmark(b, 32);
        assert_eq!(t.used(), 0);
        assert_eq!(t.allocs(), 0);
        assert_eq!(t.longest_free(), 128);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "allocation start")]
    fn test_range_tracker_mismatched_unmark() {
        let mut t = RangeTracker::new(64);
        t.find_and_mark(8);
        t.unmark(2, 4);
    }

    #[test]
    #[should_panic(expected = "no free run")]
    fn test_range_tracker_overfull() {
        let mut t = RangeTracker::new(16);
        t.find_and_mark(16);
        t.find_and_mark(1);
    }
}
