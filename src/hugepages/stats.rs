//! Statistics surfaces shared by the filler and the regions, plus
//! process-wide diagnostic counters.
//!
//! Counters use `Relaxed` ordering and are eventually consistent; they are
//! for diagnostic display only. Do NOT use their values for allocation or
//! release decisions.

use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

use super::pages::{Length, MAX_SMALL_SPAN_PAGES};

/// Histogram of free runs shorter than [`MAX_SMALL_SPAN_PAGES`], indexed by
/// run length and split by whether the run is backed ("normal") or returned
/// to the kernel.
#[derive(Clone, Debug, Default)]
pub struct SmallSpanStats {
    pub normal_length: [usize; MAX_SMALL_SPAN_PAGES],
    pub returned_length: [usize; MAX_SMALL_SPAN_PAGES],
}

/// Aggregate of free runs of at least [`MAX_SMALL_SPAN_PAGES`] pages.
#[derive(Clone, Copy, Debug, Default)]
pub struct LargeSpanStats {
    pub spans: usize,
    pub normal_pages: Length,
    pub returned_pages: Length,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackingStats {
    pub system_bytes: usize,
    pub free_bytes: usize,
    pub unmapped_bytes: usize,
}

impl AddAssign for BackingStats {
    fn add_assign(&mut self, rhs: BackingStats) {
        self.system_bytes += rhs.system_bytes;
        self.free_bytes += rhs.free_bytes;
        self.unmapped_bytes += rhs.unmapped_bytes;
    }
}

/// Fold one free run into the span histograms: short runs into the
/// per-length histogram, long runs into the aggregate.
pub(crate) fn record_free_run(
    small: &mut Option<&mut SmallSpanStats>,
    large: &mut Option<&mut LargeSpanStats>,
    n: usize,
    released: bool,
) {
    if n < MAX_SMALL_SPAN_PAGES {
        if let Some(small) = small.as_deref_mut() {
            if released {
                small.returned_length[n] += 1;
            } else {
                small.normal_length[n] += 1;
            }
        }
    } else if let Some(large) = large.as_deref_mut() {
        large.spans += 1;
        if released {
            large.returned_pages += Length::new(n);
        } else {
            large.normal_pages += Length::new(n);
        }
    }
}

/// Evaluates `a / b`, avoiding division by zero.
#[inline]
#[must_use]
pub(crate) fn safe_div(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        0.0
    } else {
        a / b
    }
}

#[inline]
#[must_use]
pub(crate) fn safe_div_lengths(a: Length, b: Length) -> f64 {
    safe_div(a.raw_num() as f64, b.raw_num() as f64)
}

/// Writer for the machine-readable (pbtxt) statistics surface. Emits
/// `key: value` lines and named `{ ... }` sub-regions; the key names are
/// part of the crate's interface contract.
pub struct PbtxtRegion<'a> {
    out: &'a mut dyn fmt::Write,
    indent: usize,
}

impl<'a> PbtxtRegion<'a> {
    pub fn new(out: &'a mut dyn fmt::Write) -> Self {
        PbtxtRegion { out, indent: 0 }
    }

    pub fn print_i64(&mut self, key: &str, value: i64) -> fmt::Result {
        writeln!(self.out, "{:indent$}{key}: {value}", "", indent = self.indent)
    }

    pub fn print_raw(&mut self, key: &str, value: &str) -> fmt::Result {
        writeln!(self.out, "{:indent$}{key}: {value}", "", indent = self.indent)
    }

    pub fn sub_region(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut PbtxtRegion<'_>) -> fmt::Result,
    ) -> fmt::Result {
        writeln!(self.out, "{:indent$}{name} {{", "", indent = self.indent)?;
        let mut inner = PbtxtRegion {
            out: &mut *self.out,
            indent: self.indent + 2,
        };
        f(&mut inner)?;
        writeln!(self.out, "{:indent$}}}", "", indent = self.indent)
    }
}

/// Diagnostic-only monotonic counter.
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(val as u64, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Total bytes the platform layer has returned to the kernel.
pub static TOTAL_UNBACKED_BYTES: Counter = Counter::new();
// Unback syscalls the kernel refused.
pub static UNBACK_FAILURES: Counter = Counter::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(10.0, 0.0), 0.0);
        assert_eq!(safe_div(10.0, 4.0), 2.5);
        assert_eq!(safe_div_lengths(Length::new(1), Length::new(2)), 0.5);
    }

    #[test]
    fn test_counter() {
        let c = Counter::new();
        c.add(3);
        c.add(4);
        assert_eq!(c.get(), 7);
    }

    #[test]
    fn test_pbtxt_shape() {
        let mut buf = String::new();
        let mut region = PbtxtRegion::new(&mut buf);
        region.print_i64("a", 1).unwrap();
        region
            .sub_region("nested", |r| {
                r.print_raw("kind", "REGULAR")?;
                r.print_i64("b", 2)
            })
            .unwrap();
        assert_eq!(buf, "a: 1\nnested {\n  kind: REGULAR\n  b: 2\n}\n");
    }

    #[test]
    fn test_backing_stats_sum() {
        let mut a = BackingStats {
            system_bytes: 1,
            free_bytes: 2,
            unmapped_bytes: 3,
        };
        a += BackingStats {
            system_bytes: 10,
            free_bytes: 20,
            unmapped_bytes: 30,
        };
        assert_eq!(a.system_bytes, 11);
        assert_eq!(a.free_bytes, 22);
        assert_eq!(a.unmapped_bytes, 33);
    }
}
