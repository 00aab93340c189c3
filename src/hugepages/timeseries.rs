//! Ring of per-epoch entries over a fixed wall-clock window.
//!
//! Each `report` folds an update into the entry for the current epoch;
//! when the clock has moved on, intervening epochs are zeroed first. The
//! ring is heap-allocated and runtime-sized (600 epochs at the default
//! window), so there is no compile-time epoch parameter.

use std::time::Duration;

use super::clock::Clock;

/// One entry of a time series: an accumulator updates are folded into.
pub(crate) trait Epoch: Clone + Default {
    type Update;

    fn report(&mut self, update: &Self::Update);

    fn is_empty(&self) -> bool;
}

pub(crate) struct TimeSeriesTracker<E: Epoch> {
    clock: Clock,
    epoch_ticks: i64,
    entries: Vec<E>,
    /// Ring index of the current epoch.
    current: usize,
    /// Wall-clock epoch number of `current`.
    last_epoch: i64,
}

impl<E: Epoch> TimeSeriesTracker<E> {
    pub fn new(clock: Clock, window: Duration, epochs: usize) -> Self {
        assert!(epochs > 0);
        let epoch_ticks = std::cmp::max(clock.ticks_in(window) / epochs as i64, 1);
        Self {
            clock,
            epoch_ticks,
            entries: vec![E::default(); epochs],
            current: 0,
            last_epoch: clock.now_ticks() / epoch_ticks,
        }
    }

    #[inline]
    pub fn epoch_ticks(&self) -> i64 {
        self.epoch_ticks
    }

    /// Fold `update` into the current epoch's entry. Returns true when the
    /// wall clock rotated to a new epoch first.
    pub fn report(&mut self, update: &E::Update) -> bool {
        let rotated = self.update_clock();
        self.entries[self.current].report(update);
        rotated
    }

    /// The entry `offset` epochs before the current one (0 = current).
    pub fn epoch_at_offset(&self, offset: usize) -> &E {
        let n = self.entries.len();
        debug_assert!(offset < n);
        &self.entries[(self.current + n - offset % n) % n]
    }

    /// Visit entries from the current epoch backwards, at most `limit`
    /// (`None` = the whole window), as `f(offset, timestamp_ticks, entry)`.
    pub fn iter_backwards(&self, limit: Option<usize>, mut f: impl FnMut(usize, i64, &E)) {
        let n = self.entries.len();
        let lim = limit.map_or(n, |l| std::cmp::min(l, n));
        for offset in 0..lim {
            let idx = (self.current + n - offset) % n;
            let ts = (self.last_epoch - offset as i64) * self.epoch_ticks;
            f(offset, ts, &self.entries[idx]);
        }
    }

    /// Visit entries oldest-first, as `f(offset, timestamp_ticks, entry)`
    /// with offset 0 the oldest slot in the window.
    pub fn iter_forward(&self, skip_empty: bool, mut f: impl FnMut(usize, i64, &E)) {
        let n = self.entries.len();
        for i in 0..n {
            let back = n - 1 - i;
            let e = &self.entries[(self.current + n - back) % n];
            if skip_empty && e.is_empty() {
                continue;
            }
            let ts = (self.last_epoch - back as i64) * self.epoch_ticks;
            f(i, ts, e);
        }
    }

    fn update_clock(&mut self) -> bool {
        let now_epoch = self.clock.now_ticks() / self.epoch_ticks;
        if now_epoch <= self.last_epoch {
            return false;
        }
        let n = self.entries.len();
        let advance = std::cmp::min((now_epoch - self.last_epoch) as usize, n);
        for _ in 0..advance {
            self.current = (self.current + 1) % n;
            self.entries[self.current] = E::default();
        }
        self.last_epoch = now_epoch;
        true
    }
}
