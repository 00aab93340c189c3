use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Injectable time source: a tick counter plus its frequency. All
/// time-series windows are measured in `now` ticks so tests can substitute
/// a fake counter.
#[derive(Clone, Copy)]
pub struct Clock {
    pub now: fn() -> i64,
    pub freq: fn() -> i64,
}

impl Clock {
    /// Monotonic nanosecond clock based on `Instant`.
    #[must_use]
    pub fn system() -> Self {
        Clock {
            now: system_now,
            freq: || 1_000_000_000,
        }
    }

    #[inline]
    #[must_use]
    pub fn now_ticks(&self) -> i64 {
        (self.now)()
    }

    #[inline]
    #[must_use]
    pub fn ticks_per_second(&self) -> i64 {
        (self.freq)()
    }

    /// Ticks in the given duration (rounded down).
    #[must_use]
    pub fn ticks_in(&self, d: Duration) -> i64 {
        (d.as_secs_f64() * self.ticks_per_second() as f64) as i64
    }

    /// Ticks converted to milliseconds (rounded down).
    #[must_use]
    pub fn ticks_to_ms(&self, ticks: i64) -> i64 {
        let freq = self.ticks_per_second();
        debug_assert!(freq > 0);
        // Split to avoid overflow for large tick values.
        (ticks / freq) * 1000 + (ticks % freq) * 1000 / freq
    }
}

fn system_now() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    i64::try_from(start.elapsed().as_nanos()).unwrap_or(i64::MAX)
}
