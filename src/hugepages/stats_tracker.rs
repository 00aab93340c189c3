//! Demand-history tracking behind the adaptive skip-subrelease policy:
//! a time series of filler statistics sampled at the demand envelope, plus
//! bookkeeping that confirms (or keeps pending) past decisions to skip a
//! subrelease.

use std::fmt;
use std::ops::AddAssign;
use std::time::Duration;

use super::clock::Clock;
use super::pages::{HugeLength, Length};
use super::stats::{safe_div, PbtxtRegion};
use super::timeseries::{Epoch, TimeSeriesTracker};

/// Demand-history windows consulted before subreleasing. All zero disables
/// the skip-subrelease feature.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipSubreleaseIntervals {
    /// Locates the recent demand peak.
    pub peak_interval: Duration,
    /// Locates recent short-term demand fluctuation.
    pub short_interval: Duration,
    /// Locates the recent long-term demand trend.
    pub long_interval: Duration,
}

impl SkipSubreleaseIntervals {
    #[must_use]
    pub fn is_peak_interval_set(&self) -> bool {
        self.peak_interval != Duration::ZERO
    }

    #[must_use]
    pub fn skip_subrelease_enabled(&self) -> bool {
        self.peak_interval != Duration::ZERO
            || self.short_interval != Duration::ZERO
            || self.long_interval != Duration::ZERO
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SubreleaseStats {
    // Cumulative since startup.
    pub total_pages_subreleased: Length,
    pub total_partial_alloc_pages_subreleased: Length,
    // Since the last epoch rotation.
    pub num_pages_subreleased: Length,
    pub num_partial_alloc_pages_subreleased: Length,
    pub total_hugepages_broken: HugeLength,
    pub num_hugepages_broken: HugeLength,

    is_limit_hit: bool,
    // Limit-related stats are cumulative since startup only.
    pub total_pages_subreleased_due_to_limit: Length,
    pub total_hugepages_broken_due_to_limit: HugeLength,
}

impl SubreleaseStats {
    pub fn reset(&mut self) {
        self.total_pages_subreleased += self.num_pages_subreleased;
        self.total_partial_alloc_pages_subreleased += self.num_partial_alloc_pages_subreleased;
        self.total_hugepages_broken += self.num_hugepages_broken;
        self.num_pages_subreleased = Length::new(0);
        self.num_partial_alloc_pages_subreleased = Length::new(0);
        self.num_hugepages_broken = HugeLength::new(0);
    }

    /// Must be set at the beginning of each subrelease request.
    pub fn set_limit_hit(&mut self, value: bool) {
        self.is_limit_hit = value;
    }

    /// Only meaningful while a release driven by `set_limit_hit` is in
    /// progress.
    #[must_use]
    pub fn limit_hit(&self) -> bool {
        self.is_limit_hit
    }
}

/// Pages and occurrence count of skipped subreleases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkippedSubreleaseDecision {
    pub pages: Length,
    pub count: usize,
}

impl SkippedSubreleaseDecision {
    #[must_use]
    pub fn single(pages: Length) -> Self {
        Self { pages, count: 1 }
    }
}

impl AddAssign for SkippedSubreleaseDecision {
    fn add_assign(&mut self, rhs: Self) {
        self.pages += rhs.pages;
        self.count += rhs.count;
    }
}

#[derive(Clone, Copy, Default)]
struct SkippedSubreleaseUpdate {
    /// A decision made at this time step: how much did we decide not to
    /// release?
    decision: SkippedSubreleaseDecision,
    /// What future demand has to reach for the decision to be correct.
    num_pages_at_decision: Length,
    /// Epochs from the decision until it is determined incorrect.
    correctness_interval_epochs: i64,
    /// A demand peak confirmed at this time step; earlier decisions with
    /// `num_pages_at_decision` at or below it are settled and never
    /// revisited.
    confirmed_peak: Length,
}

#[derive(Clone, Default)]
struct SkippedSubreleaseEntry {
    decisions: SkippedSubreleaseDecision,
    max_num_pages_at_decision: Length,
    correctness_interval_epochs: i64,
    max_confirmed_peak: Length,
}

impl Epoch for SkippedSubreleaseEntry {
    type Update = SkippedSubreleaseUpdate;

    fn report(&mut self, u: &SkippedSubreleaseUpdate) {
        self.decisions += u.decision;
        self.correctness_interval_epochs =
            std::cmp::max(self.correctness_interval_epochs, u.correctness_interval_epochs);
        self.max_num_pages_at_decision =
            std::cmp::max(self.max_num_pages_at_decision, u.num_pages_at_decision);
        self.max_confirmed_peak = std::cmp::max(self.max_confirmed_peak, u.confirmed_peak);
    }

    fn is_empty(&self) -> bool {
        self.decisions.count == 0 && self.max_confirmed_peak == Length::new(0)
    }
}

/// Tracks correctness of skipped-subrelease decisions over time. A decision
/// becomes "correctly skipped" once a demand peak at least as high as the
/// demand at decision time is confirmed within the decision's own window;
/// confirmation is monotonic and never reverts.
pub(crate) struct SkippedSubreleaseCorrectnessTracker {
    clock: Clock,
    /// The largest peak processed this epoch, so correctly predicted
    /// decisions are not double-counted.
    last_confirmed_peak: Length,
    total_skipped: SkippedSubreleaseDecision,
    correctly_skipped: SkippedSubreleaseDecision,
    pending_skipped: SkippedSubreleaseDecision,
    tracker: TimeSeriesTracker<SkippedSubreleaseEntry>,
}

impl SkippedSubreleaseCorrectnessTracker {
    pub fn new(clock: Clock, window: Duration, epochs: usize) -> Self {
        Self {
            clock,
            last_confirmed_peak: Length::new(0),
            total_skipped: SkippedSubreleaseDecision::default(),
            correctly_skipped: SkippedSubreleaseDecision::default(),
            pending_skipped: SkippedSubreleaseDecision::default(),
            tracker: TimeSeriesTracker::new(clock, window, epochs),
        }
    }

    pub fn report_skipped_subrelease_pages(
        &mut self,
        skipped_pages: Length,
        peak_pages: Length,
        expected_time_until_next_peak: Duration,
    ) {
        let decision = SkippedSubreleaseDecision::single(skipped_pages);
        self.total_skipped += decision;
        self.pending_skipped += decision;

        let update = SkippedSubreleaseUpdate {
            decision,
            num_pages_at_decision: peak_pages,
            correctness_interval_epochs: self.clock.ticks_in(expected_time_until_next_peak)
                / self.tracker.epoch_ticks(),
            confirmed_peak: Length::new(0),
        };
        self.tracker.report(&update);
    }

    pub fn report_updated_peak(&mut self, current_peak: Length) {
        // Record this peak for the current epoch (so correct predictions are
        // not double-counted later) and advance the tracker.
        let update = SkippedSubreleaseUpdate {
            confirmed_peak: current_peak,
            ..SkippedSubreleaseUpdate::default()
        };
        if self.tracker.report(&update) {
            self.last_confirmed_peak = Length::new(0);
        }

        // Recompute currently pending decisions.
        let mut pending = SkippedSubreleaseDecision::default();
        let mut correct = SkippedSubreleaseDecision::default();
        let mut largest_peak_already_confirmed = self.last_confirmed_peak;

        self.tracker.iter_backwards(None, |offset, _ts, e| {
            // Decisions in the current epoch are never cleared.
            if offset == 0 {
                return;
            }

            if e.decisions.count > 0
                && e.max_num_pages_at_decision > largest_peak_already_confirmed
                && (offset as i64) <= e.correctness_interval_epochs
            {
                if e.max_num_pages_at_decision <= current_peak {
                    // Confirmed correct, and not confirmed by an earlier
                    // peak yet.
                    correct += e.decisions;
                } else {
                    pending += e.decisions;
                }
            }

            // Peaks confirmed in this epoch settle earlier decisions; track
            // the largest so they are not cleared again.
            largest_peak_already_confirmed =
                std::cmp::max(largest_peak_already_confirmed, e.max_confirmed_peak);
        });

        self.correctly_skipped += correct;
        self.pending_skipped = pending;
        self.last_confirmed_peak = std::cmp::max(self.last_confirmed_peak, current_peak);
    }

    #[inline]
    pub fn total_skipped(&self) -> SkippedSubreleaseDecision {
        self.total_skipped
    }

    #[inline]
    pub fn correctly_skipped(&self) -> SkippedSubreleaseDecision {
        self.correctly_skipped
    }

    #[inline]
    pub fn pending_skipped(&self) -> SkippedSubreleaseDecision {
        self.pending_skipped
    }
}

/// Huge-page pool a filler sample attributes counts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillerPool {
    Regular = 0,
    Donated = 1,
    PartialReleased = 2,
    Released = 3,
}

pub const NUM_FILLER_POOLS: usize = 4;

/// One filler statistics sample.
#[derive(Clone, Copy, Debug, Default)]
pub struct FillerStats {
    pub num_pages: Length,
    pub free_pages: Length,
    pub unmapped_pages: Length,
    pub used_pages_in_subreleased_huge_pages: Length,
    pub huge_pages: [HugeLength; NUM_FILLER_POOLS],
    pub num_pages_subreleased: Length,
    pub num_partial_alloc_pages_subreleased: Length,
    pub num_hugepages_broken: HugeLength,
}

impl FillerStats {
    #[must_use]
    pub fn total_huge_pages(&self) -> HugeLength {
        let mut total = HugeLength::new(0);
        for hp in self.huge_pages {
            total += hp;
        }
        total
    }
}

/// Sample points captured within each epoch to approximate the envelope of
/// demand and huge-page usage.
#[derive(Clone, Copy)]
enum EnvelopePoint {
    MinDemand = 0,
    MaxDemand = 1,
    MinHugePages = 2,
    MaxHugePages = 3,
}

const NUM_ENVELOPE_POINTS: usize = 4;

const ENVELOPE_LABELS: [&str; NUM_ENVELOPE_POINTS] = [
    "at_minimum_demand",
    "at_maximum_demand",
    "at_minimum_huge_pages",
    "at_maximum_huge_pages",
];

#[derive(Clone)]
struct FillerStatsEntry {
    stats: [FillerStats; NUM_ENVELOPE_POINTS],
    min_free_pages: Length,
    min_free_backed_pages: Length,
    num_pages_subreleased: Length,
    num_partial_alloc_pages_subreleased: Length,
    num_hugepages_broken: HugeLength,
}

impl Default for FillerStatsEntry {
    fn default() -> Self {
        Self {
            stats: [FillerStats::default(); NUM_ENVELOPE_POINTS],
            min_free_pages: Length::MAX,
            min_free_backed_pages: Length::MAX,
            num_pages_subreleased: Length::new(0),
            num_partial_alloc_pages_subreleased: Length::new(0),
            num_hugepages_broken: HugeLength::new(0),
        }
    }
}

impl FillerStatsEntry {
    fn at(&self, point: EnvelopePoint) -> &FillerStats {
        &self.stats[point as usize]
    }
}

impl Epoch for FillerStatsEntry {
    type Update = FillerStats;

    fn report(&mut self, e: &FillerStats) {
        if self.is_empty() {
            self.stats = [*e; NUM_ENVELOPE_POINTS];
        }
        if e.num_pages < self.at(EnvelopePoint::MinDemand).num_pages {
            self.stats[EnvelopePoint::MinDemand as usize] = *e;
        }
        if e.num_pages > self.at(EnvelopePoint::MaxDemand).num_pages {
            self.stats[EnvelopePoint::MaxDemand as usize] = *e;
        }
        if e.total_huge_pages() < self.at(EnvelopePoint::MinHugePages).total_huge_pages() {
            self.stats[EnvelopePoint::MinHugePages as usize] = *e;
        }
        if e.total_huge_pages() > self.at(EnvelopePoint::MaxHugePages).total_huge_pages() {
            self.stats[EnvelopePoint::MaxHugePages as usize] = *e;
        }

        self.min_free_pages =
            std::cmp::min(self.min_free_pages, e.free_pages + e.unmapped_pages);
        self.min_free_backed_pages = std::cmp::min(self.min_free_backed_pages, e.free_pages);

        self.num_pages_subreleased += e.num_pages_subreleased;
        self.num_partial_alloc_pages_subreleased += e.num_partial_alloc_pages_subreleased;
        self.num_hugepages_broken += e.num_hugepages_broken;
    }

    fn is_empty(&self) -> bool {
        self.min_free_pages == Length::MAX
    }
}

/// Minimum free pages observed over a window; `free` counts released pages
/// too, `free_backed` only backed ones (realized fragmentation).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NumberOfFreePages {
    pub free: Length,
    pub free_backed: Length,
}

/// Filler statistics over a sliding time window, sampled at the demand
/// envelope of each epoch, plus the skipped-subrelease correctness tracker
/// fed from confirmed demand peaks.
pub struct FillerStatsTracker {
    clock: Clock,
    summary_interval: Duration,
    window: Duration,
    epochs: usize,
    tracker: TimeSeriesTracker<FillerStatsEntry>,
    skipped_subrelease_correctness: SkippedSubreleaseCorrectnessTracker,
    // Most recent skip intervals and expected next peak, for reporting only.
    last_skip_subrelease_intervals: SkipSubreleaseIntervals,
    last_next_peak_interval: Duration,
}

impl FillerStatsTracker {
    pub fn new(clock: Clock, window: Duration, summary_interval: Duration, epochs: usize) -> Self {
        // The summary interval drives both realized-fragmentation evaluation
        // and skipped-subrelease correctness; the window must cover it.
        assert!(summary_interval <= window);
        Self {
            clock,
            summary_interval,
            window,
            epochs,
            tracker: TimeSeriesTracker::new(clock, window, epochs),
            skipped_subrelease_correctness: SkippedSubreleaseCorrectnessTracker::new(
                clock, window, epochs,
            ),
            last_skip_subrelease_intervals: SkipSubreleaseIntervals::default(),
            last_next_peak_interval: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn epoch_length(&self) -> Duration {
        self.window / self.epochs as u32
    }

    pub fn report(&mut self, stats: FillerStats) {
        if self.tracker.report(&stats) && self.pending_skipped().count > 0 {
            // Use the peak within the just-completed epoch to confirm the
            // correctness of recent subrelease decisions.
            let prev_peak = self
                .tracker
                .epoch_at_offset(1)
                .at(EnvelopePoint::MaxDemand)
                .num_pages;
            self.skipped_subrelease_correctness
                .report_updated_peak(std::cmp::max(stats.num_pages, prev_peak));
        }
    }

    /// The maximum demand observed within the last `peak_interval`. Used to
    /// stop subreleasing while mapped memory is below a recent peak.
    pub fn get_recent_peak(&mut self, peak_interval: Duration) -> Length {
        self.last_skip_subrelease_intervals.peak_interval =
            std::cmp::min(peak_interval, self.epoch_length() * self.epochs as u32);

        let num_epochs = self.epochs_in(peak_interval);
        let mut max_demand_pages = Length::new(0);
        self.tracker.iter_backwards(Some(num_epochs), |_offset, _ts, e| {
            if !e.is_empty() {
                max_demand_pages =
                    std::cmp::max(max_demand_pages, e.at(EnvelopePoint::MaxDemand).num_pages);
            }
        });
        max_demand_pages
    }

    /// Demand requirement from history: the largest short-term fluctuation
    /// (max − min demand within one epoch, over `short_interval`) plus the
    /// long-term trend (largest epoch minimum over `long_interval`), capped
    /// by the largest demand peak in the whole window so the sum cannot
    /// exceed anything ever observed.
    pub fn get_recent_demand(&mut self, short_interval: Duration, long_interval: Duration) -> Length {
        if short_interval != Duration::ZERO && long_interval != Duration::ZERO {
            // A non-recent short-term spike must not outlive the long trend.
            assert!(short_interval <= long_interval);
        }
        let window = self.epoch_length() * self.epochs as u32;
        self.last_skip_subrelease_intervals.short_interval =
            std::cmp::min(short_interval, window);
        self.last_skip_subrelease_intervals.long_interval = std::cmp::min(long_interval, window);

        let mut short_term_fluctuation = Length::new(0);
        self.tracker
            .iter_backwards(Some(self.epochs_in(short_interval)), |_o, _ts, e| {
                if !e.is_empty() {
                    let diff = e.at(EnvelopePoint::MaxDemand).num_pages
                        - e.at(EnvelopePoint::MinDemand).num_pages;
                    short_term_fluctuation = std::cmp::max(short_term_fluctuation, diff);
                }
            });

        let mut long_term_trend = Length::new(0);
        self.tracker
            .iter_backwards(Some(self.epochs_in(long_interval)), |_o, _ts, e| {
                if !e.is_empty() {
                    long_term_trend =
                        std::cmp::max(long_term_trend, e.at(EnvelopePoint::MinDemand).num_pages);
                }
            });

        let mut demand_peak = Length::new(0);
        self.tracker.iter_backwards(None, |_o, _ts, e| {
            if !e.is_empty() {
                demand_peak =
                    std::cmp::max(demand_peak, e.at(EnvelopePoint::MaxDemand).num_pages);
            }
        });

        std::cmp::min(demand_peak, short_term_fluctuation + long_term_trend)
    }

    /// Report a skipped subrelease, evaluated against peaks within the
    /// realized-fragmentation (summary) interval.
    pub fn report_skipped_subrelease_pages(&mut self, pages: Length, peak_pages: Length) {
        self.report_skipped_subrelease_pages_in(pages, peak_pages, self.summary_interval);
    }

    /// Report a skipped subrelease, evaluated against peaks within the given
    /// interval.
    pub fn report_skipped_subrelease_pages_in(
        &mut self,
        pages: Length,
        peak_pages: Length,
        next_peak_interval: Duration,
    ) {
        if pages == Length::new(0) {
            return;
        }
        self.last_next_peak_interval = next_peak_interval;
        self.skipped_subrelease_correctness.report_skipped_subrelease_pages(
            pages,
            peak_pages,
            next_peak_interval,
        );
    }

    #[inline]
    #[must_use]
    pub fn total_skipped(&self) -> SkippedSubreleaseDecision {
        self.skipped_subrelease_correctness.total_skipped()
    }

    #[inline]
    #[must_use]
    pub fn correctly_skipped(&self) -> SkippedSubreleaseDecision {
        self.skipped_subrelease_correctness.correctly_skipped()
    }

    #[inline]
    #[must_use]
    pub fn pending_skipped(&self) -> SkippedSubreleaseDecision {
        self.skipped_subrelease_correctness.pending_skipped()
    }

    /// Minimum free pages throughout the last `w` of the tracked period.
    #[must_use]
    pub fn min_free_pages(&self, w: Duration) -> NumberOfFreePages {
        let mut mins = NumberOfFreePages {
            free: Length::MAX,
            free_backed: Length::MAX,
        };
        let num_epochs = self.epochs_in(w);
        self.tracker.iter_backwards(Some(num_epochs), |_o, _ts, e| {
            if !e.is_empty() {
                mins.free = std::cmp::min(mins.free, e.min_free_pages);
                mins.free_backed = std::cmp::min(mins.free_backed, e.min_free_backed_pages);
            }
        });
        if mins.free == Length::MAX {
            mins.free = Length::new(0);
        }
        if mins.free_backed == Length::MAX {
            mins.free_backed = Length::new(0);
        }
        mins
    }

    pub fn print(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let free_pages = self.min_free_pages(self.summary_interval);
        writeln!(
            out,
            "HugePageFiller: time series over {} min interval\n",
            self.summary_interval.as_secs() / 60
        )?;
        // Realized fragmentation: backed minimum free pages over the summary
        // interval. Printed for convenience but not part of the pbtxt surface.
        writeln!(
            out,
            "HugePageFiller: realized fragmentation: {:.1} MiB",
            free_pages.free_backed.in_bytes() as f64 / (1024.0 * 1024.0)
        )?;
        writeln!(
            out,
            "HugePageFiller: minimum free pages: {} ({} backed)",
            free_pages.free.raw_num(),
            free_pages.free_backed.raw_num()
        )?;

        let mut at_peak_demand = FillerStatsEntry::default();
        let mut at_peak_hps = FillerStatsEntry::default();
        self.tracker
            .iter_backwards(Some(self.epochs_in(self.summary_interval)), |_o, _ts, e| {
                if !e.is_empty() {
                    if at_peak_demand.is_empty()
                        || at_peak_demand.at(EnvelopePoint::MaxDemand).num_pages
                            < e.at(EnvelopePoint::MaxDemand).num_pages
                    {
                        at_peak_demand = e.clone();
                    }
                    if at_peak_hps.is_empty()
                        || at_peak_hps.at(EnvelopePoint::MaxHugePages).total_huge_pages()
                            < e.at(EnvelopePoint::MaxHugePages).total_huge_pages()
                    {
                        at_peak_hps = e.clone();
                    }
                }
            });

        for (label, entry) in [("demand", &at_peak_demand), ("hps", &at_peak_hps)] {
            let s = entry.at(EnvelopePoint::MaxDemand);
            writeln!(
                out,
                "HugePageFiller: at peak {label}: {} pages (and {} free, {} unmapped)",
                s.num_pages.raw_num(),
                s.free_pages.raw_num(),
                s.unmapped_pages.raw_num()
            )?;
            writeln!(
                out,
                "HugePageFiller: at peak {label}: {} hps ({} regular, {} donated, \
                 {} partial, {} released)",
                s.total_huge_pages().raw_num(),
                s.huge_pages[FillerPool::Regular as usize].raw_num(),
                s.huge_pages[FillerPool::Donated as usize].raw_num(),
                s.huge_pages[FillerPool::PartialReleased as usize].raw_num(),
                s.huge_pages[FillerPool::Released as usize].raw_num()
            )?;
        }

        writeln!(
            out,
            "\nHugePageFiller: Since the start of the execution, {} subreleases ({} pages) \
             were skipped due to either recent ({}s) peaks, or the sum of short-term ({}s) \
             fluctuations and long-term ({}s) trends.",
            self.total_skipped().count,
            self.total_skipped().pages.raw_num(),
            self.last_skip_subrelease_intervals.peak_interval.as_secs(),
            self.last_skip_subrelease_intervals.short_interval.as_secs(),
            self.last_skip_subrelease_intervals.long_interval.as_secs()
        )?;

        let skipped_pages = self.total_skipped().pages - self.pending_skipped().pages;
        let correctly_skipped_pages_pct = safe_div(
            100.0 * self.correctly_skipped().pages.raw_num() as f64,
            skipped_pages.raw_num() as f64,
        );
        let skipped_count = self.total_skipped().count - self.pending_skipped().count;
        let correctly_skipped_count_pct = safe_div(
            100.0 * self.correctly_skipped().count as f64,
            skipped_count as f64,
        );
        writeln!(
            out,
            "HugePageFiller: {:.4}% of decisions confirmed correct, {} pending ({:.4}% of \
             pages, {} pending), as per anticipated {}s realized fragmentation.",
            correctly_skipped_count_pct,
            self.pending_skipped().count,
            correctly_skipped_pages_pct,
            self.pending_skipped().pages.raw_num(),
            self.last_next_peak_interval.as_secs()
        )?;

        let mut total_subreleased = Length::new(0);
        let mut total_partial = Length::new(0);
        let mut total_broken = HugeLength::new(0);
        self.tracker.iter_forward(true, |_o, _ts, e| {
            total_subreleased += e.num_pages_subreleased;
            total_partial += e.num_partial_alloc_pages_subreleased;
            total_broken += e.num_hugepages_broken;
        });
        writeln!(
            out,
            "HugePageFiller: Subrelease stats last {} min: total {} pages subreleased ({} \
             pages from partial allocs), {} hugepages broken",
            self.window.as_secs() / 60,
            total_subreleased.raw_num(),
            total_partial.raw_num(),
            total_broken.raw_num()
        )
    }

    pub fn print_in_pbtxt(&self, hpaa: &mut PbtxtRegion<'_>) -> fmt::Result {
        hpaa.sub_region("filler_skipped_subrelease", |r| {
            r.print_i64(
                "skipped_subrelease_interval_ms",
                self.last_skip_subrelease_intervals.peak_interval.as_millis() as i64,
            )?;
            r.print_i64(
                "skipped_subrelease_short_interval_ms",
                self.last_skip_subrelease_intervals.short_interval.as_millis() as i64,
            )?;
            r.print_i64(
                "skipped_subrelease_long_interval_ms",
                self.last_skip_subrelease_intervals.long_interval.as_millis() as i64,
            )?;
            r.print_i64("skipped_subrelease_pages", self.total_skipped().pages.raw_num() as i64)?;
            r.print_i64(
                "correctly_skipped_subrelease_pages",
                self.correctly_skipped().pages.raw_num() as i64,
            )?;
            r.print_i64(
                "pending_skipped_subrelease_pages",
                self.pending_skipped().pages.raw_num() as i64,
            )?;
            r.print_i64("skipped_subrelease_count", self.total_skipped().count as i64)?;
            r.print_i64(
                "correctly_skipped_subrelease_count",
                self.correctly_skipped().count as i64,
            )?;
            r.print_i64(
                "pending_skipped_subrelease_count",
                self.pending_skipped().count as i64,
            )?;
            r.print_i64(
                "next_peak_interval_ms",
                self.last_next_peak_interval.as_millis() as i64,
            )
        })?;

        hpaa.sub_region("filler_stats_timeseries", |r| {
            r.print_i64("window_ms", self.epoch_length().as_millis() as i64)?;
            r.print_i64("epochs", self.epochs as i64)?;

            let free_pages = self.min_free_pages(self.summary_interval);
            r.print_i64(
                "min_free_pages_interval_ms",
                self.summary_interval.as_millis() as i64,
            )?;
            r.print_i64("min_free_pages", free_pages.free.raw_num() as i64)?;
            r.print_i64("min_free_backed_pages", free_pages.free_backed.raw_num() as i64)?;

            let mut result = Ok(());
            self.tracker.iter_forward(true, |offset, ts, e| {
                if result.is_err() {
                    return;
                }
                result = r.sub_region("measurements", |m| {
                    m.print_i64("epoch", offset as i64)?;
                    m.print_i64("timestamp_ms", self.clock.ticks_to_ms(ts))?;
                    m.print_i64("min_free_pages", e.min_free_pages.raw_num() as i64)?;
                    m.print_i64(
                        "min_free_backed_pages",
                        e.min_free_backed_pages.raw_num() as i64,
                    )?;
                    m.print_i64(
                        "num_pages_subreleased",
                        e.num_pages_subreleased.raw_num() as i64,
                    )?;
                    m.print_i64(
                        "num_hugepages_broken",
                        e.num_hugepages_broken.raw_num() as i64,
                    )?;
                    m.print_i64(
                        "partial_alloc_pages_subreleased",
                        e.num_partial_alloc_pages_subreleased.raw_num() as i64,
                    )?;
                    for (i, label) in ENVELOPE_LABELS.iter().enumerate() {
                        let stats = &e.stats[i];
                        m.sub_region(label, |p| {
                            p.print_i64("num_pages", stats.num_pages.raw_num() as i64)?;
                            p.print_i64(
                                "regular_huge_pages",
                                stats.huge_pages[FillerPool::Regular as usize].raw_num() as i64,
                            )?;
                            p.print_i64(
                                "donated_huge_pages",
                                stats.huge_pages[FillerPool::Donated as usize].raw_num() as i64,
                            )?;
                            p.print_i64(
                                "partial_released_huge_pages",
                                stats.huge_pages[FillerPool::PartialReleased as usize].raw_num()
                                    as i64,
                            )?;
                            p.print_i64(
                                "released_huge_pages",
                                stats.huge_pages[FillerPool::Released as usize].raw_num() as i64,
                            )?;
                            p.print_i64(
                                "used_pages_in_subreleased_huge_pages",
                                stats.used_pages_in_subreleased_huge_pages.raw_num() as i64,
                            )
                        })?;
                    }
                    Ok(())
                });
            });
            result
        })
    }

    fn epochs_in(&self, interval: Duration) -> usize {
        let n = self.clock.ticks_in(interval) / self.tracker.epoch_ticks();
        std::cmp::min(n.max(0) as usize, self.epochs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    static FAKE_NOW: AtomicI64 = AtomicI64::new(0);

    fn fake_clock() -> Clock {
        Clock {
            now: || FAKE_NOW.load(Ordering::Relaxed),
            freq: || 1_000_000_000,
        }
    }

    fn advance_secs(s: i64) {
        FAKE_NOW.fetch_add(s * 1_000_000_000, Ordering::Relaxed);
    }

    /// 16 one-second epochs.
    fn tracker() -> FillerStatsTracker {
        FillerStatsTracker::new(
            fake_clock(),
            Duration::from_secs(16),
            Duration::from_secs(8),
            16,
        )
    }

    fn demand(pages: usize) -> FillerStats {
        FillerStats {
            num_pages: Length::new(pages),
            free_pages: Length::new(32),
            unmapped_pages: Length::new(16),
            ..FillerStats::default()
        }
    }

    #[test]
    fn test_recent_peak_over_window() {
        let _guard = crate::hugepages::TEST_MUTEX.write().unwrap();
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mut t = tracker();
        for pages in [100, 200, 150, 100, 100] {
            t.report(demand(pages));
            advance_secs(1);
        }
        assert_eq!(t.get_recent_peak(Duration::from_secs(5)), Length::new(200));
        // A window too short to include the 200-page epoch sees only 100.
        assert_eq!(t.get_recent_peak(Duration::from_secs(2)), Length::new(100));
    }

    #[test]
    fn test_recent_demand_fluctuation_plus_trend() {
        let _guard = crate::hugepages::TEST_MUTEX.write().unwrap();
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mut t = tracker();
        // Epoch 1: min 50, max 120. Epoch 2: min 80, max 90.
        t.report(demand(120));
        t.report(demand(50));
        advance_secs(1);
        t.report(demand(80));
        t.report(demand(90));
        advance_secs(1);
        t.report(demand(80));

        // Fluctuation 70 (epoch 1) + trend 80 (epoch 2) = 150, but the
        // windowed demand peak caps the result at 120.
        let required = t.get_recent_demand(Duration::from_secs(10), Duration::from_secs(10));
        assert_eq!(required, Length::new(120));

        // With a short interval covering only the last two epochs the
        // fluctuation is 10, trend still 80.
        let required = t.get_recent_demand(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(required, Length::new(90));
    }

    #[test]
    fn test_min_free_pages_window() {
        let _guard = crate::hugepages::TEST_MUTEX.write().unwrap();
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mut t = tracker();
        t.report(FillerStats {
            num_pages: Length::new(10),
            free_pages: Length::new(5),
            unmapped_pages: Length::new(7),
            ..FillerStats::default()
        });
        advance_secs(1);
        t.report(FillerStats {
            num_pages: Length::new(10),
            free_pages: Length::new(9),
            unmapped_pages: Length::new(1),
            ..FillerStats::default()
        });
        let mins = t.min_free_pages(Duration::from_secs(8));
        assert_eq!(mins.free, Length::new(10));
        assert_eq!(mins.free_backed, Length::new(5));
    }

    #[test]
    fn test_min_free_pages_empty_window() {
        let _guard = crate::hugepages::TEST_MUTEX.write().unwrap();
        FAKE_NOW.store(0, Ordering::Relaxed);
        let t = tracker();
        assert_eq!(t.min_free_pages(Duration::from_secs(8)), NumberOfFreePages::default());
    }

    #[test]
    fn test_skipped_decision_confirmed_by_later_peak() {
        let _guard = crate::hugepages::TEST_MUTEX.write().unwrap();
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mut t = tracker();
        t.report(demand(100));
        // Skip 40 pages, correct if demand rises to 150 again soon.
        t.report_skipped_subrelease_pages(Length::new(40), Length::new(150));
        assert_eq!(t.pending_skipped().pages, Length::new(40));
        assert_eq!(t.total_skipped().count, 1);

        // Demand does rise past 150 in the next epoch; the rotation after
        // that confirms the decision.
        advance_secs(1);
        t.report(demand(160));
        advance_secs(1);
        t.report(demand(10));
        assert_eq!(t.correctly_skipped().pages, Length::new(40));
        assert_eq!(t.pending_skipped().pages, Length::new(0));
    }

    #[test]
    fn test_skipped_decision_expires_outside_interval() {
        let _guard = crate::hugepages::TEST_MUTEX.write().unwrap();
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mut t = tracker();
        t.report(demand(100));
        // Correctness window of 8s (the summary interval).
        t.report_skipped_subrelease_pages(Length::new(40), Length::new(150));

        // Demand never recovers within the window.
        for _ in 0..10 {
            advance_secs(1);
            t.report(demand(10));
        }
        assert_eq!(t.correctly_skipped().pages, Length::new(0));
        // The decision aged out of its correctness interval; it is no
        // longer pending, and it never became correct.
        assert_eq!(t.pending_skipped().pages, Length::new(0));
        assert_eq!(t.total_skipped().pages, Length::new(40));
    }

    #[test]
    fn test_confirmed_peak_not_double_counted() {
        let _guard = crate::hugepages::TEST_MUTEX.write().unwrap();
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mut t = tracker();
        t.report(demand(100));
        t.report_skipped_subrelease_pages(Length::new(40), Length::new(150));
        advance_secs(1);
        t.report(demand(160));
        advance_secs(1);
        t.report(demand(10));
        assert_eq!(t.correctly_skipped().pages, Length::new(40));

        // Later peaks must not re-confirm the same decision.
        advance_secs(1);
        t.report(demand(200));
        advance_secs(1);
        t.report(demand(10));
        assert_eq!(t.correctly_skipped().pages, Length::new(40));
        assert_eq!(t.correctly_skipped().count, 1);
    }

    #[test]
    fn test_zero_page_skip_not_recorded() {
        let _guard = crate::hugepages::TEST_MUTEX.write().unwrap();
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mut t = tracker();
        t.report_skipped_subrelease_pages(Length::new(0), Length::new(100));
        assert_eq!(t.total_skipped().count, 0);
    }

    #[test]
    fn test_subrelease_stats_reset_rolls_into_totals() {
        let mut s = SubreleaseStats::default();
        s.num_pages_subreleased = Length::new(10);
        s.num_hugepages_broken = HugeLength::new(2);
        s.reset();
        assert_eq!(s.total_pages_subreleased, Length::new(10));
        assert_eq!(s.total_hugepages_broken, HugeLength::new(2));
        assert_eq!(s.num_pages_subreleased, Length::new(0));
        assert_eq!(s.num_hugepages_broken, HugeLength::new(0));
    }

    #[test]
    fn test_intervals_enablement() {
        assert!(!SkipSubreleaseIntervals::default().skip_subrelease_enabled());
        let peak = SkipSubreleaseIntervals {
            peak_interval: Duration::from_secs(1),
            ..SkipSubreleaseIntervals::default()
        };
        assert!(peak.skip_subrelease_enabled());
        assert!(peak.is_peak_interval_set());
        let trend = SkipSubreleaseIntervals {
            long_interval: Duration::from_secs(1),
            ..SkipSubreleaseIntervals::default()
        };
        assert!(trend.skip_subrelease_enabled());
        assert!(!trend.is_peak_interval_set());
    }

    #[test]
    fn test_pbtxt_smoke() {
        let _guard = crate::hugepages::TEST_MUTEX.write().unwrap();
        FAKE_NOW.store(0, Ordering::Relaxed);
        let mut t = tracker();
        t.report(demand(100));
        let mut buf = String::new();
        let mut region = PbtxtRegion::new(&mut buf);
        t.print_in_pbtxt(&mut region).unwrap();
        for key in [
            "filler_skipped_subrelease",
            "skipped_subrelease_interval_ms",
            "filler_stats_timeseries",
            "min_free_backed_pages",
            "at_maximum_demand",
            "regular_huge_pages",
        ] {
            assert!(buf.contains(key), "missing pbtxt key {key}:\n{buf}");
        }
    }
}
