//! Hugepage-aware page packing: routes page-granular allocations onto 2 MiB
//! huge pages so as many of them as possible stay eligible for transparent
//! huge pages, recovers empty ones, and decides from recent demand history
//! when returning partially-free ones to the kernel would be premature.
//!
//! The crate is bookkeeping only. Callers supply the huge pages, hold an
//! exclusive heap lock across every call, and inject the [`Unback`]
//! primitive that actually returns ranges to the kernel.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("hugefill supports only 64-bit targets.");

pub mod hugepages;

// core components
pub use hugepages::filler::{
    AccessDensityPrediction, FillerAllocsOption, HugePageFiller, HugePageFillerStats,
    SpanAllocInfo, TryGetResult, MAX_CHUNKS_PER_ALLOC,
};
pub use hugepages::page_tracker::{PageAllocation, PageTracker};
pub use hugepages::region::{
    HugeRegion, HugeRegionSet, HugeRegionUsageOption, RegionAllocation, REGION_HUGE_PAGES,
};
pub use hugepages::tracker_lists::TrackerId;

// units
pub use hugepages::pages::{
    HugeLength, HugePage, HugeRange, Length, PageId, HUGE_PAGE_SIZE, PAGES_PER_HUGE_PAGE,
    PAGE_SIZE,
};

// time series / subrelease policy
pub use hugepages::clock::Clock;
pub use hugepages::stats_tracker::{
    FillerStatsTracker, NumberOfFreePages, SkipSubreleaseIntervals, SkippedSubreleaseDecision,
    SubreleaseStats,
};

// statistics surfaces
pub use hugepages::stats::{BackingStats, LargeSpanStats, PbtxtRegion, SmallSpanStats};

// platform seam
#[cfg(unix)]
pub use hugepages::vm::SystemUnback;
pub use hugepages::vm::Unback;
