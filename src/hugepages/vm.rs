//! The map/unmap seam between the packing core and the operating system.
//!
//! The core never touches memory contents; the only side effect it drives
//! is returning page ranges to the kernel, injected through [`Unback`].

use super::stats;

/// Returns page ranges to the kernel.
///
/// A `false` return means the kernel refused; the range must be treated as
/// still backed and callers make no accounting change. Implementations must
/// tolerate a second unback of an already-returned range and must report
/// failure rather than panic.
pub trait Unback {
    fn unback(&mut self, addr: *mut u8, len: usize) -> bool;

    /// Variant invoked only from `HugePageFiller::put`, when draining the
    /// backed tail of an otherwise-released huge page. The affected tracker
    /// has already been unlinked from the filler and is unreachable, so an
    /// embedder holding a page-heap lock across filler calls may release it
    /// for the duration of this call and reacquire it afterwards. Other
    /// filler and region state may change in the interim; the caller's
    /// accounting of *this* huge page may not.
    ///
    /// Must not attempt to take the page-heap lock itself.
    fn unback_unlocked(&mut self, addr: *mut u8, len: usize) -> bool {
        self.unback(addr, len)
    }
}

/// Kernel-backed unback using `madvise(MADV_DONTNEED)`: physical pages are
/// dropped, the mapping stays, and the next touch refaults zero pages.
#[cfg(unix)]
pub struct SystemUnback;

#[cfg(unix)]
impl Unback for SystemUnback {
    fn unback(&mut self, addr: *mut u8, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        // Safety: FFI call to madvise. The caller owns [addr, addr + len).
        let ok = unsafe { libc::madvise(addr.cast::<libc::c_void>(), len, libc::MADV_DONTNEED) } == 0;
        if ok {
            stats::TOTAL_UNBACKED_BYTES.add(len);
        } else {
            stats::UNBACK_FAILURES.add(1);
            #[cfg(debug_assertions)]
            eprintln!(
                "[hugefill] madvise(MADV_DONTNEED, {addr:p}, {len}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
        ok
    }
}
