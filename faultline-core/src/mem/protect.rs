//! Page-protection abstraction.
//!
//! The engine never talks to the OS directly. The five operations it needs
//! are injected behind [`PageProtection`] at init time, which keeps the core
//! state machine portable and lets tests drive it with a recording double
//! instead of real page tables.
//!
//! All protection changes operate on whole pages. The engine assumes a fixed
//! granule of [`PAGE_SIZE`] bytes and verifies at init that the host agrees.

use std::ffi::c_void;

use crate::error::Result;

/// Fixed page granule, in bytes. Cell-to-page mapping, region sizing and
/// protection flips all use this constant.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `size` bytes (rounded up).
pub fn page_count(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Index of the page containing `addr`, relative to `base`.
///
/// Callers guarantee `addr >= base`.
pub fn page_index(base: usize, addr: usize) -> usize {
    (addr - base) / PAGE_SIZE
}

/// First and last page indexes touched by the byte range
/// `[addr, addr + size)`, relative to `base`.
///
/// Callers guarantee `size > 0` and `addr >= base`.
pub fn page_span(base: usize, addr: usize, size: usize) -> (usize, usize) {
    (page_index(base, addr), page_index(base, addr + size - 1))
}

// ----------------------------------------------------------------------------
// Trap token
// ----------------------------------------------------------------------------

/// Opaque handle to the host exception context of the current fault.
///
/// The engine receives one with every page fault and hands it back through
/// [`PageProtection::enable_trap`] when it wants the CPU to single-step the
/// retried instruction. Only the host layer ever looks inside.
#[derive(Debug, Clone, Copy)]
pub struct TrapToken(*mut c_void);

impl TrapToken {
    /// Wraps a raw host context pointer.
    pub fn from_raw(raw: *mut c_void) -> Self {
        TrapToken(raw)
    }

    /// Token with no host context behind it, for drivers that do not
    /// single-step (tests call the engine entry points directly).
    pub fn null() -> Self {
        TrapToken(std::ptr::null_mut())
    }

    /// The raw host context pointer, possibly null.
    pub fn as_raw(self) -> *mut c_void {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Protection operations
// ----------------------------------------------------------------------------

/// The page-level operations the engine depends on.
///
/// `pages_lock` and `pages_unlock` round `[ptr, ptr + size)` out to whole
/// pages; locking removes all access so the next touch faults, unlocking
/// restores read/write. Implementations must tolerate redundant transitions
/// (locking a locked range is a no-op).
pub trait PageProtection {
    /// Reserves enough whole pages for `size` bytes, zero-filled and locked
    /// (no access). Returns the page-aligned base.
    fn pages_alloc(&self, size: usize) -> Result<*mut u8>;

    /// Releases pages previously returned by [`pages_alloc`].
    ///
    /// # Safety
    ///
    /// `base` must come from `pages_alloc` on this same instance, with the
    /// same `size`, and must not be used afterwards.
    ///
    /// [`pages_alloc`]: PageProtection::pages_alloc
    unsafe fn pages_free(&self, base: *mut u8, size: usize);

    /// Removes all access from the pages covering `[ptr, ptr + size)`.
    ///
    /// # Safety
    ///
    /// The range must lie within a live allocation from this instance.
    unsafe fn pages_lock(&self, ptr: *mut u8, size: usize);

    /// Restores read/write access to the pages covering `[ptr, ptr + size)`.
    ///
    /// # Safety
    ///
    /// The range must lie within a live allocation from this instance.
    unsafe fn pages_unlock(&self, ptr: *mut u8, size: usize);

    /// Arms a single-instruction trap on the context identified by `token`:
    /// after the faulting instruction retries, control returns to the engine
    /// exactly one instruction later.
    fn enable_trap(&self, token: TrapToken);
}
