//! POSIX page protection via `mmap`/`mprotect`.
//!
//! This is the production [`PageProtection`] backend. Pages come from an
//! anonymous private mapping created with no access at all, so the very
//! first touch of the region already faults; lock/unlock toggle the mapping
//! between `PROT_NONE` and `PROT_READ | PROT_WRITE`.

use std::ffi::c_void;
use std::ptr;

use crate::error::{Error, Result};
use crate::mem::protect::{page_count, PageProtection, TrapToken, PAGE_SIZE};

/// x86 EFLAGS trap flag. Set on a saved context, it single-steps the next
/// instruction executed after the context is restored.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) const TRAP_FLAG: i64 = 0x100;

/// Page size reported by the host.
pub fn host_page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// `mmap`-backed protection operations.
#[derive(Debug, Default)]
pub struct MmapProtection;

impl MmapProtection {
    pub fn new() -> Self {
        MmapProtection
    }
}

impl PageProtection for MmapProtection {
    fn pages_alloc(&self, size: usize) -> Result<*mut u8> {
        let len = page_count(size) * PAGE_SIZE;
        // SAFETY: anonymous mapping, no fd, no address hint.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::AllocationFailed { size });
        }
        Ok(ptr as *mut u8)
    }

    unsafe fn pages_free(&self, base: *mut u8, size: usize) {
        let len = page_count(size) * PAGE_SIZE;
        let rc = libc::munmap(base as *mut c_void, len);
        debug_assert_eq!(rc, 0, "munmap of an engine-owned mapping failed");
    }

    unsafe fn pages_lock(&self, ptr: *mut u8, size: usize) {
        protect(ptr, size, libc::PROT_NONE);
    }

    unsafe fn pages_unlock(&self, ptr: *mut u8, size: usize) {
        protect(ptr, size, libc::PROT_READ | libc::PROT_WRITE);
    }

    fn enable_trap(&self, token: TrapToken) {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        // SAFETY: the token wraps the ucontext delivered with the current
        // signal; the kernel restores it (trap flag included) on return.
        unsafe {
            let uc = token.as_raw() as *mut libc::ucontext_t;
            if !uc.is_null() {
                (*uc).uc_mcontext.gregs[libc::REG_EFL as usize] |= TRAP_FLAG;
            }
        }
        #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
        let _ = token;
    }
}

/// # Safety
///
/// The rounded range must lie within a live mapping owned by the engine.
unsafe fn protect(ptr: *mut u8, size: usize, prot: i32) {
    let base = (ptr as usize / PAGE_SIZE) * PAGE_SIZE;
    let len = (ptr as usize + size).next_multiple_of(PAGE_SIZE) - base;
    let rc = libc::mprotect(base as *mut c_void, len, prot);
    // Arguments are page-aligned and inside our own mapping; a failure here
    // means the region state is already corrupt.
    debug_assert_eq!(rc, 0, "mprotect on an engine-owned mapping failed");
}
