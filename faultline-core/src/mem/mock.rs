//! Recording protection double for engine state-machine tests.
//!
//! Backs allocations with ordinary heap memory and never protects anything;
//! tests deliver faults to the engine by hand and then perform the access
//! themselves, which reproduces the hardware ordering (fault, retry, trap)
//! without real page tables. Every operation is appended to a shared log so
//! tests can assert on the exact sequence the engine requested.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::mem::protect::{page_count, PageProtection, TrapToken, PAGE_SIZE};

/// One recorded protection operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockOp {
    Alloc { pages: usize },
    Free,
    Lock,
    Unlock,
    Trap,
}

/// Shared handle to a mock's operation log.
pub(crate) type OpLog = Arc<Mutex<Vec<MockOp>>>;

pub(crate) struct MockProtection {
    log: OpLog,
}

impl MockProtection {
    pub(crate) fn new() -> Self {
        MockProtection { log: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Clone the log handle before boxing the mock into the engine.
    pub(crate) fn log(&self) -> OpLog {
        Arc::clone(&self.log)
    }

    fn record(&self, op: MockOp) {
        self.log.lock().expect("mock op log poisoned").push(op);
    }
}

impl PageProtection for MockProtection {
    fn pages_alloc(&self, size: usize) -> Result<*mut u8> {
        let pages = page_count(size);
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
            .map_err(|_| Error::AllocationFailed { size })?;
        // SAFETY: layout is non-zero (size > 0 checked by the engine).
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(Error::AllocationFailed { size });
        }
        self.record(MockOp::Alloc { pages });
        Ok(base)
    }

    unsafe fn pages_free(&self, base: *mut u8, size: usize) {
        let pages = page_count(size);
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
            .expect("layout valid at alloc time");
        dealloc(base, layout);
        self.record(MockOp::Free);
    }

    unsafe fn pages_lock(&self, _ptr: *mut u8, _size: usize) {
        self.record(MockOp::Lock);
    }

    unsafe fn pages_unlock(&self, _ptr: *mut u8, _size: usize) {
        self.record(MockOp::Unlock);
    }

    fn enable_trap(&self, _token: TrapToken) {
        self.record(MockOp::Trap);
    }
}
