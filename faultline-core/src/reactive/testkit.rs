//! Helpers for engine tests driven by the recording protection double.
//!
//! The mock never protects anything, so tests reproduce what the hardware
//! would do by hand: deliver the fault, perform the access, deliver the
//! trap. The ordering is the one the host guarantees on real page tables.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::mem::mock::{MockProtection, OpLog};
use crate::mem::{Region, TrapToken};
use crate::reactive::{Engine, Mode};

/// Engine tests share one process-wide state slot; hold this across each
/// test body to keep them from interleaving.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Fresh engine plus region on the mock backend. Returns the region and
/// the shared operation log. Call with the serial guard held.
pub(crate) fn setup(mode: Mode, size: usize) -> (Region, OpLog) {
    Engine::shutdown();
    let mock = MockProtection::new();
    let log = mock.log();
    Engine::init_with(mode, Box::new(mock)).expect("init");
    let region = Engine::alloc(size).expect("alloc");
    (region, log)
}

/// One simulated store: write fault, the store itself, single-step trap.
///
/// # Safety
///
/// `offset` must be aligned for `T` and `[offset, offset + size_of::<T>())`
/// must lie within the region.
pub(crate) unsafe fn sim_write<T: Copy>(region: Region, offset: usize, value: T) {
    let addr = region.base() as usize + offset;
    assert!(
        Engine::on_page_fault(TrapToken::null(), true, addr),
        "write fault at offset {offset} unclaimed"
    );
    std::ptr::write(region.at(offset) as *mut T, value);
    assert!(Engine::on_trap(TrapToken::null()), "trap unclaimed");
}

/// One simulated load: read fault, the load itself, single-step trap.
///
/// # Safety
///
/// Same requirements as [`sim_write`].
pub(crate) unsafe fn sim_read<T: Copy>(region: Region, offset: usize) -> T {
    let addr = region.base() as usize + offset;
    assert!(
        Engine::on_page_fault(TrapToken::null(), false, addr),
        "read fault at offset {offset} unclaimed"
    );
    let value = std::ptr::read(region.at(offset) as *const T);
    assert!(Engine::on_trap(TrapToken::null()), "trap unclaimed");
    value
}
