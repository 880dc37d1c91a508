//! Fault arbitration and the propagation pipeline.
//!
//! Everything reactive happens in two hardware moments. A page fault
//! arrives while the faulting instruction has not yet executed; the engine
//! classifies it, stages whatever bookkeeping the access needs, unlocks the
//! region and arms a single-step trap so the instruction can retry. One
//! instruction later the trap arrives; the engine relocks the region and,
//! if the instruction was a write, walks the changed cells' observers:
//! snapshot, clear edges, recompute with recording live, install the
//! result, fire triggers.
//!
//! # Fault classification
//!
//! | recording | access | cell     | action                                |
//! |-----------|--------|----------|---------------------------------------|
//! | yes       | read   | ref      | record dependency edge                |
//! | yes       | read   | computed | nothing (edges stay ref-grained)      |
//! | yes       | write  | any      | invalid; log and abort                |
//! | no        | read   | ref      | nothing                               |
//! | no        | read   | computed | recompute first if the mode is lazy   |
//! | no        | write  | any      | queue for propagation, snapshot `old` |
//!
//! Faults at addresses the engine does not own are left unclaimed so the
//! host can re-raise them; a crash in user code must stay a crash.
//!
//! Handlers run on the thread that faulted, nested inside whatever frame
//! was executing. Every helper here therefore takes and releases the state
//! borrow around each step, and user callbacks run with no borrow at all:
//! the faults they cause re-enter this module through empty-handed frames.

use tracing::{error, trace};

use crate::graph::{CellId, CellKind, EdgeList};
use crate::mem::TrapToken;
use crate::reactive::engine::{with_state, Mode};

/// Classifies and services one page fault. Returns whether it was ours.
pub(crate) fn page_fault(token: TrapToken, is_write: bool, addr: usize) -> bool {
    let hit = with_state(|st| {
        let active = st.active.as_ref()?;
        let id = active.registry.lookup(addr)?;
        Some((id, st.recording, active.registry.cell(id).kind(), st.mode))
    })
    .flatten();
    let Some((id, recording, kind, mode)) = hit else {
        return false;
    };

    if let Some(recorder) = recording {
        if is_write {
            // A compute callback stored into reactive memory. The write
            // cannot be completed without corrupting the graph mid-rebuild,
            // and it cannot be skipped because the instruction will retry.
            error!(
                %recorder,
                addr = %format_args!("{addr:#x}"),
                "write to reactive memory during dependency recording"
            );
            std::process::abort();
        }
        if kind == CellKind::Ref {
            with_state(|st| {
                if let Some(active) = st.active.as_mut() {
                    if active.registry.record_dependency(recorder, id) {
                        trace!(%recorder, input = %id, "dependency recorded");
                    }
                }
            });
        }
    } else if is_write {
        trace!(%id, addr = %format_args!("{addr:#x}"), "write fault");
        with_state(|st| st.changed.push(id));
        snapshot_old(id);
    } else if kind == CellKind::Computed && mode == Mode::Lazy {
        trace!(%id, "read fault on computed cell, refreshing");
        run_compute(id, false);
        install_scratch(id);
    }

    unlock_and_arm(token);
    true
}

/// Services one single-step trap. Returns whether the engine armed it.
pub(crate) fn trap(_token: TrapToken) -> bool {
    let armed = with_state(|st| {
        if !st.trap_armed {
            return false;
        }
        st.trap_armed = false;
        if let Some(active) = st.active.as_ref() {
            let region = active.region;
            // SAFETY: region is live until freed on the API path, which
            // cannot interleave with a fault on the same thread.
            unsafe { st.protection.pages_lock(region.base(), region.len()) };
        }
        true
    })
    .unwrap_or(false);
    if !armed {
        return false;
    }
    drain_changed();
    true
}

/// Propagates every write staged since the last trap.
///
/// The changed list is detached first: callbacks run during propagation
/// may fault and stage further writes, which belong to their own nested
/// trap step, not this one.
fn drain_changed() {
    let pending = with_state(|st| std::mem::take(&mut st.changed)).unwrap_or_default();
    if pending.is_empty() {
        return;
    }
    trace!(cells = pending.len(), "propagating staged writes");

    for id in pending {
        // Detach the observer list; recomputes rebuild the live edges
        // underneath while propagation works off this snapshot.
        let observers: EdgeList = with_state(|st| {
            st.active.as_mut().map(|a| a.registry.take_observers(id))
        })
        .flatten()
        .unwrap_or_default();

        fire_trigger(id);

        for observer in observers {
            snapshot_old(observer);
            with_state(|st| {
                if let Some(active) = st.active.as_mut() {
                    active.registry.clear_dependencies(observer);
                }
            });
            run_compute(observer, true);
            install_scratch(observer);
            fire_trigger(observer);
        }
    }
}

/// Unlocks the whole region and arms the single-step trap so the faulting
/// instruction can retry against open pages.
fn unlock_and_arm(token: TrapToken) {
    with_state(|st| {
        if let Some(active) = st.active.as_ref() {
            let region = active.region;
            // SAFETY: region is live; see `trap`.
            unsafe { st.protection.pages_unlock(region.base(), region.len()) };
        }
        st.protection.enable_trap(token);
        st.trap_armed = true;
    });
}

/// Runs `id`'s compute callback into its scratch buffer.
///
/// With `record` set, read faults raised by the callback record dependency
/// edges for `id`. The state borrow is released while the callback runs.
fn run_compute(id: CellId, record: bool) {
    let prep = with_state(|st| {
        let active = st.active.as_mut()?;
        let region = active.region;
        let cell = active.registry.cell_mut(id);
        let compute = cell.compute_fn()?;
        let scratch = std::mem::take(&mut cell.scratch);
        if record {
            st.recording = Some(id);
        }
        Some((compute, scratch, region))
    })
    .flatten();
    let Some((compute, mut scratch, region)) = prep else { return };

    compute(&mut scratch, region);

    with_state(|st| {
        if record {
            st.recording = None;
        }
        if let Some(active) = st.active.as_mut() {
            active.registry.cell_mut(id).scratch = scratch;
        }
    });
}

/// Copies `id`'s scratch buffer into its region bytes under a temporary
/// unlock. The engine's own copies never fault.
fn install_scratch(id: CellId) {
    with_state(|st| {
        let Some(active) = st.active.as_ref() else { return };
        let region = active.region;
        let cell = active.registry.cell(id);
        let (addr, size) = (cell.addr(), cell.size());
        let src = cell.scratch.as_ptr();
        // SAFETY: the cell range was bounds-checked at insert; the region
        // is unlocked around the copy.
        unsafe {
            st.protection.pages_unlock(region.base(), region.len());
            std::ptr::copy_nonoverlapping(src, addr as *mut u8, size);
            st.protection.pages_lock(region.base(), region.len());
        }
    });
}

/// Snapshots `id`'s current region bytes into its `old` buffer, for the
/// `old` argument of triggers. Runs before the bytes change: before the
/// retried write lands, or before a recompute is installed.
fn snapshot_old(id: CellId) {
    with_state(|st| {
        let Some(active) = st.active.as_mut() else { return };
        let region = active.region;
        let cell = active.registry.cell_mut(id);
        let (addr, size) = (cell.addr(), cell.size());
        let dst = cell.old.as_mut_ptr();
        // SAFETY: the snapshot buffer matches the cell size; the region is
        // unlocked around the read.
        unsafe {
            st.protection.pages_unlock(region.base(), region.len());
            std::ptr::copy_nonoverlapping(addr as *const u8, dst, size);
            st.protection.pages_lock(region.base(), region.len());
        }
    });
}

/// Fires `id`'s trigger, if one is attached. `new` points at the cell's
/// live region bytes, `old` at the engine-owned snapshot.
fn fire_trigger(id: CellId) {
    let prep = with_state(|st| {
        let active = st.active.as_ref()?;
        let cell = active.registry.cell(id);
        let trigger = cell.trigger_fn()?;
        Some((trigger, cell.addr(), cell.old.as_ptr(), active.region))
    })
    .flatten();
    let Some((trigger, addr, old, region)) = prep else { return };
    trigger(addr as *const u8, old, region);
}
