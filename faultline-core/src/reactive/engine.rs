//! Reactive Engine
//!
//! The engine is the central coordinator: it owns the protection backend,
//! the active region and its cell registry, and the small amount of mutable
//! state the fault paths share (the recording slot, the changed list, the
//! trap arm flag).
//!
//! # How It Works
//!
//! 1. `init` stores an [`EngineState`] in a process-wide slot and, on the
//!    default stack, installs the host exception handlers.
//!
//! 2. `alloc` obtains locked pages from the protection backend; every cell
//!    registered afterwards is a byte range inside that region.
//!
//! 3. From then on the engine is driven by faults. The host layer forwards
//!    each page fault and single-step trap to [`Engine::on_page_fault`] and
//!    [`Engine::on_trap`], and the handler module advances the state
//!    machine.
//!
//! # Re-entrancy
//!
//! Fault handlers re-enter the engine on the same thread that faulted, so
//! the state slot cannot be behind a lock (the handler would deadlock
//! against the interrupted frame). Instead the slot is an `UnsafeCell` with
//! two rules: only one thread ever mutates reactive memory, and no borrow
//! of the state is held across a user callback or an instruction retry.
//! Every access goes through [`with_state`], which scopes the borrow to a
//! single closure; callbacks are cloned out and invoked borrow-free.

use std::cell::UnsafeCell;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::graph::{Cell, CellId, CellRegistry, ComputeFn, TriggerFn};
use crate::mem::{page_count, PageProtection, Region, TrapToken, PAGE_SIZE};
use crate::reactive::handler;

/// Read-propagation policy for computed cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reading a computed cell re-runs its compute callback first, so the
    /// read always observes a freshly derived value.
    Lazy,
    /// Reading a computed cell returns whatever the propagation pipeline
    /// last wrote. Reads never invoke compute callbacks.
    NonLazy,
}

/// The region currently under management, with its cell registry.
pub(crate) struct ActiveRegion {
    pub(crate) region: Region,
    pub(crate) registry: CellRegistry,
}

/// Everything the engine knows, bundled so init/shutdown swap it in and
/// out of the slot as one unit.
pub(crate) struct EngineState {
    pub(crate) mode: Mode,
    pub(crate) protection: Box<dyn PageProtection>,
    pub(crate) active: Option<ActiveRegion>,
    /// Computed cell currently re-running, if any. While set, read faults
    /// record dependencies instead of propagating values.
    pub(crate) recording: Option<CellId>,
    /// Cells written since the last trap step, in write order.
    pub(crate) changed: Vec<CellId>,
    /// Set between arming the single-step trap and the trap's arrival;
    /// distinguishes our traps from debugger breakpoints.
    pub(crate) trap_armed: bool,
    host_installed: bool,
}

struct EngineSlot(UnsafeCell<Option<EngineState>>);

// SAFETY: the engine is confined to the single thread that mutates reactive
// memory; see the module docs. The slot is shared only so signal handlers
// (which run on that same thread) can reach it without a lock.
unsafe impl Sync for EngineSlot {}

static ENGINE: EngineSlot = EngineSlot(UnsafeCell::new(None));

/// Runs `f` against the engine state, if initialized.
///
/// The borrow lasts exactly for `f`; `f` must not re-enter `with_state`
/// and must not run user callbacks (clone what they need and call them
/// after returning).
pub(crate) fn with_state<R>(f: impl FnOnce(&mut EngineState) -> R) -> Option<R> {
    // SAFETY: single mutating thread, and no caller holds a previous borrow
    // while invoking this (fault handlers re-enter only between borrows).
    let state = unsafe { &mut *ENGINE.0.get() };
    state.as_mut().map(f)
}

/// Like [`with_state`] but for fallible operations; an uninitialized
/// engine becomes [`Error::NotInitialized`].
pub(crate) fn try_state<R>(f: impl FnOnce(&mut EngineState) -> Result<R>) -> Result<R> {
    with_state(f).unwrap_or(Err(Error::NotInitialized))
}

/// The reactivity engine.
///
/// A process hosts at most one engine. All operations are associated
/// functions acting on the process-wide instance.
pub struct Engine;

impl Engine {
    /// Initializes the engine with the default host stack: `mmap`-backed
    /// page protection and process-wide SIGSEGV/SIGTRAP handlers.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn init(mode: Mode) -> Result<()> {
        let host = crate::mem::host_page_size();
        if host != PAGE_SIZE {
            return Err(Error::UnsupportedPageSize { host, required: PAGE_SIZE });
        }
        Engine::init_inner(mode, Box::new(crate::mem::MmapProtection::new()), true)
    }

    /// Initializes the engine with an injected protection backend and no
    /// host handlers. The caller is responsible for delivering faults to
    /// [`Engine::on_page_fault`] and [`Engine::on_trap`].
    pub fn init_with(mode: Mode, protection: Box<dyn PageProtection>) -> Result<()> {
        Engine::init_inner(mode, protection, false)
    }

    fn init_inner(
        mode: Mode,
        protection: Box<dyn PageProtection>,
        install_host: bool,
    ) -> Result<()> {
        // SAFETY: API path on the owning thread; no handler can be between
        // borrows here because no region exists yet.
        let slot = unsafe { &mut *ENGINE.0.get() };
        if slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        *slot = Some(EngineState {
            mode,
            protection,
            active: None,
            recording: None,
            changed: Vec::new(),
            trap_armed: false,
            host_installed: false,
        });

        if install_host {
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            {
                if let Err(err) = crate::host::posix::install() {
                    *slot = None;
                    return Err(err);
                }
                if let Some(state) = slot.as_mut() {
                    state.host_installed = true;
                }
            }
        }

        info!(?mode, "reactivity engine initialized");
        Ok(())
    }

    /// Tears the engine down: restores host handlers, releases the region
    /// if one is still active, and drops all cells. Idempotent.
    pub fn shutdown() {
        // SAFETY: API path on the owning thread.
        let state = unsafe { (*ENGINE.0.get()).take() };
        let Some(state) = state else { return };

        if let Some(active) = &state.active {
            debug!("region still active at shutdown, releasing");
            // SAFETY: base and len are the values pages_alloc returned.
            unsafe {
                state
                    .protection
                    .pages_free(active.region.base(), active.region.len());
            }
        }
        if state.host_installed {
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            crate::host::posix::uninstall();
        }
        info!("reactivity engine shut down");
    }

    pub fn is_initialized() -> bool {
        with_state(|_| ()).is_some()
    }

    /// Allocates the reactive region: `size` bytes rounded up to whole
    /// pages, zero-filled, and locked so the first access already faults.
    ///
    /// The engine manages one region at a time; free the active one first.
    pub fn alloc(size: usize) -> Result<Region> {
        try_state(|st| {
            if st.active.is_some() {
                return Err(Error::RegionActive);
            }
            if size == 0 {
                return Err(Error::AllocationFailed { size });
            }
            let base = st.protection.pages_alloc(size)?;
            let region = Region::new(base, size);
            let registry = CellRegistry::new(base as usize, page_count(size));
            st.active = Some(ActiveRegion { region, registry });
            debug!(base = %format_args!("{:#x}", base as usize), size, "reactive region allocated");
            Ok(region)
        })
    }

    /// Releases the active region and every cell registered against it.
    pub fn free(region: Region) -> Result<()> {
        try_state(|st| {
            let Some(active) = st.active.as_ref() else {
                return Err(Error::NoRegion);
            };
            if active.region.base() != region.base() {
                return Err(Error::UnknownAddress { addr: region.base() as usize });
            }
            let active = st.active.take().ok_or(Error::NoRegion)?;
            st.changed.clear();
            st.recording = None;
            // SAFETY: base and len are the values pages_alloc returned.
            unsafe {
                st.protection
                    .pages_free(active.region.base(), active.region.len());
            }
            debug!(cells = active.registry.len(), "reactive region freed");
            Ok(())
        })
    }

    /// Registers `[addr, addr + size)` as a ref cell: plain state that can
    /// be written, whose writes wake the computed cells observing it.
    pub fn ref_cell(addr: *mut u8, size: usize) -> Result<()> {
        try_state(|st| {
            let active = st.active.as_mut().ok_or(Error::NoRegion)?;
            let id = active.registry.insert(Cell::new_ref(addr as usize, size))?;
            debug!(%id, addr = %format_args!("{:#x}", addr as usize), size, "ref cell registered");
            Ok(())
        })
    }

    /// Registers `[addr, addr + size)` as a computed cell and runs `compute`
    /// once to seed it.
    ///
    /// The seeding run doubles as dependency discovery: every ref cell the
    /// callback reads becomes an input, and from then on writes to those
    /// inputs re-run the callback. `compute` must fill all `size` bytes of
    /// `out`; reads of other cells go through the region argument.
    pub fn computed<F>(addr: *mut u8, size: usize, compute: F) -> Result<()>
    where
        F: Fn(&mut [u8], Region) + 'static,
    {
        let compute: Arc<ComputeFn> = Arc::new(compute);
        let (id, run, mut scratch, region) = try_state(|st| {
            let active = st.active.as_mut().ok_or(Error::NoRegion)?;
            let cell = Cell::new_computed(addr as usize, size, Arc::clone(&compute));
            let id = active.registry.insert(cell)?;
            let scratch = std::mem::take(&mut active.registry.cell_mut(id).scratch);
            let region = active.region;
            st.recording = Some(id);
            Ok((id, Arc::clone(&compute), scratch, region))
        })?;
        debug!(%id, addr = %format_args!("{:#x}", addr as usize), size, "computed cell registered, seeding");

        // Dependency recording is live: each read the callback performs
        // faults and lands in the recording arm of the handler.
        run(&mut scratch, region);

        try_state(|st| {
            st.recording = None;
            let active = st.active.as_mut().ok_or(Error::NoRegion)?;
            let cell = active.registry.cell_mut(id);
            cell.scratch = scratch;
            let (addr, size, src) = (cell.addr(), cell.size(), cell.scratch.as_ptr());
            // SAFETY: the cell range was bounds-checked at insert; the
            // region is unlocked around the copy.
            unsafe {
                st.protection.pages_unlock(region.base(), region.len());
                std::ptr::copy_nonoverlapping(src, addr as *mut u8, size);
                st.protection.pages_lock(region.base(), region.len());
            }
            Ok(())
        })
    }

    /// Attaches a change trigger to the cell owning `addr`.
    ///
    /// For a ref the trigger fires on every write to it; for a computed
    /// cell, after every engine-driven recompute. `new` points at the
    /// cell's current bytes, `old` at the engine's pre-change snapshot.
    pub fn watch<F>(addr: *const u8, trigger: F) -> Result<()>
    where
        F: Fn(*const u8, *const u8, Region) + 'static,
    {
        let trigger: Arc<TriggerFn> = Arc::new(trigger);
        try_state(|st| {
            let active = st.active.as_mut().ok_or(Error::NoRegion)?;
            let id = active
                .registry
                .lookup(addr as usize)
                .ok_or(Error::UnknownAddress { addr: addr as usize })?;
            active.registry.cell_mut(id).set_trigger(trigger);
            debug!(%id, addr = %format_args!("{:#x}", addr as usize), "trigger attached");
            Ok(())
        })
    }

    /// Number of cells registered against the active region.
    pub fn cell_count() -> usize {
        with_state(|st| st.active.as_ref().map_or(0, |a| a.registry.len())).unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Host entry points
    // ------------------------------------------------------------------------

    /// Entry point for page faults. Returns whether the fault belonged to
    /// the engine; an unclaimed fault must be re-raised by the host so
    /// crashes stay crashes.
    pub fn on_page_fault(token: TrapToken, is_write: bool, addr: usize) -> bool {
        handler::page_fault(token, is_write, addr)
    }

    /// Entry point for single-step traps. Returns whether the trap was one
    /// the engine armed.
    pub fn on_trap(token: TrapToken) -> bool {
        handler::trap(token)
    }
}
