//! Faultline Core
//!
//! This crate provides a reactivity engine for raw memory. It turns a
//! page-aligned allocation into cells of three kinds:
//!
//! - Refs: plain state, written with ordinary stores
//! - Computed cells: derived state, recomputed when their inputs change
//! - Watches: change triggers attached to either of the above
//!
//! There is no wrapper type around the values and no API call on the read
//! or write path. User code holds real pointers into the region and uses
//! them like any other memory; the engine keeps the region's pages locked
//! and learns about every access from the page-fault it causes. A faulting
//! instruction is serviced by opening the region, single-stepping the
//! retry, and locking it again one instruction later, at which point
//! writes propagate through the dependency graph.
//!
//! # Architecture
//!
//! The crate is organized into four modules:
//!
//! - `mem`: the page-protection abstraction, its `mmap` backend and the
//!   region handle
//! - `graph`: the cell arena, page-to-cell index and dependency edges
//! - `reactive`: the engine singleton, public operations and the fault
//!   state machine
//! - `host`: SIGSEGV/SIGTRAP delivery on Linux x86_64
//!
//! # Example
//!
//! ```rust,no_run
//! use faultline_core::{Engine, Mode};
//!
//! Engine::init(Mode::NonLazy)?;
//! let region = Engine::alloc(64)?;
//!
//! // One u32 of plain state and a u64 derived from it.
//! Engine::ref_cell(region.at(0), 4)?;
//! Engine::computed(region.at(8), 8, |out, region| {
//!     let a = unsafe { region.read::<u32>(0) } as u64;
//!     out.copy_from_slice(&(a * 2).to_le_bytes());
//! })?;
//! Engine::watch(region.at(8), |new, old, _| {
//!     let new = unsafe { std::ptr::read_volatile(new as *const u64) };
//!     let old = unsafe { std::ptr::read(old as *const u64) };
//!     println!("doubled: {old} -> {new}");
//! })?;
//!
//! // An ordinary store; the fault machinery does the rest.
//! unsafe { region.write::<u32>(0, 21) };
//! assert_eq!(unsafe { region.read::<u64>(8) }, 42);
//!
//! Engine::free(region)?;
//! Engine::shutdown();
//! # Ok::<(), faultline_core::Error>(())
//! ```
//!
//! # Threading
//!
//! The engine is process-wide and single-threaded by contract: one thread
//! initializes it, registers cells and touches reactive memory. Faults are
//! synchronous signals, so everything the engine does happens nested on
//! that thread's stack.

pub mod error;
pub mod graph;
pub mod host;
pub mod mem;
pub mod reactive;

pub use error::{Error, Result};
pub use graph::{CellId, CellKind};
pub use mem::{PageProtection, Region, TrapToken, PAGE_SIZE};
pub use reactive::{Engine, Mode};

#[cfg(unix)]
pub use mem::MmapProtection;
