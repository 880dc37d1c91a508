//! Cell Graph
//!
//! This module owns the cells registered against the active region and the
//! dependency edges between them.
//!
//! # Overview
//!
//! Two structures cover everything the fault paths need:
//!
//! - An arena of [`Cell`] records indexed by [`CellId`], with one list of
//!   ids per region page so a faulting address resolves in O(cells on that
//!   page) rather than O(all cells)
//! - Reciprocal dependency edges: a computed cell's `depends_on` list and
//!   the matching `observers` entries on its inputs, always written and
//!   torn down together
//!
//! Edges are rebuilt from scratch on every recompute. That is what lets a
//! computed cell's dependency set follow its control flow: inputs read on
//! the latest run are the only inputs that can wake it next time.

mod cell;
mod registry;

pub use cell::{Cell, CellId, CellKind, ComputeFn, TriggerFn};
pub use registry::CellRegistry;

pub(crate) use cell::EdgeList;
