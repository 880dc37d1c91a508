//! Cell records.
//!
//! A cell is a byte range inside the reactive region plus the engine
//! bookkeeping attached to it: its kind, optional callbacks, staging
//! buffers and the dependency edges it participates in.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::mem::Region;

/// Computes a cell's value into `out` (exactly `size` bytes). Reads of
/// other cells go through the region and are trapped like any other
/// access, which is how dependencies are discovered.
pub type ComputeFn = dyn Fn(&mut [u8], Region) + 'static;

/// Change notification: `(new, old, region)`. `new` points at the cell's
/// bytes inside the region, `old` at a stable snapshot of the pre-change
/// bytes owned by the engine.
pub type TriggerFn = dyn Fn(*const u8, *const u8, Region) + 'static;

/// Identifier of a cell within the active region's registry.
///
/// Ids are arena indexes: dense, stable for the life of the region, and
/// meaningless once the region is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(u32);

impl CellId {
    pub(crate) fn new(index: usize) -> Self {
        CellId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// What a cell is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// Plain state. Writable; never recomputed.
    Ref,
    /// Derived state. Holds a compute callback; rewritten by the engine
    /// whenever one of its recorded inputs changes.
    Computed,
}

/// Inline capacity for edge lists; graphs with wider fan-out spill to the
/// heap transparently.
pub(crate) const EDGES_INLINE: usize = 4;

pub(crate) type EdgeList = SmallVec<[CellId; EDGES_INLINE]>;

/// A registered cell.
pub struct Cell {
    addr: usize,
    size: usize,
    kind: CellKind,
    compute: Option<Arc<ComputeFn>>,
    trigger: Option<Arc<TriggerFn>>,
    /// Staging buffer compute callbacks write into; results are copied into
    /// the region afterwards so the callback itself never writes (and so
    /// never faults on) the protected pages.
    pub(crate) scratch: Box<[u8]>,
    /// Snapshot of the cell's bytes taken just before the most recent
    /// change, handed to triggers as `old`.
    pub(crate) old: Box<[u8]>,
    /// Computed cells that read this cell during their last recompute.
    pub(crate) observers: EdgeList,
    /// Ref cells this cell read during its last recompute. Reciprocal to
    /// `observers`; empty for refs.
    pub(crate) depends_on: EdgeList,
}

impl Cell {
    pub fn new_ref(addr: usize, size: usize) -> Self {
        Cell::new(addr, size, CellKind::Ref, None)
    }

    pub fn new_computed(addr: usize, size: usize, compute: Arc<ComputeFn>) -> Self {
        Cell::new(addr, size, CellKind::Computed, Some(compute))
    }

    fn new(addr: usize, size: usize, kind: CellKind, compute: Option<Arc<ComputeFn>>) -> Self {
        Cell {
            addr,
            size,
            kind,
            compute,
            trigger: None,
            scratch: vec![0u8; size].into_boxed_slice(),
            old: vec![0u8; size].into_boxed_slice(),
            observers: EdgeList::new(),
            depends_on: EdgeList::new(),
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.addr + self.size
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    /// Whether `addr` falls inside this cell's byte range.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr < self.end()
    }

    /// Whether `[addr, addr + size)` intersects this cell's byte range.
    pub fn overlaps(&self, addr: usize, size: usize) -> bool {
        addr < self.end() && self.addr < addr + size
    }

    pub fn has_trigger(&self) -> bool {
        self.trigger.is_some()
    }

    pub(crate) fn set_trigger(&mut self, trigger: Arc<TriggerFn>) {
        self.trigger = Some(trigger);
    }

    /// Clone of the compute callback, if any. Cloned so callers can drop
    /// their registry borrow before invoking it.
    pub(crate) fn compute_fn(&self) -> Option<Arc<ComputeFn>> {
        self.compute.clone()
    }

    pub(crate) fn trigger_fn(&self) -> Option<Arc<TriggerFn>> {
        self.trigger.clone()
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("trigger", &self.trigger.is_some())
            .field("observers", &self.observers)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_covers_exactly_the_byte_range() {
        let cell = Cell::new_ref(0x1000, 8);
        assert!(!cell.contains(0xFFF));
        assert!(cell.contains(0x1000));
        assert!(cell.contains(0x1007));
        assert!(!cell.contains(0x1008));
    }

    #[test]
    fn overlap_is_symmetric_about_boundaries() {
        let cell = Cell::new_ref(0x1000, 8);
        assert!(!cell.overlaps(0xFF0, 16)); // ends exactly at our start
        assert!(cell.overlaps(0xFF0, 17)); // one byte in
        assert!(cell.overlaps(0x1004, 100));
        assert!(!cell.overlaps(0x1008, 4)); // starts exactly at our end
    }

    #[test]
    fn buffers_match_cell_size() {
        let cell = Cell::new_computed(0x2000, 12, Arc::new(|_, _| {}));
        assert_eq!(cell.scratch.len(), 12);
        assert_eq!(cell.old.len(), 12);
        assert_eq!(cell.kind(), CellKind::Computed);
        assert!(cell.compute_fn().is_some());
        assert!(!cell.has_trigger());
    }
}
