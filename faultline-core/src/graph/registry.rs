//! Cell registry for the active region.
//!
//! Cells live in an arena indexed by [`CellId`]. On top of the arena the
//! registry keeps one list of cell ids per region page, so resolving a
//! faulting address costs a page-index division plus a scan of the handful
//! of cells on that page rather than a walk of every cell. A cell whose
//! byte range straddles a page boundary appears in the list of every page
//! it touches.
//!
//! The registry also owns the dependency edges. Edges are reciprocal: when
//! a computed cell records a ref as an input, the ref simultaneously gains
//! the computed cell as an observer, and clearing tears both sides down
//! together. Nothing else in the engine mutates edge lists, which is what
//! keeps the two sides from drifting apart.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::graph::cell::{Cell, CellId, EdgeList};
use crate::mem::{page_span, PAGE_SIZE};

/// Inline capacity for per-page cell lists.
const PAGE_CELLS_INLINE: usize = 4;

pub struct CellRegistry {
    cells: Vec<Cell>,
    /// For each page of the region, the cells owning at least one byte of it.
    page_cells: Vec<SmallVec<[CellId; PAGE_CELLS_INLINE]>>,
    base: usize,
}

impl CellRegistry {
    /// Registry for a region of `pages` pages starting at `base`.
    pub fn new(base: usize, pages: usize) -> Self {
        CellRegistry {
            cells: Vec::new(),
            page_cells: vec![SmallVec::new(); pages],
            base,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last protected byte.
    pub fn end(&self) -> usize {
        self.base + self.page_cells.len() * PAGE_SIZE
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Registers a cell, linking it into every page its bytes touch.
    ///
    /// Rejects zero-sized cells, ranges outside the region and ranges that
    /// intersect an existing cell; each region byte belongs to at most one
    /// cell, so a faulting address always resolves to a unique owner.
    pub fn insert(&mut self, cell: Cell) -> Result<CellId> {
        let (addr, size) = (cell.addr(), cell.size());
        if size == 0 {
            return Err(Error::ZeroSized { addr });
        }
        if addr < self.base || cell.end() > self.end() {
            return Err(Error::OutOfRegion { addr, size });
        }
        let (first, last) = page_span(self.base, addr, size);
        for page in first..=last {
            for &id in &self.page_cells[page] {
                if self.cells[id.index()].overlaps(addr, size) {
                    return Err(Error::OverlappingCell { addr, size });
                }
            }
        }

        let id = CellId::new(self.cells.len());
        self.cells.push(cell);
        for page in first..=last {
            self.page_cells[page].push(id);
        }
        Ok(id)
    }

    /// Resolves a faulting address to the cell owning that byte, if any.
    pub fn lookup(&self, addr: usize) -> Option<CellId> {
        if addr < self.base || addr >= self.end() {
            return None;
        }
        let page = (addr - self.base) / PAGE_SIZE;
        self.page_cells[page]
            .iter()
            .copied()
            .find(|&id| self.cells[id.index()].contains(addr))
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.index()]
    }

    pub fn cell_mut(&mut self, id: CellId) -> &mut Cell {
        &mut self.cells[id.index()]
    }

    // ------------------------------------------------------------------------
    // Dependency edges
    // ------------------------------------------------------------------------

    /// Records that `computed` read `input` during its current recompute.
    ///
    /// Both edge directions are written together. Re-recording an existing
    /// edge is a no-op; returns whether a new edge was added.
    pub fn record_dependency(&mut self, computed: CellId, input: CellId) -> bool {
        if self.cells[computed.index()].depends_on.contains(&input) {
            return false;
        }
        self.cells[computed.index()].depends_on.push(input);
        self.cells[input.index()].observers.push(computed);
        true
    }

    /// Removes every input edge of `computed` along with the reciprocal
    /// observer entries, preserving the relative order of the observers
    /// that remain on each input.
    pub fn clear_dependencies(&mut self, computed: CellId) {
        let inputs: EdgeList = std::mem::take(&mut self.cells[computed.index()].depends_on);
        for input in inputs {
            let observers = &mut self.cells[input.index()].observers;
            if let Some(pos) = observers.iter().position(|&id| id == computed) {
                observers.remove(pos);
            }
        }
    }

    /// Detaches and returns `id`'s observer list. Propagation works off this
    /// snapshot while recomputes rebuild the live lists underneath it.
    pub fn take_observers(&mut self, id: CellId) -> EdgeList {
        std::mem::take(&mut self.cells[id.index()].observers)
    }

    /// Current observers of `id`, in registration order.
    pub fn observers(&self, id: CellId) -> &[CellId] {
        &self.cells[id.index()].observers
    }

    /// Current inputs of `id`, in recording order.
    pub fn depends_on(&self, id: CellId) -> &[CellId] {
        &self.cells[id.index()].depends_on
    }
}
