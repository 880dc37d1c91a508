//! Handle to the reactive region.

use std::fmt;

/// A page-backed byte range whose reads and writes the engine intercepts.
///
/// `Region` is a plain handle (base pointer plus requested length); copying
/// it does not duplicate the memory. Compute and trigger callbacks receive
/// one so they can reach other cells without capturing raw addresses.
///
/// Accesses go through [`read`](Region::read) and [`write`](Region::write),
/// which compile to exactly one machine access each. That matters here: the
/// engine observes memory traffic through faults, so an access the compiler
/// merges or elides is an access the engine never sees.
#[derive(Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

impl Region {
    pub(crate) fn new(base: *mut u8, len: usize) -> Self {
        Region { base, len }
    }

    /// Base address of the region (page-aligned).
    pub fn base(self) -> *mut u8 {
        self.base
    }

    /// Requested length in bytes. The mapping itself is rounded up to whole
    /// pages; the tail past `len` is usable but conventionally left alone.
    pub fn len(self) -> usize {
        self.len
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Pointer to the byte at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset > len`.
    pub fn at(self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset {offset} out of region ({})", self.len);
        // SAFETY: offset is within the allocation just checked.
        unsafe { self.base.add(offset) }
    }

    /// Reads a `T` at `offset` as a single volatile access.
    ///
    /// # Safety
    ///
    /// `offset` must be aligned for `T`, `[offset, offset + size_of::<T>())`
    /// must lie within the region, and the bytes there must be a valid `T`.
    pub unsafe fn read<T: Copy>(self, offset: usize) -> T {
        let ptr = self.at(offset) as *const T;
        debug_assert!(ptr as usize % std::mem::align_of::<T>() == 0);
        ptr.read_volatile()
    }

    /// Writes a `T` at `offset` as a single volatile access.
    ///
    /// # Safety
    ///
    /// Same requirements as [`read`](Region::read).
    pub unsafe fn write<T: Copy>(self, offset: usize, value: T) {
        let ptr = self.at(offset) as *mut T;
        debug_assert!(ptr as usize % std::mem::align_of::<T>() == 0);
        ptr.write_volatile(value);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.base as usize))
            .field("len", &self.len)
            .finish()
    }
}
