//! Memory layer: the page-protection abstraction, its production backend,
//! and the region handle handed to user code.

pub mod protect;
mod region;

#[cfg(unix)]
pub mod mmap;

#[cfg(test)]
pub(crate) mod mock;

pub use protect::{page_count, page_index, page_span, PageProtection, TrapToken, PAGE_SIZE};
pub use region::Region;

#[cfg(unix)]
pub use mmap::{host_page_size, MmapProtection};
