//! Error types for the engine's public surface.
//!
//! Everything the API can refuse is a variant here. Conditions that arise
//! *inside* a fault (allocation failure mid-handler, a write observed during
//! dependency recording) are not representable as return values, because the
//! faulting instruction cannot retry against an inconsistent graph; those
//! paths log and abort instead.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// A page allocation (or a supporting buffer) could not be obtained.
    #[error("page allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    /// `init` was called while an engine is already live.
    #[error("engine is already initialized")]
    AlreadyInitialized,

    /// An operation that needs a live engine ran before `init`.
    #[error("engine is not initialized")]
    NotInitialized,

    /// `alloc` was called while a region is already active; the engine
    /// manages one region at a time.
    #[error("a reactive region is already active")]
    RegionActive,

    /// A cell or region operation ran before any region was allocated.
    #[error("no reactive region has been allocated")]
    NoRegion,

    /// The host page size does not match the engine's fixed page granule.
    #[error("host page size is {host}, engine requires {required}")]
    UnsupportedPageSize { host: usize, required: usize },

    /// A zero-length cell can never own a faulting byte.
    #[error("cell at {addr:#x} has zero size")]
    ZeroSized { addr: usize },

    /// The byte range does not lie inside the reactive region.
    #[error("range [{addr:#x}, {addr:#x} + {size}) lies outside the reactive region")]
    OutOfRegion { addr: usize, size: usize },

    /// The byte range intersects a cell that already exists; a byte belongs
    /// to at most one cell.
    #[error("range [{addr:#x}, {addr:#x} + {size}) overlaps an existing cell")]
    OverlappingCell { addr: usize, size: usize },

    /// No registered cell owns the given address.
    #[error("no cell is registered at address {addr:#x}")]
    UnknownAddress { addr: usize },

    /// Installing the process-wide exception handlers failed.
    #[error("installing signal handlers failed (errno {errno})")]
    HostInstall { errno: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_addresses_in_hex() {
        let err = Error::UnknownAddress { addr: 0xdead0 };
        assert_eq!(err.to_string(), "no cell is registered at address 0xdead0");

        let err = Error::OverlappingCell { addr: 0x1000, size: 8 };
        assert!(err.to_string().contains("0x1000"));
    }

    #[test]
    fn page_size_error_carries_both_sizes() {
        let err = Error::UnsupportedPageSize { host: 16384, required: 4096 };
        let text = err.to_string();
        assert!(text.contains("16384"));
        assert!(text.contains("4096"));
    }
}
