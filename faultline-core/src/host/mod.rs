//! Host exception delivery.
//!
//! The engine core is host-agnostic: it consumes `(token, is_write, addr)`
//! fault reports and `token` trap reports, and asks for exactly one favor
//! in return (arming a single-step trap on the saved context). This module
//! provides the default delivery for platforms where the crate wires
//! itself to the hardware; on anything else, embedders inject their own
//! [`PageProtection`](crate::mem::PageProtection) backend and call the
//! engine entry points from their own fault plumbing.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) mod posix;
