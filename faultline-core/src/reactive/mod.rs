//! Reactive Core
//!
//! This module implements the reactive system proper: the engine singleton
//! with its public operations, and the fault handler that drives
//! propagation.
//!
//! # Concepts
//!
//! ## Refs
//!
//! A ref is a byte range holding plain state. Ordinary machine writes to it
//! are the only way values enter the system; each write wakes the computed
//! cells recorded as its observers.
//!
//! ## Computed cells
//!
//! A computed cell owns a callback that derives its bytes from other cells.
//! The engine discovers its inputs by running the callback with dependency
//! recording switched on: every ref the callback happens to read faults,
//! and the fault records the edge. Because the set is rebuilt on every run,
//! it always mirrors the callback's latest control-flow path.
//!
//! ## Watches
//!
//! A watch attaches a trigger to an existing cell. Triggers observe changes
//! (new bytes, pre-change bytes) but do not participate in the dependency
//! graph.
//!
//! # Implementation Notes
//!
//! There is no read-barrier or proxy layer anywhere: user code reaches
//! reactive state with plain loads and stores, and the page-protection
//! hardware tells the engine which bytes were touched. The cost of that
//! transparency is that the engine runs inside fault handlers, which is
//! what the re-entrancy rules in [`engine`] are about.

pub(crate) mod engine;
pub(crate) mod handler;

#[cfg(test)]
pub(crate) mod testkit;

pub use engine::{Engine, Mode};
