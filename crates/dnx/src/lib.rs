#![forbid(unsafe_code)]
//! dnx public API facade.
//!
//! Re-exports the engine from `dnx-core` through a stable external
//! interface. This is the crate the RTOS driver glue and tools depend on.

pub use dnx_core::*;
