//! Low-level primitives shared by the `heaprc` crates.
//!
//! Nothing in here knows about reference counts; this crate only provides the
//! synchronization primitives and process-wide configuration the higher layers build on.

pub mod env;
pub mod sync;
