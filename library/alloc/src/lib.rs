//! Memory management for managed heap objects.
//!
//! The [`rc`] module contains the reference counting engine embedded in every object
//! header, while [`allocators`] provides the raw allocation seam it is built on.
pub mod allocators;
pub mod rc;
