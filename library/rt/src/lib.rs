//! Runtime entry points for managed objects.
//!
//! This crate layers object allocation and teardown on top of the refcounting engine
//! in [`heaprc_alloc::rc`]. The free functions in [`object`], [`unowned`] and [`weak`]
//! operate on raw object pointers and are the surface used by generated code; the
//! handles in [`handle`] wrap them with ordinary Rust ownership.
pub mod diagnostics;
pub mod handle;
pub mod logging;
pub mod object;
pub mod unowned;
pub mod weak;

pub use heaprc_alloc::rc::{HeapMetadata, HeapObject, RefCountError};

pub use self::handle::{Strong, Unowned, Weak};
pub use self::object::{ClassMetadata, ManagedBox};
pub use self::weak::WeakReference;
