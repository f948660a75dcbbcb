//! Lock-free strong/unowned/weak reference counting for managed objects.
//!
//! Every [`HeapObject`] embeds an [`InlineRefCounts`], a single pointer-sized word
//! holding the strong and unowned counts. The first time a weak reference is formed,
//! or when an inline field overflows, the counts move to a [`SideTableEntry`] which
//! also carries the weak count, and the inline word is replaced with a pointer to that
//! entry. Promotion is one-way; all subsequent operations are forwarded.
//!
//! Object lifecycle:
//!
//! ```text
//! LIVE -> DEINITING -> DEINITED -> FREED -> DEAD
//! ```
//!
//! An object is `DEINITING` once its last strong reference is released, and
//! `DEINITED` when its deinitializer has finished. Its storage is released once the
//! unowned count reaches zero, and the side table entry, if any, once the weak count
//! reaches zero. Objects with no unowned or weak traffic skip straight to `DEAD`, see
//! [`RefCounts::can_be_freed_now`].
mod bits;
mod error;
mod header;
mod refcounts;
mod side_table;

pub use self::bits::{
    Field, InlineLayout, InlineRefCountBits, RefCountBitsT, RefCountLayout, RefCountState,
    SideTableLayout, SideTableRefCountBits,
};
pub use self::error::{fatal, RefCountError};
pub use self::header::{HeapMetadata, HeapObject};
pub use self::refcounts::{InlineRefCounts, RefCountKind, RefCounts, SideTableRefCounts};
pub use self::side_table::SideTableEntry;
