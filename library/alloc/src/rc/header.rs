use core::alloc::Layout;
use core::fmt;
use core::mem;
use core::ptr::NonNull;

use static_assertions::{assert_eq_size, const_assert_eq};

use super::refcounts::InlineRefCounts;

/// Describes a class of managed objects.
///
/// Metadata is shared by every instance of the class, and must outlive all of them,
/// which in practice means it is a `static`.
pub struct HeapMetadata {
    /// A human readable name, used in diagnostics
    pub name: &'static str,
    /// The layout of an instance, header included
    pub layout: Layout,
    /// Drops everything following the header in place.
    ///
    /// This is invoked by the runtime once the last strong reference is released; the
    /// refcounting engine itself never calls it.
    pub deinit: unsafe fn(NonNull<HeapObject>),
}
impl HeapMetadata {
    /// Metadata for objects which consist of nothing but a header
    pub const fn header_only(name: &'static str) -> Self {
        Self {
            name,
            layout: Layout::new::<HeapObject>(),
            deinit: deinit_nothing,
        }
    }
}
impl fmt::Debug for HeapMetadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HeapMetadata")
            .field("name", &self.name)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

unsafe fn deinit_nothing(_object: NonNull<HeapObject>) {}

/// The header at the start of every managed object.
///
/// The layout is fixed: the metadata pointer comes first, immediately followed by the
/// pointer-sized refcount word, so code which knows nothing of this crate can still
/// locate the counts.
#[repr(C)]
pub struct HeapObject {
    metadata: &'static HeapMetadata,
    refcounts: InlineRefCounts,
}

assert_eq_size!(InlineRefCounts, usize);
assert_eq_size!(HeapObject, [usize; 2]);
const_assert_eq!(HeapObject::REFCOUNTS_OFFSET, mem::size_of::<usize>());

impl HeapObject {
    /// The offset of the refcount word from the start of the header
    pub const REFCOUNTS_OFFSET: usize = mem::offset_of!(HeapObject, refcounts);

    /// A header for a newly allocated object, holding one strong reference
    pub fn new(metadata: &'static HeapMetadata) -> Self {
        Self {
            metadata,
            refcounts: InlineRefCounts::new(),
        }
    }

    /// A header for an object which is never deallocated
    pub fn new_immortal(metadata: &'static HeapMetadata) -> Self {
        Self {
            metadata,
            refcounts: InlineRefCounts::new_immortal(),
        }
    }

    /// A header for an object whose storage is not owned by the refcounting machinery,
    /// e.g. an object placed on the stack
    pub fn new_for_not_freeing(metadata: &'static HeapMetadata) -> Self {
        Self {
            metadata,
            refcounts: InlineRefCounts::new_for_not_freeing(),
        }
    }

    #[inline(always)]
    pub fn metadata(&self) -> &'static HeapMetadata {
        self.metadata
    }

    #[inline(always)]
    pub fn refcounts(&self) -> &InlineRefCounts {
        &self.refcounts
    }
}
impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HeapObject")
            .field("class", &self.metadata.name)
            .field("refcounts", &self.refcounts)
            .finish()
    }
}
