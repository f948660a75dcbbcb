mod free_list;
mod system;

pub use self::free_list::FreeList;
pub use self::system::System;

use core::alloc::Layout;
use core::ptr::NonNull;

/// The error returned when an allocator cannot satisfy a request
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("failed to allocate {size} bytes with alignment {align}")]
pub struct AllocError {
    pub size: usize,
    pub align: usize,
}
impl From<Layout> for AllocError {
    fn from(layout: Layout) -> Self {
        Self {
            size: layout.size(),
            align: layout.align(),
        }
    }
}

/// A source of raw, uninitialized memory.
///
/// This is a stable stand-in for the unstable `core::alloc::Allocator`, restricted to
/// what the runtime actually needs.
///
/// # Safety
///
/// Implementations must return blocks that satisfy the requested layout, and must remain
/// valid until passed back to `deallocate` with that same layout.
pub unsafe trait RawAllocator: Send + Sync {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}
