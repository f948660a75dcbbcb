use core::alloc::Layout;
use core::ptr::NonNull;

use super::{AllocError, RawAllocator};

/// This allocator acts as the system allocator.
///
/// It delegates to the global allocator of the process, so any `#[global_allocator]`
/// installed by the embedding program is honored.
#[derive(Debug, Default, Copy, Clone)]
pub struct System;

unsafe impl RawAllocator for System {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return Err(layout.into());
        }
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| layout.into())
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}
