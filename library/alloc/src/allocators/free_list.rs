use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use heaprc_system::sync::Mutex;

use super::{AllocError, RawAllocator};

/// A cached, fixed-layout block
struct Block(NonNull<u8>);

// Cached blocks are exclusively owned by the free list
unsafe impl Send for Block {}

/// A bounded cache of fixed-size blocks in front of another allocator.
///
/// Blocks handed back via [`FreeList::deallocate`] are kept for reuse until
/// `capacity` blocks are cached, after which they go straight back to the
/// underlying allocator. The lock is only held while the cache itself is
/// being manipulated, never while calling into the underlying allocator.
pub struct FreeList<A: RawAllocator> {
    allocator: A,
    layout: Layout,
    capacity: usize,
    blocks: Mutex<Vec<Block>>,
}
impl<A: RawAllocator> FreeList<A> {
    pub fn new(allocator: A, layout: Layout, capacity: usize) -> Self {
        Self {
            allocator,
            layout,
            capacity,
            blocks: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The number of blocks currently waiting for reuse
    pub fn cached(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        let cached = self.blocks.lock().pop();
        match cached {
            Some(Block(ptr)) => Ok(ptr),
            None => self.allocator.allocate(self.layout),
        }
    }

    /// Returns a block to the cache, or to the underlying allocator if the cache is full
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`FreeList::allocate`] on this free list, and must
    /// not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        {
            let mut blocks = self.blocks.lock();
            if blocks.len() < self.capacity {
                blocks.push(Block(ptr));
                return;
            }
        }
        self.allocator.deallocate(ptr, self.layout);
    }
}
impl<A: RawAllocator> Drop for FreeList<A> {
    fn drop(&mut self) {
        for Block(ptr) in self.blocks.get_mut().drain(..) {
            unsafe {
                self.allocator.deallocate(ptr, self.layout);
            }
        }
    }
}
impl<A: RawAllocator + fmt::Debug> fmt::Debug for FreeList<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("allocator", &self.allocator)
            .field("layout", &self.layout)
            .field("capacity", &self.capacity)
            .field("cached", &self.cached())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::allocators::System;

    #[test]
    fn free_list_reuses_returned_blocks() {
        let list = FreeList::new(System, Layout::new::<[u64; 2]>(), 2);
        let a = list.allocate().unwrap();
        unsafe { list.deallocate(a) };
        assert_eq!(list.cached(), 1);

        let b = list.allocate().unwrap();
        assert_eq!(a, b);
        assert_eq!(list.cached(), 0);
        unsafe { list.deallocate(b) };
    }

    #[test]
    fn free_list_is_bounded_by_capacity() {
        let list = FreeList::new(System, Layout::new::<u64>(), 1);
        let a = list.allocate().unwrap();
        let b = list.allocate().unwrap();
        unsafe {
            list.deallocate(a);
            list.deallocate(b);
        }
        assert_eq!(list.cached(), 1);
    }

    #[test]
    fn zero_capacity_never_caches() {
        let list = FreeList::new(System, Layout::new::<u64>(), 0);
        let a = list.allocate().unwrap();
        unsafe { list.deallocate(a) };
        assert_eq!(list.cached(), 0);
    }
}
