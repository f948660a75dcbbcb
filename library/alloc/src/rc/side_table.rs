use core::alloc::Layout;
use core::mem;
use core::ptr::NonNull;

use lazy_static::lazy_static;
use log::trace;
use static_assertions::const_assert;

use heaprc_system::env::config;

use super::bits::{InlineLayout, InlineRefCountBits, RefCountLayout};
use super::header::HeapObject;
use super::refcounts::SideTableRefCounts;
use crate::allocators::{FreeList, System};

lazy_static! {
    static ref SIDE_TABLES: FreeList<System> = FreeList::new(
        System,
        Layout::new::<SideTableEntry>(),
        config().side_table_cache
    );
}

/// The out-of-line refcounts of an object which has been promoted.
///
/// An entry is jointly owned by the weak references to its object and by the object's
/// unowned count, which holds one weak reference on the entry's behalf until the
/// object's storage is released. The entry is freed once the weak count drops to zero.
#[repr(C)]
pub struct SideTableEntry {
    object: NonNull<HeapObject>,
    refcounts: SideTableRefCounts,
}

// All mutable state of an entry is atomic
unsafe impl Send for SideTableEntry {}
unsafe impl Sync for SideTableEntry {}

// The low bits of an entry address are dropped when stored in an inline word
const_assert!(mem::align_of::<SideTableEntry>() >= 1 << InlineLayout::SIDE_TABLE_UNUSED_LOW_BITS);

impl SideTableEntry {
    /// The offset of the refcounts from the start of the entry
    pub const REFCOUNTS_OFFSET: usize = mem::offset_of!(SideTableEntry, refcounts);

    /// Allocates an entry for `object`, with placeholder counts to be replaced by
    /// [`SideTableEntry::init_refcounts`] before it is published.
    pub(crate) fn allocate(object: NonNull<HeapObject>) -> NonNull<SideTableEntry> {
        let entry = match SIDE_TABLES.allocate() {
            Ok(ptr) => ptr.cast::<SideTableEntry>(),
            Err(_) => std::alloc::handle_alloc_error(SIDE_TABLES.layout()),
        };
        unsafe {
            entry.as_ptr().write(SideTableEntry {
                object,
                refcounts: SideTableRefCounts::new(),
            });
        }
        trace!(target: "heaprc::rc", "allocated side table {:p} for {:p}", entry, object);
        entry
    }

    /// # Safety
    ///
    /// The entry must not be reachable by any other thread, either because it was never
    /// published or because its weak count has dropped to zero.
    pub(crate) unsafe fn free(entry: NonNull<SideTableEntry>) {
        trace!(target: "heaprc::rc", "freeing side table {:p}", entry);
        entry.as_ptr().drop_in_place();
        SIDE_TABLES.deallocate(entry.cast());
    }

    pub(crate) fn init_refcounts(&self, bits: InlineRefCountBits) {
        self.refcounts.init_from_inline(bits);
    }

    /// The object this entry belongs to.
    ///
    /// The object may already have been freed if its unowned count has reached zero.
    #[inline]
    pub fn object(&self) -> NonNull<HeapObject> {
        self.object
    }

    #[inline]
    pub fn refcounts(&self) -> &SideTableRefCounts {
        &self.refcounts
    }

    /// Returns the object with a new strong reference, unless it is deiniting
    pub fn try_retain(&self) -> Option<NonNull<HeapObject>> {
        if self.refcounts.try_increment() {
            Some(self.object)
        } else {
            None
        }
    }

    #[inline]
    pub fn increment_strong(&self, inc: u32) {
        self.refcounts.increment(inc);
    }

    #[inline]
    pub fn try_increment(&self) -> bool {
        self.refcounts.try_increment()
    }

    #[inline]
    pub fn decrement_strong(&self, dec: u32) -> bool {
        self.refcounts.decrement_should_deinit(dec)
    }

    pub fn decrement_from_one_non_atomic(&self) {
        self.refcounts.decrement_from_one_non_atomic();
    }

    pub fn is_deiniting(&self) -> bool {
        self.refcounts.is_deiniting()
    }

    pub fn is_uniquely_referenced(&self) -> bool {
        self.refcounts.is_uniquely_referenced()
    }

    pub fn count(&self) -> u32 {
        self.refcounts.get_count()
    }

    #[inline]
    pub fn increment_unowned(&self, inc: u32) {
        self.refcounts.increment_unowned(inc);
    }

    /// Releases `dec` unowned references, returning true if the object's storage must
    /// now be freed.
    ///
    /// When it must, the weak reference held by the unowned count is released as well,
    /// which may free this entry.
    ///
    /// # Safety
    ///
    /// `entry` must be a live side table entry.
    pub unsafe fn decrement_unowned_should_free(entry: NonNull<SideTableEntry>, dec: u32) -> bool {
        let should_free = entry.as_ref().refcounts.decrement_unowned_should_free(dec);
        if should_free {
            Self::decrement_weak(entry);
        }
        should_free
    }

    pub fn unowned_count(&self) -> u32 {
        self.refcounts.get_unowned_count()
    }

    /// Adds a weak reference to this entry, unless the object is deiniting
    pub fn increment_weak(&self) -> Option<NonNull<SideTableEntry>> {
        if self.refcounts.is_deiniting() {
            return None;
        }
        self.refcounts.increment_weak();
        Some(NonNull::from(self))
    }

    /// Releases a weak reference, freeing the entry if it was the last one.
    ///
    /// # Safety
    ///
    /// `entry` must be a live side table entry, and the caller must own the weak
    /// reference being released.
    pub unsafe fn decrement_weak(entry: NonNull<SideTableEntry>) {
        let refcounts = &entry.as_ref().refcounts;
        if refcounts.decrement_weak_should_clean_up() {
            debug_assert_eq!(
                refcounts.get_unowned_count(),
                0,
                "freed a side table while its object is still allocated"
            );
            Self::free(entry);
        }
    }

    pub fn weak_count(&self) -> u32 {
        self.refcounts.get_weak_count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rc::{HeapMetadata, RefCountState};

    static TEST_METADATA: HeapMetadata = HeapMetadata::header_only("side_table_test");

    #[test]
    fn entry_copies_inline_counts_on_init() {
        let object = Box::new(HeapObject::new(&TEST_METADATA));
        let entry = SideTableEntry::allocate(NonNull::from(&*object));
        let entry_ref = unsafe { entry.as_ref() };
        entry_ref.init_refcounts(InlineRefCountBits::new(4, 2));
        assert_eq!(
            entry_ref.refcounts().load().state(),
            RefCountState::Counts {
                strong_extra: 4,
                unowned: 2,
                is_deiniting: false
            }
        );
        assert_eq!(entry_ref.count(), 5);
        assert_eq!(entry_ref.weak_count(), 1);
        assert_eq!(entry_ref.object(), NonNull::from(&*object));
        unsafe { SideTableEntry::free(entry) };
    }

    #[test]
    fn entry_layout_is_fixed() {
        assert_eq!(SideTableEntry::REFCOUNTS_OFFSET % mem::align_of::<u64>(), 0);
        assert!(SideTableEntry::REFCOUNTS_OFFSET >= mem::size_of::<usize>());
    }
}
