use core::fmt;
use core::ptr::NonNull;

use log::trace;

use heaprc_system::sync::{fence, Atomic, AtomicU32, Ordering};

use super::bits::*;
use super::error::{fatal, RefCountError};
use super::header::HeapObject;
use super::side_table::SideTableEntry;

/// Behavior which differs between the inline and side table engines.
pub trait RefCountKind: RefCountLayout + Sized {
    /// Storage for the weak count, which only side table entries carry
    type WeakCount: fmt::Debug + Send + Sync;

    /// Whether the non-atomic variants really are non-atomic for this kind.
    ///
    /// When false they are implemented with the atomic operations.
    const NON_ATOMIC: bool;

    fn new_weak_count() -> Self::WeakCount;

    /// Called when a field of a word without a side table would overflow.
    ///
    /// Returns the side table entry the operation must be retried on. Returns `None`
    /// only if `fail_if_deiniting` is set and the object has begun deinitialization.
    fn overflow(
        refcounts: &RefCounts<Self>,
        fail_if_deiniting: bool,
        err: RefCountError,
    ) -> Option<NonNull<SideTableEntry>>;
}

impl RefCountKind for InlineLayout {
    type WeakCount = ();

    const NON_ATOMIC: bool = true;

    #[inline(always)]
    fn new_weak_count() {}

    #[cold]
    fn overflow(
        refcounts: &RefCounts<Self>,
        fail_if_deiniting: bool,
        _err: RefCountError,
    ) -> Option<NonNull<SideTableEntry>> {
        refcounts.allocate_side_table(fail_if_deiniting)
    }
}

impl RefCountKind for SideTableLayout {
    type WeakCount = AtomicU32;

    const NON_ATOMIC: bool = false;

    #[inline(always)]
    fn new_weak_count() -> AtomicU32 {
        // The weak reference held on behalf of the unowned count
        AtomicU32::new(1)
    }

    #[cold]
    fn overflow(
        _refcounts: &RefCounts<Self>,
        _fail_if_deiniting: bool,
        err: RefCountError,
    ) -> Option<NonNull<SideTableEntry>> {
        fatal(err)
    }
}

/// The refcounts embedded in an object header
pub type InlineRefCounts = RefCounts<InlineLayout>;
/// The refcounts stored in a side table entry
pub type SideTableRefCounts = RefCounts<SideTableLayout>;

/// The atomic refcount engine.
///
/// Every operation is a compare-and-swap loop over a single word, with the exception
/// of the weak count of a side table entry, which is a separate atomic. Inline
/// refcounts forward every operation to their side table once one exists.
///
/// Strong increments are relaxed. A strong decrement which drops the count to zero is
/// a release operation, and the caller must issue an acquire fence before running the
/// deinitializer, see [`RefCounts::decrement_should_deinit`].
///
/// Any load of the word which may observe a side table pointer is an acquire, pairing
/// with the release which published the entry, since the entry is dereferenced next.
#[repr(C)]
pub struct RefCounts<K: RefCountKind> {
    bits: Atomic<RefCountBitsT<K>>,
    weak: K::WeakCount,
}

impl<K: RefCountKind> RefCounts<K> {
    /// One strong reference, and the unowned reference held on its behalf
    pub(crate) fn new() -> Self {
        Self::from_bits(RefCountBitsT::new(0, 1))
    }

    /// Refcounts for an object whose storage is owned elsewhere.
    ///
    /// The extra unowned reference is never released, so the storage is never freed by
    /// the refcounting machinery.
    pub(crate) fn new_for_not_freeing() -> Self {
        Self::from_bits(RefCountBitsT::new(0, 2))
    }

    pub(crate) fn new_immortal() -> Self {
        Self::from_bits(RefCountBitsT::immortal())
    }

    fn from_bits(bits: RefCountBitsT<K>) -> Self {
        Self {
            bits: Atomic::new(bits),
            weak: K::new_weak_count(),
        }
    }

    /// Returns a snapshot of the underlying word
    #[inline]
    pub fn load(&self) -> RefCountBitsT<K> {
        self.bits.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn entry<'a>(&'a self, side: NonNull<SideTableEntry>) -> &'a SideTableEntry {
        // SAFETY: A published side table entry lives at least as long as the unowned
        // count of its object is non-zero, and callers of these functions hold some
        // kind of reference to the object.
        unsafe { side.as_ref() }
    }

    /// Adds `inc` strong references
    #[inline]
    pub fn increment(&self, inc: u32) {
        let mut oldbits = self.bits.load(Ordering::Acquire);
        loop {
            if oldbits.is_immortal() {
                return;
            }
            let mut newbits = oldbits;
            if !newbits.increment_strong_extra_count(inc) {
                return self.increment_slow(oldbits, inc);
            }
            match self.bits.compare_exchange_weak(
                oldbits,
                newbits,
                Ordering::Relaxed,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => oldbits = actual,
            }
        }
    }

    /// Like [`RefCounts::increment`], but the caller guarantees that nothing else is
    /// modifying the strong or unowned counts concurrently
    #[inline]
    pub fn increment_non_atomic(&self, inc: u32) {
        if !K::NON_ATOMIC {
            return self.increment(inc);
        }
        let oldbits = self.bits.load(Ordering::Acquire);
        if oldbits.is_immortal() {
            return;
        }
        let mut newbits = oldbits;
        if !newbits.increment_strong_extra_count(inc) {
            return self.increment_slow(oldbits, inc);
        }
        self.bits.store(newbits, Ordering::Relaxed);
    }

    #[cold]
    #[inline(never)]
    fn increment_slow(&self, oldbits: RefCountBitsT<K>, inc: u32) {
        let side = match oldbits.side_table() {
            Some(side) => side,
            None => match K::overflow(self, false, RefCountError::RetainOverflow) {
                Some(side) => side,
                None => fatal(RefCountError::RetainOverflow),
            },
        };
        self.entry(side).increment_strong(inc);
    }

    /// Adds a strong reference unless the object has begun deinitialization.
    ///
    /// Returns false, without modifying anything, if it has.
    #[inline]
    pub fn try_increment(&self) -> bool {
        let mut oldbits = self.bits.load(Ordering::Acquire);
        loop {
            if oldbits.is_immortal() {
                return true;
            }
            if let Some(side) = oldbits.side_table() {
                return self.entry(side).try_increment();
            }
            if oldbits.is_deiniting() {
                return false;
            }
            let mut newbits = oldbits;
            if !newbits.increment_strong_extra_count(1) {
                return self.try_increment_slow();
            }
            match self.bits.compare_exchange_weak(
                oldbits,
                newbits,
                Ordering::Relaxed,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => oldbits = actual,
            }
        }
    }

    #[inline]
    pub fn try_increment_non_atomic(&self) -> bool {
        if !K::NON_ATOMIC {
            return self.try_increment();
        }
        let oldbits = self.bits.load(Ordering::Acquire);
        if oldbits.is_immortal() {
            return true;
        }
        if let Some(side) = oldbits.side_table() {
            return self.entry(side).try_increment();
        }
        if oldbits.is_deiniting() {
            return false;
        }
        let mut newbits = oldbits;
        if !newbits.increment_strong_extra_count(1) {
            return self.try_increment_slow();
        }
        self.bits.store(newbits, Ordering::Relaxed);
        true
    }

    #[cold]
    #[inline(never)]
    fn try_increment_slow(&self) -> bool {
        match K::overflow(self, true, RefCountError::RetainOverflow) {
            Some(side) => self.entry(side).try_increment(),
            None => false,
        }
    }

    /// Releases `dec` strong references.
    ///
    /// Returns true if this released the last one, in which case the object is now
    /// deiniting, and the caller must run the deinitializer after an acquire fence.
    #[inline]
    pub fn decrement_should_deinit(&self, dec: u32) -> bool {
        let mut oldbits = self.bits.load(Ordering::Acquire);
        loop {
            if oldbits.is_immortal() {
                return false;
            }
            if let Some(side) = oldbits.side_table() {
                return self.entry(side).decrement_strong(dec);
            }
            let (newbits, deinit) = Self::decrement_strong_bits(oldbits, dec);
            match self.bits.compare_exchange_weak(
                oldbits,
                newbits,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return deinit,
                Err(actual) => oldbits = actual,
            }
        }
    }

    /// Like [`RefCounts::decrement_should_deinit`], but the caller guarantees that
    /// nothing else is modifying the counts concurrently.
    ///
    /// Outstanding unowned references could be released from other threads at any
    /// time, so the atomic path is taken whenever any exist.
    #[inline]
    pub fn decrement_should_deinit_non_atomic(&self, dec: u32) -> bool {
        if !K::NON_ATOMIC {
            return self.decrement_should_deinit(dec);
        }
        let oldbits = self.bits.load(Ordering::Acquire);
        if oldbits.is_immortal() {
            return false;
        }
        if let Some(side) = oldbits.side_table() {
            return self.entry(side).decrement_strong(dec);
        }
        if oldbits.unowned_count() != 1 {
            return self.decrement_should_deinit(dec);
        }
        let (newbits, deinit) = Self::decrement_strong_bits(oldbits, dec);
        self.bits.store(newbits, Ordering::Relaxed);
        deinit
    }

    #[inline(always)]
    fn decrement_strong_bits(oldbits: RefCountBitsT<K>, dec: u32) -> (RefCountBitsT<K>, bool) {
        let mut newbits = oldbits;
        if newbits.decrement_strong_extra_count(dec) {
            return (newbits, false);
        }
        debug_assert!(
            !oldbits.is_deiniting(),
            "released an object whose strong count is already zero"
        );
        debug_assert!(
            dec as u64 <= oldbits.strong_extra_count() as u64 + 1,
            "released more strong references than are held"
        );
        let mut newbits = oldbits;
        newbits.set_strong_extra_count(0);
        newbits.set_is_deiniting(true);
        (newbits, true)
    }

    /// Moves the object from exactly one strong reference to deiniting.
    ///
    /// The caller must hold the only strong reference, and nothing else may be
    /// modifying the counts concurrently.
    pub fn decrement_from_one_non_atomic(&self) {
        if !K::NON_ATOMIC {
            self.decrement_should_deinit(1);
            return;
        }
        let mut bits = self.bits.load(Ordering::Acquire);
        if bits.is_immortal() {
            return;
        }
        if let Some(side) = bits.side_table() {
            return self.entry(side).decrement_from_one_non_atomic();
        }
        debug_assert!(!bits.is_deiniting());
        debug_assert_eq!(bits.strong_extra_count(), 0, "expected exactly one strong reference");
        bits.set_is_deiniting(true);
        self.bits.store(bits, Ordering::Relaxed);
    }

    /// The current strong count
    pub fn get_count(&self) -> u32 {
        let bits = self.bits.load(Ordering::Acquire);
        if let Some(side) = bits.side_table() {
            return self.entry(side).count();
        }
        bits.strong_extra_count() + 1
    }

    /// True if there is exactly one strong reference and the object is not deiniting.
    ///
    /// This is computed from a single load of the word.
    pub fn is_uniquely_referenced(&self) -> bool {
        let bits = self.bits.load(Ordering::Acquire);
        if let Some(side) = bits.side_table() {
            return self.entry(side).is_uniquely_referenced();
        }
        debug_assert!(
            !bits.is_deiniting(),
            "uniqueness queried on a deiniting object"
        );
        bits.is_uniquely_referenced()
    }

    pub fn is_deiniting(&self) -> bool {
        let bits = self.bits.load(Ordering::Acquire);
        if let Some(side) = bits.side_table() {
            return self.entry(side).is_deiniting();
        }
        !bits.is_immortal() && bits.is_deiniting()
    }

    pub fn is_immortal(&self) -> bool {
        let bits = self.bits.load(Ordering::Acquire);
        if let Some(side) = bits.side_table() {
            return self.entry(side).refcounts().is_immortal();
        }
        bits.is_immortal()
    }

    /// True if a deiniting object can be freed immediately, without releasing its
    /// unowned reference: it never acquired a side table, and no other strong or
    /// unowned references exist.
    pub fn can_be_freed_now(&self) -> bool {
        let bits = self.bits.load(Ordering::Acquire);
        !bits.uses_slow_rc()
            && bits.is_deiniting()
            && bits.strong_extra_count() == 0
            && bits.unowned_count() == 1
    }

    #[inline]
    pub fn has_side_table(&self) -> bool {
        self.bits.load(Ordering::Acquire).has_side_table()
    }

    #[inline]
    pub fn side_table(&self) -> Option<NonNull<SideTableEntry>> {
        self.bits.load(Ordering::Acquire).side_table()
    }

    /// Makes the object immortal, after which every refcount operation is a no-op.
    ///
    /// If the counts already live in a side table, it is the side table that becomes
    /// immortal.
    pub fn set_immortal(&self) {
        let mut oldbits = self.bits.load(Ordering::Acquire);
        loop {
            if oldbits.is_immortal() {
                return;
            }
            if let Some(side) = oldbits.side_table() {
                return self.entry(side).refcounts().set_immortal();
            }
            match self.bits.compare_exchange_weak(
                oldbits,
                RefCountBitsT::immortal(),
                Ordering::Relaxed,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => oldbits = actual,
            }
        }
    }

    /// Adds `inc` unowned references
    #[inline]
    pub fn increment_unowned(&self, inc: u32) {
        let mut oldbits = self.bits.load(Ordering::Acquire);
        loop {
            if oldbits.is_immortal() {
                return;
            }
            if let Some(side) = oldbits.side_table() {
                return self.entry(side).increment_unowned(inc);
            }
            debug_assert_ne!(
                oldbits.unowned_count(),
                0,
                "retained an unowned reference to a freed object"
            );
            let mut newbits = oldbits;
            if !newbits.increment_unowned_count(inc) {
                return self.increment_unowned_slow(inc);
            }
            match self.bits.compare_exchange_weak(
                oldbits,
                newbits,
                Ordering::Relaxed,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => oldbits = actual,
            }
        }
    }

    #[inline]
    pub fn increment_unowned_non_atomic(&self, inc: u32) {
        if !K::NON_ATOMIC {
            return self.increment_unowned(inc);
        }
        let oldbits = self.bits.load(Ordering::Acquire);
        if oldbits.is_immortal() {
            return;
        }
        if let Some(side) = oldbits.side_table() {
            return self.entry(side).increment_unowned(inc);
        }
        let mut newbits = oldbits;
        if !newbits.increment_unowned_count(inc) {
            return self.increment_unowned_slow(inc);
        }
        self.bits.store(newbits, Ordering::Relaxed);
    }

    #[cold]
    #[inline(never)]
    fn increment_unowned_slow(&self, inc: u32) {
        match K::overflow(self, false, RefCountError::UnownedRetainOverflow) {
            Some(side) => self.entry(side).increment_unowned(inc),
            None => fatal(RefCountError::UnownedRetainOverflow),
        }
    }

    /// Releases `dec` unowned references.
    ///
    /// Returns true if the unowned count dropped to zero, in which case the caller must
    /// release the object's storage. If the object has a side table, the weak reference
    /// held on behalf of the unowned count has already been released when this returns.
    #[inline]
    pub fn decrement_unowned_should_free(&self, dec: u32) -> bool {
        let mut oldbits = self.bits.load(Ordering::Acquire);
        loop {
            if oldbits.is_immortal() {
                return false;
            }
            if let Some(side) = oldbits.side_table() {
                return unsafe { SideTableEntry::decrement_unowned_should_free(side, dec) };
            }
            let (newbits, free) = Self::decrement_unowned_bits(oldbits, dec);
            match self.bits.compare_exchange_weak(
                oldbits,
                newbits,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if free {
                        fence(Ordering::Acquire);
                    }
                    return free;
                }
                Err(actual) => oldbits = actual,
            }
        }
    }

    #[inline]
    pub fn decrement_unowned_should_free_non_atomic(&self, dec: u32) -> bool {
        if !K::NON_ATOMIC {
            return self.decrement_unowned_should_free(dec);
        }
        let oldbits = self.bits.load(Ordering::Acquire);
        if oldbits.is_immortal() {
            return false;
        }
        if let Some(side) = oldbits.side_table() {
            return unsafe { SideTableEntry::decrement_unowned_should_free(side, dec) };
        }
        let (newbits, free) = Self::decrement_unowned_bits(oldbits, dec);
        self.bits.store(newbits, Ordering::Relaxed);
        free
    }

    #[inline(always)]
    fn decrement_unowned_bits(oldbits: RefCountBitsT<K>, dec: u32) -> (RefCountBitsT<K>, bool) {
        let mut newbits = oldbits;
        newbits.decrement_unowned_count(dec);
        let free = newbits.unowned_count() == 0;
        debug_assert!(
            !free || newbits.is_deiniting(),
            "released the last unowned reference of an object which was never deinitialized"
        );
        (newbits, free)
    }

    /// The current unowned count
    pub fn get_unowned_count(&self) -> u32 {
        let bits = self.bits.load(Ordering::Acquire);
        if let Some(side) = bits.side_table() {
            return self.entry(side).unowned_count();
        }
        bits.unowned_count()
    }
}

impl InlineRefCounts {
    /// Recovers the header these refcounts are embedded in
    #[inline]
    pub fn heap_object(&self) -> NonNull<HeapObject> {
        let ptr = self as *const Self as *const u8;
        // SAFETY: Inline refcounts are only ever constructed as part of a HeapObject,
        // at a fixed offset within it.
        unsafe {
            let header = ptr.sub(HeapObject::REFCOUNTS_OFFSET) as *mut HeapObject;
            NonNull::new_unchecked(header)
        }
    }

    /// Returns the side table of this object, creating one if necessary.
    ///
    /// If `fail_if_deiniting` is set, `None` is returned instead of creating a side table
    /// for an object which has begun deinitialization. When multiple threads race to
    /// promote the same object, exactly one entry is published, and every thread
    /// observes that entry.
    #[cold]
    pub fn allocate_side_table(&self, fail_if_deiniting: bool) -> Option<NonNull<SideTableEntry>> {
        let mut oldbits = self.bits.load(Ordering::Acquire);
        if let Some(side) = oldbits.side_table() {
            return Some(side);
        }
        if fail_if_deiniting && oldbits.is_deiniting() {
            return None;
        }

        let side = SideTableEntry::allocate(self.heap_object());
        let newbits = InlineRefCountBits::from_side_table(side);
        loop {
            if let Some(existing) = oldbits.side_table() {
                trace!(target: "heaprc::rc", "lost race to promote {:p}, discarding side table {:p}", self.heap_object(), side);
                unsafe {
                    SideTableEntry::free(side);
                }
                return Some(existing);
            }
            if fail_if_deiniting && oldbits.is_deiniting() {
                unsafe {
                    SideTableEntry::free(side);
                }
                return None;
            }
            self.entry(side).init_refcounts(oldbits);
            match self.bits.compare_exchange_weak(
                oldbits,
                newbits,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(target: "heaprc::rc", "promoted {:p} to side table {:p}", self.heap_object(), side);
                    return Some(side);
                }
                Err(actual) => oldbits = actual,
            }
        }
    }

    /// Promotes the object to a side table if needed, and adds a weak reference to it.
    ///
    /// Returns `None` if the object has begun deinitialization.
    pub fn form_weak_reference(&self) -> Option<NonNull<SideTableEntry>> {
        let side = self.allocate_side_table(true)?;
        self.entry(side).increment_weak()
    }

    /// The current weak count.
    ///
    /// An object without a side table cannot have weak references, but its unowned count
    /// still accounts for one.
    pub fn get_weak_count(&self) -> u32 {
        let bits = self.bits.load(Ordering::Acquire);
        if let Some(side) = bits.side_table() {
            return self.entry(side).weak_count();
        }
        (bits.unowned_count() > 0) as u32
    }
}

impl SideTableRefCounts {
    pub(crate) fn init_from_inline(&self, inline: InlineRefCountBits) {
        self.bits
            .store(SideTableRefCountBits::from_inline(inline), Ordering::Relaxed);
    }

    pub fn increment_weak(&self) {
        let result = self.weak.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
            debug_assert_ne!(count, 0, "retained a weak reference to a freed side table");
            count.checked_add(1)
        });
        if result.is_err() {
            fatal(RefCountError::WeakRetainOverflow);
        }
    }

    pub fn increment_weak_non_atomic(&self) {
        let count = self.weak.load(Ordering::Relaxed);
        match count.checked_add(1) {
            Some(count) => self.weak.store(count, Ordering::Relaxed),
            None => fatal(RefCountError::WeakRetainOverflow),
        }
    }

    /// Releases a weak reference, returning true if it was the last one, in which
    /// case the caller must free the side table entry
    pub fn decrement_weak_should_clean_up(&self) -> bool {
        let count = self.weak.fetch_sub(1, Ordering::Release);
        debug_assert_ne!(count, 0, "released a weak reference more times than it was retained");
        if count != 1 {
            return false;
        }
        fence(Ordering::Acquire);
        true
    }

    pub fn decrement_weak_should_clean_up_non_atomic(&self) -> bool {
        let count = self.weak.load(Ordering::Relaxed);
        debug_assert_ne!(count, 0, "released a weak reference more times than it was retained");
        self.weak.store(count.wrapping_sub(1), Ordering::Relaxed);
        count == 1
    }

    pub fn get_weak_count(&self) -> u32 {
        self.weak.load(Ordering::Relaxed)
    }
}

impl<K: RefCountKind> fmt::Debug for RefCounts<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefCounts")
            .field("bits", &self.bits.load(Ordering::Relaxed))
            .field("weak", &self.weak)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::rc::HeapMetadata;

    static TEST_METADATA: HeapMetadata = HeapMetadata::header_only("refcounts_test");

    fn object() -> Box<HeapObject> {
        Box::new(HeapObject::new(&TEST_METADATA))
    }

    #[test]
    fn fresh_object_counts() {
        let object = object();
        let rc = object.refcounts();
        assert_eq!(rc.get_count(), 1);
        assert_eq!(rc.get_unowned_count(), 1);
        assert_eq!(rc.get_weak_count(), 1);
        assert!(rc.is_uniquely_referenced());
        assert!(!rc.has_side_table());
        assert!(!rc.is_deiniting());
    }

    #[test]
    fn round_trip_deinits_on_final_release() {
        let object = object();
        let rc = object.refcounts();
        let k = 5;
        for _ in 0..k {
            rc.increment(1);
        }
        assert_eq!(rc.get_count(), k + 1);
        assert!(!rc.is_uniquely_referenced());
        for _ in 0..k {
            assert!(!rc.decrement_should_deinit(1));
        }
        assert!(rc.decrement_should_deinit(1));
        assert!(rc.is_deiniting());
        assert!(rc.can_be_freed_now());
        assert!(!rc.try_increment());
    }

    #[test]
    fn multi_count_release_deinits() {
        let object = object();
        let rc = object.refcounts();
        rc.increment(9);
        assert!(!rc.decrement_should_deinit(9));
        rc.increment(3);
        assert!(rc.decrement_should_deinit(4));
    }

    #[test]
    fn non_atomic_variants_match_atomic_ones() {
        let object = object();
        let rc = object.refcounts();
        rc.increment_non_atomic(2);
        assert_eq!(rc.get_count(), 3);
        assert!(rc.try_increment_non_atomic());
        assert!(!rc.decrement_should_deinit_non_atomic(3));
        rc.decrement_from_one_non_atomic();
        assert!(rc.is_deiniting());
        assert!(!rc.try_increment_non_atomic());
    }

    #[test]
    fn strong_overflow_promotes_to_side_table() {
        let object = object();
        let rc = object.refcounts();
        let max = InlineLayout::STRONG_EXTRA.max() as u32;
        rc.increment(max);
        assert!(!rc.has_side_table());
        assert_eq!(rc.get_count(), max + 1);

        rc.increment(1);
        assert!(rc.has_side_table());
        assert_eq!(rc.get_count(), max + 2);
        assert_eq!(rc.get_unowned_count(), 1);
        assert_eq!(rc.get_weak_count(), 1);

        let side = rc.side_table().unwrap();
        assert_eq!(unsafe { side.as_ref() }.object(), NonNull::from(&*object));

        assert!(!rc.decrement_should_deinit(max + 1));
        assert!(rc.decrement_should_deinit(1));
        assert!(rc.is_deiniting());
        assert!(!rc.can_be_freed_now());
        assert!(rc.decrement_unowned_should_free(1));
    }

    #[test]
    fn unowned_overflow_promotes_to_side_table() {
        let object = object();
        let rc = object.refcounts();
        let max = InlineLayout::UNOWNED.max() as u32;
        rc.increment_unowned(max - 1);
        assert!(!rc.has_side_table());
        rc.increment_unowned(1);
        assert!(rc.has_side_table());
        assert_eq!(rc.get_unowned_count(), max + 1);

        assert!(!rc.decrement_unowned_should_free(max));
        assert_eq!(rc.get_unowned_count(), 1);
        assert!(rc.decrement_should_deinit(1));
        assert!(rc.decrement_unowned_should_free(1));
    }

    #[test]
    fn weak_reference_promotes_and_holds_side_table() {
        let object = object();
        let rc = object.refcounts();
        let side = rc.form_weak_reference().unwrap();
        assert_eq!(rc.side_table(), Some(side));
        assert_eq!(rc.get_weak_count(), 2);
        assert_eq!(rc.form_weak_reference(), Some(side));
        assert_eq!(rc.get_weak_count(), 3);

        unsafe {
            SideTableEntry::decrement_weak(side);
        }
        assert!(rc.decrement_should_deinit(1));
        assert_eq!(rc.form_weak_reference(), None);
        assert!(unsafe { side.as_ref() }.try_retain().is_none());

        // Freeing the storage drops the implicit weak reference; ours keeps the entry alive
        assert!(rc.decrement_unowned_should_free(1));
        let entry = unsafe { side.as_ref() };
        assert_eq!(entry.weak_count(), 1);
        assert_eq!(entry.unowned_count(), 0);
        unsafe {
            SideTableEntry::decrement_weak(side);
        }
    }

    #[test]
    fn weak_reference_is_not_formed_while_deiniting() {
        let object = object();
        let rc = object.refcounts();
        assert!(rc.decrement_should_deinit(1));
        assert_eq!(rc.form_weak_reference(), None);
        assert!(!rc.has_side_table());
    }

    #[test]
    fn immortal_refcounts_ignore_everything() {
        let object = Box::new(HeapObject::new_immortal(&TEST_METADATA));
        let rc = object.refcounts();
        let before = rc.load();
        rc.increment(1);
        rc.increment(1000);
        rc.increment_unowned(3);
        assert!(!rc.decrement_should_deinit(1));
        assert!(!rc.decrement_should_deinit(1000));
        assert!(!rc.decrement_unowned_should_free(1));
        assert!(rc.try_increment());
        assert_eq!(rc.load(), before);
        assert!(rc.is_immortal());
        assert!(!rc.is_deiniting());
        assert!(!rc.is_uniquely_referenced());
    }

    #[test]
    fn set_immortal_on_promoted_object_makes_side_table_immortal() {
        let object = object();
        let rc = object.refcounts();
        let side = rc.form_weak_reference().unwrap();
        rc.set_immortal();
        assert!(rc.has_side_table());
        assert!(rc.is_immortal());
        assert!(!rc.decrement_should_deinit(1));
        assert!(!rc.decrement_should_deinit(1));
        assert!(!rc.is_deiniting());
        assert!(unsafe { side.as_ref() }.try_retain().is_some());
    }

    #[test]
    fn not_freeing_objects_keep_their_storage() {
        let object = Box::new(HeapObject::new_for_not_freeing(&TEST_METADATA));
        let rc = object.refcounts();
        assert_eq!(rc.get_unowned_count(), 2);
        assert!(rc.decrement_should_deinit(1));
        assert!(!rc.can_be_freed_now());
        assert!(!rc.decrement_unowned_should_free(1));
        assert_eq!(rc.get_unowned_count(), 1);
    }

    #[test]
    fn side_table_weak_count_tracks_references() {
        let object = object();
        let rc = object.refcounts();
        let side = rc.allocate_side_table(false).unwrap();
        let entry = unsafe { side.as_ref() };
        let counts = entry.refcounts();
        assert_eq!(counts.get_weak_count(), 1);
        counts.increment_weak();
        counts.increment_weak_non_atomic();
        assert_eq!(counts.get_weak_count(), 3);
        assert!(!counts.decrement_weak_should_clean_up());
        assert!(!counts.decrement_weak_should_clean_up_non_atomic());
        assert_eq!(counts.get_weak_count(), 1);

        assert!(rc.decrement_should_deinit(1));
        assert!(rc.decrement_unowned_should_free(1));
    }

    #[test]
    fn inline_refcounts_locate_their_header() {
        let object = object();
        assert_eq!(object.refcounts().heap_object(), NonNull::from(&*object));
    }
}
