//! Allocation, teardown, and strong references of managed objects.
//!
//! All functions taking a `NonNull<HeapObject>` require it to point to an initialized
//! object header on which the caller holds the reference the operation consumes or
//! relies upon.
use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use log::trace;

use heaprc_alloc::allocators::{AllocError, RawAllocator, System};
use heaprc_alloc::rc::{HeapMetadata, HeapObject};
use heaprc_system::env::{config, CLOBBER_PATTERN};
use heaprc_system::sync::{fence, Once, Ordering};

use crate::unowned::unowned_release;

/// A managed object holding a value of type `T`
#[repr(C)]
pub struct ManagedBox<T> {
    header: HeapObject,
    value: T,
}
impl<T> ManagedBox<T> {
    #[inline]
    pub fn header(&self) -> &HeapObject {
        &self.header
    }

    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// # Safety
    ///
    /// `this` must point to an allocation with the layout of `ManagedBox<T>`.
    #[inline]
    pub unsafe fn value_ptr(this: NonNull<Self>) -> *mut T {
        ptr::addr_of_mut!((*this.as_ptr()).value)
    }
}

/// The metadata for all managed objects holding a `T`.
///
/// ```
/// use heaprc_rt::{ClassMetadata, Strong};
///
/// static POINT: ClassMetadata<(i32, i32)> = ClassMetadata::new("Point");
///
/// let p = Strong::new((1, 2), &POINT);
/// assert_eq!(p.0, 1);
/// ```
pub struct ClassMetadata<T> {
    metadata: HeapMetadata,
    _marker: PhantomData<fn() -> T>,
}
impl<T> ClassMetadata<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            metadata: HeapMetadata {
                name,
                layout: Layout::new::<ManagedBox<T>>(),
                deinit: drop_value::<T>,
            },
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn metadata(&'static self) -> &'static HeapMetadata {
        &self.metadata
    }
}

unsafe fn drop_value<T>(object: NonNull<HeapObject>) {
    ptr::drop_in_place(ManagedBox::<T>::value_ptr(object.cast()));
}

/// Allocates storage for an object of the given class, and initializes its header.
///
/// The new object holds one strong reference, owned by the caller. Everything past the
/// header is uninitialized.
pub fn alloc_object(metadata: &'static HeapMetadata) -> Result<NonNull<HeapObject>, AllocError> {
    debug_assert!(metadata.layout.size() >= mem::size_of::<HeapObject>());
    debug_assert!(metadata.layout.align() >= mem::align_of::<HeapObject>());
    let object = System.allocate(metadata.layout)?.cast::<HeapObject>();
    unsafe {
        object.as_ptr().write(HeapObject::new(metadata));
    }
    trace!(target: "heaprc::rt", "allocated {} at {:p}", metadata.name, object);
    Ok(object)
}

/// Initializes the header of an object which lives for the rest of the process.
///
/// The header is written exactly once per `token`, so this may be called on every
/// access to the object, from any thread. Later calls leave the header untouched, even
/// if the object has since acquired a side table.
///
/// # Safety
///
/// `object` must be valid for writes, and must remain valid forever. `token` must be
/// used with no other object.
pub unsafe fn init_static_object(
    object: NonNull<HeapObject>,
    metadata: &'static HeapMetadata,
    token: &Once,
) -> NonNull<HeapObject> {
    token.call_once(|| {
        object.as_ptr().write(HeapObject::new_immortal(metadata));
    });
    object
}

/// Initializes the header of an object whose storage is owned by the caller, e.g. one
/// on the stack.
///
/// Such an object is deinitialized as usual, but its storage is never released by the
/// runtime, see [`crate::diagnostics::verify_end_of_lifetime`].
///
/// # Safety
///
/// `object` must be valid for writes, and must outlive every reference to it.
pub unsafe fn init_stack_object(object: NonNull<HeapObject>, metadata: &'static HeapMetadata) {
    object.as_ptr().write(HeapObject::new_for_not_freeing(metadata));
}

#[inline]
pub unsafe fn retain(object: NonNull<HeapObject>) -> NonNull<HeapObject> {
    object.as_ref().refcounts().increment(1);
    object
}

#[inline]
pub unsafe fn retain_n(object: NonNull<HeapObject>, n: u32) -> NonNull<HeapObject> {
    object.as_ref().refcounts().increment(n);
    object
}

/// # Safety
///
/// In addition to the usual requirements, no other thread may be accessing the refcounts
/// of `object` concurrently.
#[inline]
pub unsafe fn retain_non_atomic(object: NonNull<HeapObject>) -> NonNull<HeapObject> {
    object.as_ref().refcounts().increment_non_atomic(1);
    object
}

/// # Safety
///
/// See [`retain_non_atomic`].
#[inline]
pub unsafe fn retain_n_non_atomic(object: NonNull<HeapObject>, n: u32) -> NonNull<HeapObject> {
    object.as_ref().refcounts().increment_non_atomic(n);
    object
}

/// Releases a strong reference, tearing the object down if it was the last one
#[inline]
pub unsafe fn release(object: NonNull<HeapObject>) {
    release_n(object, 1)
}

#[inline]
pub unsafe fn release_n(object: NonNull<HeapObject>, n: u32) {
    if object.as_ref().refcounts().decrement_should_deinit(n) {
        deinit_object(object);
    }
}

/// # Safety
///
/// See [`retain_non_atomic`].
#[inline]
pub unsafe fn release_non_atomic(object: NonNull<HeapObject>) {
    release_n_non_atomic(object, 1)
}

/// # Safety
///
/// See [`retain_non_atomic`].
#[inline]
pub unsafe fn release_n_non_atomic(object: NonNull<HeapObject>, n: u32) {
    if object
        .as_ref()
        .refcounts()
        .decrement_should_deinit_non_atomic(n)
    {
        deinit_object(object);
    }
}

/// Tears down an object whose last strong reference is held by the caller, without
/// touching the refcount word atomically.
///
/// # Safety
///
/// The caller must hold the only strong reference, and no other thread may be accessing
/// the refcounts of `object` concurrently.
pub unsafe fn release_unique_non_atomic(object: NonNull<HeapObject>) {
    object.as_ref().refcounts().decrement_from_one_non_atomic();
    deinit_object(object);
}

/// Marks an object as deiniting without running its deinitializer.
///
/// # Safety
///
/// See [`release_unique_non_atomic`].
pub unsafe fn set_deallocating(object: NonNull<HeapObject>) {
    object.as_ref().refcounts().decrement_from_one_non_atomic();
}

#[cold]
unsafe fn deinit_object(object: NonNull<HeapObject>) {
    // Make every write performed under a strong reference visible to the deinitializer
    fence(Ordering::Acquire);
    let metadata = object.as_ref().metadata();
    trace!(target: "heaprc::rt", "deinitializing {} at {:p}", metadata.name, object);
    (metadata.deinit)(object);
    dealloc_object(object);
}

/// Adds a strong reference unless the object is already being deinitialized
#[inline]
pub unsafe fn try_retain(object: NonNull<HeapObject>) -> bool {
    object.as_ref().refcounts().try_increment()
}

pub unsafe fn is_deallocating(object: NonNull<HeapObject>) -> bool {
    object.as_ref().refcounts().is_deiniting()
}

pub unsafe fn retain_count(object: NonNull<HeapObject>) -> u32 {
    object.as_ref().refcounts().get_count()
}

/// True if the caller holds the only strong reference.
///
/// # Safety
///
/// The object must not be deiniting; debug builds assert this.
pub unsafe fn is_uniquely_referenced(object: NonNull<HeapObject>) -> bool {
    object.as_ref().refcounts().is_uniquely_referenced()
}

/// Makes every subsequent refcount operation on `object` a no-op
pub unsafe fn set_immortal(object: NonNull<HeapObject>) {
    object.as_ref().refcounts().set_immortal()
}

/// Finishes the teardown of a deinitialized object.
///
/// If nothing else refers to the object its storage is released immediately. Otherwise
/// the unowned reference held on behalf of the strong references is released, and the
/// storage goes away together with the last unowned reference.
///
/// # Safety
///
/// The object must be deiniting, and its deinitializer must have completed.
pub unsafe fn dealloc_object(object: NonNull<HeapObject>) {
    debug_assert!(
        object.as_ref().refcounts().is_deiniting(),
        "deallocated an object which was never deinitialized"
    );

    finish_dealloc(object, config().clobber_freed_objects)
}

/// Releases an object whose payload was never initialized, e.g. because its
/// initializer failed part way through.
///
/// The object moves straight to deiniting and its deinitializer is skipped; the storage
/// is then released as by [`dealloc_object`].
///
/// # Safety
///
/// The caller must hold the only strong reference, and no other thread may be accessing
/// the refcounts of `object` concurrently.
pub unsafe fn dealloc_uninitialized_object(object: NonNull<HeapObject>) {
    debug_assert!(
        is_uniquely_referenced(object),
        "deallocated an uninitialized object which is still shared"
    );
    set_deallocating(object);
    dealloc_object(object);
}

unsafe fn finish_dealloc(object: NonNull<HeapObject>, clobber_payload: bool) {
    let header = object.as_ref();
    let refcounts = header.refcounts();
    if clobber_payload {
        clobber(object, header.metadata());
    }

    if refcounts.can_be_freed_now() {
        free_object(object);
    } else {
        unowned_release(object);
    }
}

unsafe fn clobber(object: NonNull<HeapObject>, metadata: &'static HeapMetadata) {
    let header_size = mem::size_of::<HeapObject>();
    let payload_size = metadata.layout.size() - header_size;
    let payload = object.cast::<u8>().as_ptr().add(header_size);
    ptr::write_bytes(payload, CLOBBER_PATTERN, payload_size);
}

/// Releases the storage of an object
pub(crate) unsafe fn free_object(object: NonNull<HeapObject>) {
    let metadata = object.as_ref().metadata();
    trace!(target: "heaprc::rt", "freeing {} at {:p}", metadata.name, object);
    System.deallocate(object.cast(), metadata.layout);
}
