//! Unowned references.
//!
//! An unowned reference keeps the storage of an object alive, but not the object
//! itself. Loading a strong reference through one after the object has begun
//! deinitialization is a fatal error.
use core::ptr::NonNull;

use heaprc_alloc::rc::{fatal, HeapObject, RefCountError};

use crate::object::free_object;

#[inline]
pub unsafe fn unowned_retain(object: NonNull<HeapObject>) -> NonNull<HeapObject> {
    object.as_ref().refcounts().increment_unowned(1);
    object
}

#[inline]
pub unsafe fn unowned_retain_n(object: NonNull<HeapObject>, n: u32) -> NonNull<HeapObject> {
    object.as_ref().refcounts().increment_unowned(n);
    object
}

/// # Safety
///
/// No other thread may be accessing the refcounts of `object` concurrently.
#[inline]
pub unsafe fn unowned_retain_non_atomic(object: NonNull<HeapObject>) -> NonNull<HeapObject> {
    object.as_ref().refcounts().increment_unowned_non_atomic(1);
    object
}

/// # Safety
///
/// No other thread may be accessing the refcounts of `object` concurrently.
#[inline]
pub unsafe fn unowned_retain_n_non_atomic(
    object: NonNull<HeapObject>,
    n: u32,
) -> NonNull<HeapObject> {
    object.as_ref().refcounts().increment_unowned_non_atomic(n);
    object
}

/// Releases an unowned reference, freeing the storage of `object` if it was the last one
#[inline]
pub unsafe fn unowned_release(object: NonNull<HeapObject>) {
    unowned_release_n(object, 1)
}

#[inline]
pub unsafe fn unowned_release_n(object: NonNull<HeapObject>, n: u32) {
    if object
        .as_ref()
        .refcounts()
        .decrement_unowned_should_free(n)
    {
        free_object(object);
    }
}

/// # Safety
///
/// No other thread may be accessing the refcounts of `object` concurrently.
#[inline]
pub unsafe fn unowned_release_non_atomic(object: NonNull<HeapObject>) {
    unowned_release_n_non_atomic(object, 1)
}

/// # Safety
///
/// No other thread may be accessing the refcounts of `object` concurrently.
#[inline]
pub unsafe fn unowned_release_n_non_atomic(object: NonNull<HeapObject>, n: u32) {
    if object
        .as_ref()
        .refcounts()
        .decrement_unowned_should_free_non_atomic(n)
    {
        free_object(object);
    }
}

pub unsafe fn unowned_retain_count(object: NonNull<HeapObject>) -> u32 {
    object.as_ref().refcounts().get_unowned_count()
}

/// Loads a strong reference through an unowned reference held by the caller.
///
/// It is a fatal error for the object to have begun deinitialization.
pub unsafe fn unowned_retain_strong(object: NonNull<HeapObject>) -> NonNull<HeapObject> {
    if !object.as_ref().refcounts().try_increment() {
        fatal(RefCountError::RetainUnowned {
            address: object.as_ptr() as usize,
        });
    }
    object
}

/// Like [`unowned_retain_strong`], but also consumes the caller's unowned reference
pub unsafe fn unowned_retain_strong_and_release(object: NonNull<HeapObject>) -> NonNull<HeapObject> {
    unowned_retain_strong(object);
    let should_free = object
        .as_ref()
        .refcounts()
        .decrement_unowned_should_free(1);
    debug_assert!(
        !should_free,
        "released the last unowned reference of an object while holding a strong reference"
    );
    object
}

/// # Safety
///
/// No other thread may be accessing the refcounts of `object` concurrently.
pub unsafe fn unowned_retain_strong_non_atomic(object: NonNull<HeapObject>) -> NonNull<HeapObject> {
    if !object.as_ref().refcounts().try_increment_non_atomic() {
        fatal(RefCountError::RetainUnowned {
            address: object.as_ptr() as usize,
        });
    }
    object
}

/// # Safety
///
/// No other thread may be accessing the refcounts of `object` concurrently.
pub unsafe fn unowned_retain_strong_and_release_non_atomic(
    object: NonNull<HeapObject>,
) -> NonNull<HeapObject> {
    unowned_retain_strong_non_atomic(object);
    let should_free = object
        .as_ref()
        .refcounts()
        .decrement_unowned_should_free_non_atomic(1);
    debug_assert!(
        !should_free,
        "released the last unowned reference of an object while holding a strong reference"
    );
    object
}

/// Checks that an object referred to by an unowned reference is still alive
pub unsafe fn unowned_check(object: NonNull<HeapObject>) {
    if object.as_ref().refcounts().is_deiniting() {
        fatal(RefCountError::RetainUnowned {
            address: object.as_ptr() as usize,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::object::{alloc_object, release, retain_count};
    use heaprc_alloc::rc::HeapMetadata;

    static PLAIN: HeapMetadata = HeapMetadata::header_only("Plain");

    #[test]
    fn unowned_references_outlive_deinit() {
        let object = alloc_object(&PLAIN).unwrap();
        unsafe {
            unowned_retain(object);
            unowned_retain_n(object, 2);
            assert_eq!(unowned_retain_count(object), 4);

            let strong = unowned_retain_strong_and_release(object);
            assert_eq!(retain_count(strong), 2);
            assert_eq!(unowned_retain_count(object), 3);
            release(strong);
            unowned_check(object);

            release(object);
            // The strong references' implicit unowned reference is gone
            assert_eq!(unowned_retain_count(object), 2);
            unowned_release_n(object, 2);
        }
    }

    #[test]
    fn non_atomic_unowned_references() {
        let object = alloc_object(&PLAIN).unwrap();
        unsafe {
            unowned_retain_non_atomic(object);
            unowned_retain_n_non_atomic(object, 3);
            unowned_release_n_non_atomic(object, 3);
            assert_eq!(unowned_retain_count(object), 2);
            release(object);
            unowned_release_non_atomic(object);
        }
    }

    #[test]
    #[should_panic(expected = "attempted to read an unowned reference")]
    fn loading_unowned_reference_to_deiniting_object_is_fatal() {
        let object = alloc_object(&PLAIN).unwrap();
        unsafe {
            unowned_retain(object);
            release(object);
            unowned_retain_strong(object);
        }
    }

    #[test]
    #[should_panic(expected = "attempted to read an unowned reference")]
    fn unowned_check_of_deiniting_object_is_fatal() {
        let object = alloc_object(&PLAIN).unwrap();
        unsafe {
            unowned_retain(object);
            release(object);
            unowned_check(object);
        }
    }

    #[test]
    fn non_atomic_strong_loads_through_unowned_references() {
        let object = alloc_object(&PLAIN).unwrap();
        unsafe {
            unowned_retain_n_non_atomic(object, 2);
            let strong = unowned_retain_strong_non_atomic(object);
            assert_eq!(retain_count(strong), 2);
            assert_eq!(unowned_retain_count(object), 3);

            let strong = unowned_retain_strong_and_release_non_atomic(object);
            assert_eq!(retain_count(strong), 3);
            assert_eq!(unowned_retain_count(object), 2);

            release(strong);
            release(strong);
            release(object);
            assert_eq!(unowned_retain_count(object), 1);
            unowned_release_non_atomic(object);
        }
    }

    #[test]
    #[should_panic(expected = "attempted to read an unowned reference")]
    fn non_atomic_load_of_deiniting_object_is_fatal() {
        let object = alloc_object(&PLAIN).unwrap();
        unsafe {
            unowned_retain(object);
            release(object);
            unowned_retain_strong_non_atomic(object);
        }
    }
}
