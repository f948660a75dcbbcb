use core::ptr::NonNull;

use thiserror::Error;

use heaprc_alloc::rc::HeapObject;

/// Describes how an object outlived the point where it was expected to die
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum LifetimeError {
    #[error("object {address:#x} escaped: {count} strong references remain")]
    Escaped { address: usize, count: u32 },
    #[error("object {address:#x} has {count} unowned references, expected 1")]
    UnownedReferences { address: usize, count: u32 },
    #[error("object {address:#x} has {count} weak references, expected at most 1")]
    WeakReferences { address: usize, count: u32 },
}

/// Verifies that an object whose storage is owned by the caller (see
/// [`crate::object::init_stack_object`]) can safely go away.
///
/// The object must have been released, and no unowned or weak references to it may
/// remain other than those held implicitly.
///
/// # Safety
///
/// `object` must point to an initialized object header.
pub unsafe fn verify_end_of_lifetime(object: NonNull<HeapObject>) -> Result<(), LifetimeError> {
    let refcounts = object.as_ref().refcounts();
    let address = object.as_ptr() as usize;
    if !refcounts.is_deiniting() {
        return Err(LifetimeError::Escaped {
            address,
            count: refcounts.get_count(),
        });
    }
    let count = refcounts.get_unowned_count();
    if count != 1 {
        return Err(LifetimeError::UnownedReferences { address, count });
    }
    let count = refcounts.get_weak_count();
    if count > 1 {
        return Err(LifetimeError::WeakReferences { address, count });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use core::mem::MaybeUninit;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::object::{init_stack_object, release, retain};
    use crate::unowned::{unowned_release, unowned_retain};
    use crate::weak::WeakReference;
    use heaprc_alloc::rc::HeapMetadata;

    static PLAIN: HeapMetadata = HeapMetadata::header_only("Plain");

    #[test]
    fn stack_object_lifetime_is_verified() {
        let mut storage = MaybeUninit::<HeapObject>::uninit();
        let object = NonNull::new(storage.as_mut_ptr()).unwrap();
        let address = object.as_ptr() as usize;
        unsafe {
            init_stack_object(object, &PLAIN);
            retain(object);
            release(object);
            assert_eq!(
                verify_end_of_lifetime(object),
                Err(LifetimeError::Escaped { address, count: 1 })
            );

            unowned_retain(object);
            release(object);
            assert_eq!(
                verify_end_of_lifetime(object),
                Err(LifetimeError::UnownedReferences { address, count: 2 })
            );
            unowned_release(object);
            assert_eq!(verify_end_of_lifetime(object), Ok(()));
        }
    }

    #[test]
    fn outstanding_weak_references_are_reported() {
        let mut storage = MaybeUninit::<HeapObject>::uninit();
        let object = NonNull::new(storage.as_mut_ptr()).unwrap();
        let address = object.as_ptr() as usize;
        unsafe {
            init_stack_object(object, &PLAIN);
            let weak = WeakReference::new(Some(object));
            release(object);
            assert_eq!(
                verify_end_of_lifetime(object),
                Err(LifetimeError::WeakReferences { address, count: 2 })
            );
            drop(weak);
            assert_eq!(verify_end_of_lifetime(object), Ok(()));
        }
    }
}
