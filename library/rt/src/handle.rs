//! Owned handles over the raw reference API.
//!
//! These mirror `std::sync::{Arc, Weak}`, with the addition of [`Unowned`]. Each handle
//! owns exactly one reference of its kind, acquired on `clone` and released on `drop`.
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::Deref;
use core::ptr::NonNull;

use heaprc_alloc::allocators::AllocError;
use heaprc_alloc::rc::HeapObject;

use crate::object::{self, ClassMetadata, ManagedBox};
use crate::unowned;
use crate::weak::WeakReference;

/// A strong reference to a managed `T`
pub struct Strong<T> {
    ptr: NonNull<ManagedBox<T>>,
    _marker: PhantomData<ManagedBox<T>>,
}

unsafe impl<T: Send + Sync> Send for Strong<T> {}
unsafe impl<T: Send + Sync> Sync for Strong<T> {}

impl<T> Strong<T> {
    /// Allocates a new object of class `class` holding `value`
    pub fn new(value: T, class: &'static ClassMetadata<T>) -> Self {
        match Self::try_new(value, class) {
            Ok(this) => this,
            Err(_) => std::alloc::handle_alloc_error(class.metadata().layout),
        }
    }

    pub fn try_new(value: T, class: &'static ClassMetadata<T>) -> Result<Self, AllocError> {
        let ptr = object::alloc_object(class.metadata())?.cast::<ManagedBox<T>>();
        unsafe {
            ManagedBox::value_ptr(ptr).write(value);
        }
        Ok(Self {
            ptr,
            _marker: PhantomData,
        })
    }

    /// Takes ownership of a strong reference to an object of class `ClassMetadata<T>`
    ///
    /// # Safety
    ///
    /// `object` must hold a `T`, and the caller must own the strong reference being
    /// transferred.
    pub unsafe fn from_raw(object: NonNull<HeapObject>) -> Self {
        Self {
            ptr: object.cast(),
            _marker: PhantomData,
        }
    }

    /// Releases ownership of the strong reference held by `this`, without releasing it
    pub fn into_raw(this: Self) -> NonNull<HeapObject> {
        let object = Self::as_object(&this);
        mem::forget(this);
        object
    }

    #[inline]
    pub fn as_object(this: &Self) -> NonNull<HeapObject> {
        this.ptr.cast()
    }

    pub fn downgrade(this: &Self) -> Weak<T> {
        Weak {
            reference: unsafe { WeakReference::new(Some(Self::as_object(this))) },
            _marker: PhantomData,
        }
    }

    pub fn unowned(this: &Self) -> Unowned<T> {
        unsafe {
            unowned::unowned_retain(Self::as_object(this));
        }
        Unowned {
            ptr: this.ptr,
            _marker: PhantomData,
        }
    }

    pub fn strong_count(this: &Self) -> u32 {
        unsafe { object::retain_count(Self::as_object(this)) }
    }

    pub fn is_unique(this: &Self) -> bool {
        unsafe { object::is_uniquely_referenced(Self::as_object(this)) }
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }
}
impl<T> Clone for Strong<T> {
    fn clone(&self) -> Self {
        unsafe {
            object::retain(Self::as_object(self));
        }
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}
impl<T> Drop for Strong<T> {
    fn drop(&mut self) {
        unsafe {
            object::release(Self::as_object(self));
        }
    }
}
impl<T> Deref for Strong<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }.value()
    }
}
impl<T: fmt::Debug> fmt::Debug for Strong<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// An unowned reference to a managed `T`.
///
/// Loading through it after every strong reference is gone is a fatal error.
pub struct Unowned<T> {
    ptr: NonNull<ManagedBox<T>>,
    _marker: PhantomData<ManagedBox<T>>,
}

unsafe impl<T: Send + Sync> Send for Unowned<T> {}
unsafe impl<T: Send + Sync> Sync for Unowned<T> {}

impl<T> Unowned<T> {
    /// Returns a new strong reference to the object
    pub fn load(&self) -> Strong<T> {
        unsafe {
            let object = unowned::unowned_retain_strong(self.ptr.cast());
            Strong::from_raw(object)
        }
    }

    /// Consumes the unowned reference, returning a strong reference in its place
    pub fn into_strong(self) -> Strong<T> {
        let object = self.ptr.cast();
        mem::forget(self);
        unsafe { Strong::from_raw(unowned::unowned_retain_strong_and_release(object)) }
    }

    /// Panics if the object is no longer alive
    pub fn check(&self) {
        unsafe { unowned::unowned_check(self.ptr.cast()) }
    }

    pub fn unowned_count(&self) -> u32 {
        unsafe { unowned::unowned_retain_count(self.ptr.cast()) }
    }
}
impl<T> Clone for Unowned<T> {
    fn clone(&self) -> Self {
        unsafe {
            unowned::unowned_retain(self.ptr.cast());
        }
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}
impl<T> Drop for Unowned<T> {
    fn drop(&mut self) {
        unsafe {
            unowned::unowned_release(self.ptr.cast());
        }
    }
}
impl<T> fmt::Debug for Unowned<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Unowned({:p})", self.ptr)
    }
}

/// A weak reference to a managed `T`
pub struct Weak<T> {
    reference: WeakReference,
    _marker: PhantomData<Strong<T>>,
}

impl<T> Weak<T> {
    /// Returns a strong reference to the object, if it is still alive
    pub fn upgrade(&self) -> Option<Strong<T>> {
        self.reference
            .load_strong()
            .map(|object| unsafe { Strong::from_raw(object) })
    }

    pub fn weak_count(&self) -> u32 {
        match self.reference.side_table() {
            Some(side) => unsafe { side.as_ref() }.weak_count(),
            None => 0,
        }
    }
}
impl<T> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Self {
            reference: self.reference.clone(),
            _marker: PhantomData,
        }
    }
}
impl<T> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Weak").field(&self.reference).finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct Flag(&'static AtomicBool);
    impl Drop for Flag {
        fn drop(&mut self) {
            assert!(!self.0.swap(true, Ordering::SeqCst), "deinitialized twice");
        }
    }

    static FLAG: ClassMetadata<Flag> = ClassMetadata::new("Flag");
    static NUMBER: ClassMetadata<u64> = ClassMetadata::new("Number");

    #[test]
    fn strong_handles_share_the_object() {
        let a = Strong::new(42u64, &NUMBER);
        assert!(Strong::is_unique(&a));
        let b = a.clone();
        assert!(Strong::ptr_eq(&a, &b));
        assert_eq!(Strong::strong_count(&a), 2);
        assert!(!Strong::is_unique(&a));
        assert_eq!(*b, 42);
        drop(b);
        assert_eq!(Strong::strong_count(&a), 1);

        let raw = Strong::into_raw(a);
        let a = unsafe { Strong::<u64>::from_raw(raw) };
        assert_eq!(*a, 42);
    }

    #[test]
    fn weak_handle_upgrades_until_last_strong_is_dropped() {
        static DROPPED: AtomicBool = AtomicBool::new(false);
        let strong = Strong::new(Flag(&DROPPED), &FLAG);
        let weak = Strong::downgrade(&strong);
        assert_eq!(weak.weak_count(), 2);

        let upgraded = weak.upgrade().unwrap();
        drop(strong);
        assert!(!DROPPED.load(Ordering::SeqCst));
        drop(upgraded);
        assert!(DROPPED.load(Ordering::SeqCst));

        assert!(weak.upgrade().is_none());
        assert_eq!(weak.weak_count(), 1);
        let copy = weak.clone();
        assert_eq!(copy.weak_count(), 0);
    }

    #[test]
    fn unowned_handle_keeps_storage_alive() {
        static DROPPED: AtomicBool = AtomicBool::new(false);
        let strong = Strong::new(Flag(&DROPPED), &FLAG);
        let unowned = Strong::unowned(&strong);
        let second = unowned.clone();
        assert_eq!(unowned.unowned_count(), 3);

        let loaded = second.into_strong();
        assert_eq!(Strong::strong_count(&loaded), 2);
        assert_eq!(unowned.unowned_count(), 2);
        drop(loaded);
        drop(strong);
        assert!(DROPPED.load(Ordering::SeqCst));
        assert_eq!(unowned.unowned_count(), 1);
    }

    #[test]
    #[should_panic(expected = "attempted to read an unowned reference")]
    fn unowned_handle_traps_after_deinit() {
        let strong = Strong::new(7u64, &NUMBER);
        let unowned = Strong::unowned(&strong);
        drop(strong);
        unowned.check();
    }
}
