//! Weak references.
//!
//! A weak reference refers to the side table entry of its object rather than the
//! object itself, so it keeps nothing but the entry alive. Once the object begins
//! deinitialization, loading through the reference yields nothing.
use core::fmt;
use core::ptr::NonNull;

use heaprc_alloc::rc::{HeapObject, SideTableEntry};

/// A weak reference to a managed object, or to nothing.
pub struct WeakReference {
    side: Option<NonNull<SideTableEntry>>,
}

// Every operation on the entry goes through its atomic refcounts
unsafe impl Send for WeakReference {}
unsafe impl Sync for WeakReference {}

impl WeakReference {
    /// A reference to nothing
    pub const fn empty() -> Self {
        Self { side: None }
    }

    /// Forms a weak reference to `object`.
    ///
    /// The result refers to nothing if `object` is `None`, or has already begun
    /// deinitialization.
    ///
    /// # Safety
    ///
    /// The caller must hold a strong or unowned reference to `object`.
    pub unsafe fn new(object: Option<NonNull<HeapObject>>) -> Self {
        Self {
            side: object.and_then(|object| object.as_ref().refcounts().form_weak_reference()),
        }
    }

    /// Makes this reference refer to `object` instead, releasing the previous referent.
    ///
    /// # Safety
    ///
    /// See [`WeakReference::new`].
    pub unsafe fn assign(&mut self, object: Option<NonNull<HeapObject>>) {
        *self = Self::new(object);
    }

    /// Returns the object with a new strong reference, or `None` if the object is
    /// gone or being torn down.
    pub fn load_strong(&self) -> Option<NonNull<HeapObject>> {
        let side = self.side?;
        unsafe { side.as_ref() }.try_retain()
    }

    /// Like [`WeakReference::load_strong`], but also destroys this reference
    pub fn take_strong(self) -> Option<NonNull<HeapObject>> {
        self.load_strong()
    }

    /// True if this reference was formed to an object.
    ///
    /// This says nothing about whether the object is still alive.
    pub fn is_empty(&self) -> bool {
        self.side.is_none()
    }

    /// The side table entry this reference holds
    pub fn side_table(&self) -> Option<NonNull<SideTableEntry>> {
        self.side
    }
}
impl Default for WeakReference {
    fn default() -> Self {
        Self::empty()
    }
}
impl Clone for WeakReference {
    /// Copies the reference; the copy refers to nothing if the object is deiniting
    fn clone(&self) -> Self {
        Self {
            side: self
                .side
                .and_then(|side| unsafe { side.as_ref() }.increment_weak()),
        }
    }
}
impl Drop for WeakReference {
    fn drop(&mut self) {
        if let Some(side) = self.side.take() {
            unsafe {
                SideTableEntry::decrement_weak(side);
            }
        }
    }
}
impl fmt::Debug for WeakReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.side {
            None => f.write_str("WeakReference(empty)"),
            Some(side) => write!(f, "WeakReference({:p})", side),
        }
    }
}

/// The weak count of `object`, including the implicit weak reference held on behalf of
/// its unowned references
pub unsafe fn weak_retain_count(object: NonNull<HeapObject>) -> u32 {
    object.as_ref().refcounts().get_weak_count()
}
