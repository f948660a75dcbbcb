use std::ptr::NonNull;
use std::thread;

use pretty_assertions::assert_eq;

use heaprc_alloc::rc::RefCountState;
use heaprc_rt::object::{self, alloc_object};
use heaprc_rt::unowned::{unowned_release_n, unowned_retain_count, unowned_retain_n};
use heaprc_rt::weak::weak_retain_count;
use heaprc_rt::{HeapMetadata, HeapObject, WeakReference};

static PLAIN: HeapMetadata = HeapMetadata::header_only("Plain");

#[derive(Copy, Clone)]
struct Shared(NonNull<HeapObject>);
unsafe impl Send for Shared {}

impl Shared {
    fn ptr(self) -> NonNull<HeapObject> {
        self.0
    }

    fn header(&self) -> &HeapObject {
        unsafe { self.0.as_ref() }
    }
}

#[test]
fn new_object_counts() {
    let object = alloc_object(&PLAIN).unwrap();
    let refcounts = unsafe { object.as_ref() }.refcounts();
    assert_eq!(
        refcounts.load().state(),
        RefCountState::Counts {
            strong_extra: 0,
            unowned: 1,
            is_deiniting: false
        }
    );
    assert_eq!(refcounts.get_count(), 1);
    assert_eq!(refcounts.get_unowned_count(), 1);
    // No weak references yet, only the one held on behalf of the unowned count
    assert_eq!(refcounts.get_weak_count(), 1);
    assert!(!refcounts.has_side_table());
    unsafe { object::release(object) };
}

#[test]
fn deinit_happens_on_the_last_of_k_plus_one_releases() {
    for k in [0u32, 1, 7, 100] {
        let object = alloc_object(&PLAIN).unwrap();
        let refcounts = unsafe { object.as_ref() }.refcounts();
        for _ in 0..k {
            refcounts.increment(1);
        }
        for _ in 0..k {
            assert!(!refcounts.decrement_should_deinit(1));
        }
        assert!(refcounts.decrement_should_deinit(1));
        assert!(refcounts.is_deiniting());
        unsafe { object::dealloc_object(object) };
    }
}

#[test]
fn last_decrement_across_threads_starts_deinit() {
    let object = Shared(alloc_object(&PLAIN).unwrap());
    // Keep the storage around for inspection after deinit
    unsafe { unowned_retain_n(object.ptr(), 1) };

    thread::spawn(move || object.header().refcounts().increment(1))
        .join()
        .unwrap();
    let b = thread::spawn(move || object.header().refcounts().decrement_should_deinit(1));
    assert!(!b.join().unwrap());
    assert_eq!(object.header().refcounts().get_count(), 1);

    let a = thread::spawn(move || object.header().refcounts().decrement_should_deinit(1));
    assert!(a.join().unwrap());
    assert!(object.header().refcounts().is_deiniting());

    let c = thread::spawn(move || object.header().refcounts().try_increment());
    assert!(!c.join().unwrap());

    unsafe {
        object::dealloc_object(object.ptr());
        assert_eq!(unowned_retain_count(object.ptr()), 1);
        unowned_release_n(object.ptr(), 1);
    }
}

#[test]
fn unowned_chain_holds_a_weak_reference_until_storage_is_freed() {
    let object = alloc_object(&PLAIN).unwrap();
    let weak = unsafe { WeakReference::new(Some(object)) };
    let side = weak.side_table().unwrap();
    let refcounts = unsafe { object.as_ref() }.refcounts();
    assert!(refcounts.has_side_table());
    assert_eq!(refcounts.side_table(), Some(side));
    unsafe {
        assert_eq!(weak_retain_count(object), 2);
        unowned_retain_n(object, 1);
        object::release(object);
        // Deinitialized, but an unowned reference still holds the storage
        assert_eq!(weak_retain_count(object), 2);
        assert!(weak.load_strong().is_none());
        unowned_release_n(object, 1);
        assert_eq!(side.as_ref().weak_count(), 1);
        assert_eq!(side.as_ref().unowned_count(), 0);
    }
    drop(weak);
}

#[test]
fn strong_overflow_promotes_to_a_side_table() {
    let object = alloc_object(&PLAIN).unwrap();
    let refcounts = unsafe { object.as_ref() }.refcounts();
    let many = 1u32 << 30;
    unsafe {
        object::retain_n(object, many);
    }
    assert!(refcounts.has_side_table());
    assert_eq!(refcounts.get_count(), many + 1);
    assert_eq!(refcounts.get_unowned_count(), 1);
    // The object holds the only weak reference to its own side table
    assert_eq!(refcounts.get_weak_count(), 1);

    unsafe {
        object::release_n(object, many);
    }
    assert_eq!(refcounts.get_count(), 1);
    assert!(refcounts.is_uniquely_referenced());
    unsafe { object::release(object) };
}

#[test]
fn unowned_overflow_promotes_to_a_side_table() {
    let object = alloc_object(&PLAIN).unwrap();
    let refcounts = unsafe { object.as_ref() }.refcounts();
    let many = 1u32 << 30;
    unsafe {
        unowned_retain_n(object, many);
        assert!(refcounts.has_side_table());
        assert_eq!(unowned_retain_count(object), many + 1);
        assert_eq!(refcounts.get_count(), 1);
        unowned_release_n(object, many);
        assert_eq!(unowned_retain_count(object), 1);
        object::release(object);
    }
}

#[test]
fn immortal_objects_ignore_every_operation() {
    let object = alloc_object(&PLAIN).unwrap();
    let refcounts = unsafe { object.as_ref() }.refcounts();
    unsafe { object::set_immortal(object) };
    assert!(refcounts.is_immortal());
    assert_eq!(refcounts.load().state(), RefCountState::Immortal);

    let before = refcounts.load();
    refcounts.increment(5);
    assert!(!refcounts.decrement_should_deinit(1));
    assert!(!refcounts.decrement_should_deinit(1_000));
    refcounts.increment_unowned(3);
    assert!(!refcounts.decrement_unowned_should_free(1));
    assert!(refcounts.try_increment());
    assert_eq!(refcounts.load(), before);
    assert!(!refcounts.is_deiniting());

    let weak = unsafe { WeakReference::new(Some(object)) };
    assert!(refcounts.has_side_table());
    assert!(refcounts.is_immortal());
    assert_eq!(weak.load_strong(), Some(object));
    assert!(!refcounts.decrement_should_deinit(1));
    assert_eq!(weak.load_strong(), Some(object));
}
