// Mutex is only used on cold paths (e.g. the side table free list), never while a
// refcount word is being updated.
pub use parking_lot::{const_mutex, Mutex, MutexGuard};

// Once is used for one-time initialization, e.g. of statically allocated objects
pub use parking_lot::{Once, OnceState};

// Atomic<T> lets us store packed bitfield types directly in an atomic cell, see the
// refcount words in heaprc_alloc.
pub use atomig::impls::PrimitiveAtom;
pub use atomig::{Atom, Atomic};

pub use core::sync::atomic::{fence, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
