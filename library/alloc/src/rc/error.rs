use log::error;
use thiserror::Error;

use heaprc_system::env::config;

/// Conditions under which a refcount operation cannot continue.
///
/// None of these are recoverable: the count in question has either run out of bits
/// or an object has been used after it was destroyed. See [`fatal`].
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefCountError {
    #[error("object was retained too many times")]
    RetainOverflow,
    #[error("object's unowned reference was retained too many times")]
    UnownedRetainOverflow,
    #[error("object's weak reference was retained too many times")]
    WeakRetainOverflow,
    #[error("attempted to read an unowned reference but object {address:#x} was already deallocated")]
    RetainUnowned { address: usize },
}

/// Reports a fatal refcounting error and terminates.
///
/// The process is aborted outright when `HEAPRC_ABORT_ON_FATAL` is set, otherwise this
/// panics, which is equivalent in builds using `panic = "abort"`.
#[cold]
#[inline(never)]
pub fn fatal(err: RefCountError) -> ! {
    error!(target: "heaprc::rc", "fatal error: {}", err);
    if config().abort_on_fatal {
        std::process::abort();
    }
    panic!("fatal error: {}", err)
}
