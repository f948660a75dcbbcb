//! Process-wide runtime configuration, read once from environment variables.
use core::str::FromStr;
use std::env;

use lazy_static::lazy_static;
use log::{debug, warn};

/// Overwrite the payload of freed objects with [`CLOBBER_PATTERN`] before releasing them
pub const HEAPRC_CLOBBER_FREED_OBJECTS: &str = "HEAPRC_CLOBBER_FREED_OBJECTS";
/// Abort the process on fatal refcount errors rather than panicking
pub const HEAPRC_ABORT_ON_FATAL: &str = "HEAPRC_ABORT_ON_FATAL";
/// Maximum number of freed side table entries retained for reuse
pub const HEAPRC_SIDE_TABLE_CACHE: &str = "HEAPRC_SIDE_TABLE_CACHE";

/// The byte written over freed objects when clobbering is enabled
pub const CLOBBER_PATTERN: u8 = 0xF0;

lazy_static! {
    static ref CONFIG: RuntimeConfig = {
        let config = RuntimeConfig::from_env();
        debug!(target: "heaprc::env", "loaded runtime configuration: {:?}", &config);
        config
    };
}

/// Returns the configuration of the current process.
///
/// The environment is only consulted the first time this is called.
#[inline]
pub fn config() -> &'static RuntimeConfig {
    &CONFIG
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub clobber_freed_objects: bool,
    pub abort_on_fatal: bool,
    pub side_table_cache: usize,
}
impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            clobber_freed_objects: false,
            abort_on_fatal: false,
            side_table_cache: 64,
        }
    }
}
impl RuntimeConfig {
    /// Reads the configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration using `lookup` to resolve variable names.
    ///
    /// Unset variables keep their default value, as do variables whose value
    /// cannot be parsed, in which case a warning is logged.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            clobber_freed_objects: read_var(
                &lookup,
                HEAPRC_CLOBBER_FREED_OBJECTS,
                defaults.clobber_freed_objects,
                parse_bool,
            ),
            abort_on_fatal: read_var(
                &lookup,
                HEAPRC_ABORT_ON_FATAL,
                defaults.abort_on_fatal,
                parse_bool,
            ),
            side_table_cache: read_var(
                &lookup,
                HEAPRC_SIDE_TABLE_CACHE,
                defaults.side_table_cache,
                parse_number,
            ),
        }
    }
}

fn read_var<F, T, P>(lookup: &F, name: &str, default: T, parse: P) -> T
where
    F: Fn(&str) -> Option<String>,
    T: core::fmt::Debug,
    P: FnOnce(&str) -> Option<T>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match parse(raw.trim()) {
        Some(value) => value,
        None => {
            warn!(
                target: "heaprc::env",
                "{}={} is not a valid value, using the default of {:?}",
                name,
                raw,
                &default
            );
            default
        }
    }
}

/// Parses a boolean flag.
///
/// Only the first character is significant: one of `1yYtT` means true, one of
/// `0nNfF` means false. Anything else is rejected.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.as_bytes().first()? {
        b'1' | b'y' | b'Y' | b't' | b'T' => Some(true),
        b'0' | b'n' | b'N' | b'f' | b'F' => Some(false),
        _ => None,
    }
}

pub fn parse_number<T: FromStr>(value: &str) -> Option<T> {
    value.parse().ok()
}
