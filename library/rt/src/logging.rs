use std::env;

use env_logger::Builder;

/// The environment variable holding the log filter, e.g. `HEAPRC_LOG=heaprc::rc=trace`
pub const HEAPRC_LOG: &str = "HEAPRC_LOG";
/// Selects the timestamp precision of log records, one of `s`, `ms`, `us` or `ns`
pub const HEAPRC_LOG_WITH_TIME: &str = "HEAPRC_LOG_WITH_TIME";

/// Installs a logger configured from the `HEAPRC_LOG` environment variable.
///
/// This is a no-op if a logger has already been installed, so it is safe to call from
/// every test.
pub fn init() {
    let mut builder = Builder::from_env(HEAPRC_LOG);
    builder.format_indent(Some(2));
    if let Ok(precision) = env::var(HEAPRC_LOG_WITH_TIME) {
        match precision.as_str() {
            "s" => builder.format_timestamp_secs(),
            "ms" => builder.format_timestamp_millis(),
            "us" => builder.format_timestamp_micros(),
            "ns" => builder.format_timestamp_nanos(),
            other => {
                eprintln!("Ignoring invalid {} value, expected one of [s, ms, us, ns], got '{}'. Using 'us' instead..", HEAPRC_LOG_WITH_TIME, other);
                builder.format_timestamp_micros()
            }
        };
    } else {
        builder.format_timestamp(None);
    }
    builder.is_test(cfg!(test));
    let _ = builder.try_init();
}
