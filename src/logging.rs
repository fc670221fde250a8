//! Thin wrapper over the `log` facade that reproduces the original's
//! `lllog(N)` level-gated tracer, where `N` is a 0-9 verbosity carried in
//! `LLL_LOGLEVEL`.
//!
//! The rest of the crate uses plain `log::{debug, info, warn, error}!`
//! macros for ordinary structured logging (matching how `rustdds` logs, e.g.
//! in `dds/no_key/simpledatareader.rs`); this module exists only for the
//! handful of call sites that want the original's numeric low-level
//! verbosity knob instead of the five standard levels.

use std::sync::atomic::{AtomicU8, Ordering};

static LOW_LEVEL_VERBOSITY: AtomicU8 = AtomicU8::new(0);

/// Installs the low-level log verbosity read from [`crate::config::Config`].
/// Call once at startup before any `lllog!` use.
pub fn init(verbosity: u8) {
    LOW_LEVEL_VERBOSITY.store(verbosity.min(9), Ordering::Relaxed);
}

/// Returns `true` if a low-level trace at the given verbosity would be
/// emitted, i.e. `verbosity <= LLL_LOGLEVEL`.
pub fn enabled(verbosity: u8) -> bool {
    verbosity <= LOW_LEVEL_VERBOSITY.load(Ordering::Relaxed)
}

/// Emits a trace-level log record iff `$level <= LLL_LOGLEVEL`.
///
/// ```ignore
/// lllog!(8, "publishing state statistics to other nodes");
/// ```
#[macro_export]
macro_rules! lllog {
    ($level:expr, $($arg:tt)+) => {
        if $crate::logging::enabled($level) {
            log::trace!($($arg)+);
        }
    };
}
