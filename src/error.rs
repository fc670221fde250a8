//! Crate-wide error taxonomy.
//!
//! The original Safir SDK Core distinguishes three kinds of failure: a
//! programmer error (slot discipline violation, unexpected timer status),
//! a peer/environment error that is recovered locally (substrate overflow,
//! missed election announcements), and an admission rejection that is
//! handed back to a caller through the response slot. This module keeps
//! that split explicit instead of collapsing everything into one enum of
//! "stuff that went wrong".

use std::fmt;

use crate::arbiter::ConnectResult;

/// Errors that can cross a component boundary in this crate.
#[derive(Debug, thiserror::Error)]
pub enum DobError {
    /// The communication substrate cannot currently accept more data.
    /// Recoverable: callers are expected to queue and retry.
    #[error("communication substrate reported overflow")]
    SubstrateOverflow,

    /// The communication substrate is gone (e.g. the underlying socket was
    /// closed). This is the only unrecoverable runtime condition defined by
    /// the specification and triggers a clean shutdown with exit code 3.
    #[error("communication substrate lost")]
    SubstrateLost,

    /// A connect/disconnect attempt was rejected by admission policy.
    /// Never logged above `Debug`.
    #[error("admission rejected: {0:?}")]
    AdmissionRejected(ConnectResult),

    /// I/O failure from an underlying OS primitive (socket, file lock).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raises a programmer error: logs at the crate's "alert" target and aborts
/// the process. There is no recovery path for these by design -- a slot
/// discipline violation or an unexpected timer status means some component
/// has broken an invariant the rest of the crate relies on.
///
/// `log` has no `Alert` level, so severity is carried as a `target`
/// (`"alert"`) on an `error!` record, the same trick the original's
/// `SEND_SYSTEM_LOG(Alert, ...)` macro played at the C++ logging layer.
#[track_caller]
pub fn fatal(message: impl fmt::Display) -> ! {
    log::error!(target: "alert", "{message}");
    std::process::abort();
}
