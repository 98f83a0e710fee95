//! Error taxonomy for the allocator.
//!
//! Transient exhaustion (every base source returned null) is never modeled
//! as an [`Error`] — it surfaces in-band as `None` from `malloc`. Everything
//! in this enum is a fatal condition: a configuration mistake or an
//! invariant violation, both of which terminate the process after logging.

use std::fmt;

/// Fatal error categories the allocator can encounter.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// `Place::Device(id)` named a device index with no configured allocator.
    #[error("no allocator configured for device {0}")]
    NoAllocatorForDevice(u32),
    /// A corrupted header, out-of-range origin index, or other state that
    /// should be unreachable if every prior operation upheld its invariants.
    #[error("allocator invariant violated: {0}")]
    InvariantViolation(String),
}

impl Error {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Error::InvariantViolation(message.into())
    }
}

/// Logs `err` at error level and panics.
///
/// This is the single place every fatal condition funnels through. Panicking
/// (rather than `std::process::abort`) keeps these paths testable with
/// `#[should_panic]` under the default unwinding panic strategy, while a
/// release build with `panic = "abort"` still gets the hard process
/// termination these conditions require.
pub fn fatal(err: impl fmt::Display) -> ! {
    log::error!("fatal allocator error: {err}");
    panic!("fatal allocator error: {err}")
}

/// Convenience for `cond || fatal(msg)` call sites.
pub(crate) fn fatal_if(cond: bool, message: impl Into<String>) {
    if cond {
        fatal(Error::invariant(message));
    }
}
