use std::fmt;

use crate::types::Vpid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Resource exhaustion: a cache or array could not grow. The failed
    /// allocation is aborted and caches keep their prior valid state.
    Exhausted(&'static str),
    /// A page could not be fixed (bad address, deallocated page).
    Page { vpid: Vpid, why: &'static str },
    /// A latch wait timed out or was interrupted.
    LatchTimeout { vpid: Vpid },
    /// Consistency violation: page-chain cycle, mismatched cache index
    /// cardinalities, out-of-range representation id. A bug; asserted in
    /// debug builds, best-effort error return in release.
    Corrupted(String),
    InvalidOperation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Exhausted(what) => write!(f, "Resource exhausted: {}", what),
            Error::Page { vpid, why } => write!(f, "Page {} error: {}", vpid, why),
            Error::LatchTimeout { vpid } => write!(f, "Latch timeout on page {}", vpid),
            Error::Corrupted(msg) => write!(f, "Consistency violation: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// Raise a consistency violation: panics in debug builds, returns a
/// best-effort error in release.
macro_rules! corrupted {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        debug_assert!(false, "{}", msg);
        return Err($crate::error::Error::Corrupted(msg));
    }};
}
pub(crate) use corrupted;

/// Domain outcomes of read/scan operations. These are distinct result
/// codes, not errors: an absent object or a version hidden by the caller's
/// snapshot is a normal answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCode {
    /// Object found, record produced.
    Found,
    /// Object does not exist (never did, or slot was reclaimed).
    DoesNotExist,
    /// Object exists but no version is visible under the given snapshot.
    Invisible,
    /// Object exists and is unchanged relative to the caller's cache
    /// coherency number; no record bytes were produced.
    Unchanged,
    /// Scan exhausted.
    End,
    /// The record does not fit in the caller-provided area.
    DoesntFit,
}

impl ScanCode {
    pub fn is_found(&self) -> bool {
        matches!(self, ScanCode::Found)
    }
}
