//! Runtime error types.

use std::fmt;

/// A recoverable runtime error raised by the core.
///
/// Barriers, sweeps, and rehashes never fail on their own; the only error
/// sources are bad keys, a hash part growing past its limit, and host
/// finalizers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeError {
    /// nil used as a table key.
    NilIndex,
    /// NaN used as a table key.
    NanIndex,
    /// Hash part would exceed 2^MAXBITS slots.
    TableOverflow,
    /// Key passed to `next` is not present in the table.
    InvalidNext,
    /// General runtime error with message (host finalizers).
    Runtime(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NilIndex => write!(f, "table index is nil"),
            RuntimeError::NanIndex => write!(f, "table index is NaN"),
            RuntimeError::TableOverflow => write!(f, "table overflow"),
            RuntimeError::InvalidNext => write!(f, "invalid key to 'next'"),
            RuntimeError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}
