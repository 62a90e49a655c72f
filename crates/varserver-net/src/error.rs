use std::io;

use thiserror::Error;

/// Transport-level failure surfaced to a caller of [`crate::ClientConnection`].
///
/// A `NetError` never crosses a thread boundary on its own; callers in
/// `varserver-core` fold it into their own `ConnectionError` at the point
/// where a worker decides to tear the session down.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("connection closed by peer")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
