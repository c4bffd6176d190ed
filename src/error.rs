use thiserror::Error;

use crate::daemon::{OpError, StateError, WireError};

/// Whether retrying this operation may succeed.
///
/// Maps onto the wire protocol's `temporary` flag: a retryable error is
/// reported as temporary so clients know a later attempt can win.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (contention on a host or class).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors; each keeps its own
/// classification.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Op(#[from] OpError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Op(e) => e.transience(),
            Error::Wire(_) | Error::State(_) => Transience::Permanent,
            Error::Io(_) => Transience::Retryable,
        }
    }
}
