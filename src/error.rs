use std::io;

/// Errors surfaced by the reactor, the buffer chain, and the buffered
/// stream layer.
///
/// System call failures are preserved via `#[from] io::Error`; everything
/// else corresponds to one of the taxonomy entries in the design notes
/// (programmer error, resource exhaustion, protocol-level failure).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("operation would block")]
    WouldBlock,

    #[error("event is already pending on a base")]
    AlreadyPending,

    #[error("event does not belong to this base")]
    WrongBase,

    #[error("event was never assigned before use")]
    Unassigned,

    #[error("event is finalizing; no further add/activate is permitted")]
    Finalizing,

    #[error("mismatched reserve/commit: requested {requested} bytes, committed {committed}")]
    MismatchedCommit { requested: usize, committed: usize },

    #[error("unknown signal number {0}")]
    UnknownSignal(i32),

    #[error("buffer is frozen and rejects this mutation")]
    Frozen,

    #[error("requested priority {requested} exceeds configured count {count}")]
    BadPriority { requested: usize, count: usize },

    #[error("priority count cannot change after an event has been created on this base")]
    PriorityAlreadyInUse,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
