//! Error types for the pipeline runtime.

use std::fmt;

use thiserror::Error;

/// The main error type for pipeline construction and lifecycle operations.
///
/// Callbacks handle their own domain errors; this type only covers the
/// conditions the engine itself has to surface.
#[derive(Debug, Error)]
pub enum Error {
    /// A stage was registered with zero workers
    #[error("stage `{stage}` must run at least one worker")]
    InvalidWorkerCount { stage: String },

    /// The rate limiter was configured outside `1..=MAX_RATE_PER_SECOND`
    #[error("rate limit must allow between 1 and 1000000000 items per second")]
    InvalidRate,

    /// A queue was configured with zero capacity
    #[error("queue `{queue}` must hold at least one item")]
    InvalidCapacity { queue: String },

    /// Registration or `run` was attempted after the pipeline started
    #[error("pipeline `{0}` has already been started")]
    AlreadyStarted(String),

    /// `run` was attempted after the pipeline was stopped
    #[error("pipeline `{0}` has already been stopped")]
    AlreadyStopped(String),

    /// `run` was called outside of a tokio runtime
    #[error("pipeline must be run from within a tokio runtime")]
    NoRuntime,

    /// A queue was asked to close a second time
    #[error("queue `{0}` was already closed")]
    QueueAlreadyClosed(String),

    /// Installing an OS signal handler failed
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Returned by [`Sender::send`](crate::queue::Sender::send) when the queue has
/// been closed. The rejected item is handed back to the caller.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// Recover the item that could not be sent
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sending on a closed queue")
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Returned by [`Sender::try_send`](crate::queue::Sender::try_send).
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    /// The queue is at capacity
    Full(T),
    /// The queue has been closed
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the item that could not be sent
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(item) | TrySendError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "Full(..)"),
            TrySendError::Closed(_) => write!(f, "Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "queue is full"),
            TrySendError::Closed(_) => write!(f, "sending on a closed queue"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}
