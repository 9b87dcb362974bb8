//! Error types shared by the queues and locks.
//!
//! Timeouts and cancellations are ordinary outcomes here, not panics.
//! Send-side errors hand the rejected value back so nothing is dropped behind the caller's back.

use std::fmt;

use thiserror::Error;

/// Construction-time failure: a bounded structure needs room for at least one element.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    #[error("capacity must be at least 1")]
    Zero,
}

/// A value that could not be handed over, returned to the caller.
#[derive(Error, PartialEq, Eq)]
pub enum SendError<T> {
    #[error("timed out waiting for room")]
    Timeout(T),

    #[error("cancelled while waiting for room")]
    Cancelled(T),
}

impl<T> SendError<T> {
    /// Gives back the value that wasn't sent.
    pub fn into_inner(self) -> T {
        match self {
            SendError::Timeout(item) | SendError::Cancelled(item) => item,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SendError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SendError::Cancelled(_))
    }
}

/// The payload isn't required to be Debug, same as std's channel errors
impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Timeout(_) => f.write_str("Timeout(..)"),
            SendError::Cancelled(_) => f.write_str("Cancelled(..)"),
        }
    }
}

/// Nothing arrived in time, or the receiver was asked to stop.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    #[error("timed out waiting for an element")]
    Timeout,

    #[error("cancelled while waiting for an element")]
    Cancelled,
}

/// Failure of a cancellable lock acquisition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("cancelled while waiting for the lock")]
    Cancelled,
}
