//! Pipeline-specific error types.

use crate::types::ProductState;
use std::fmt;
use thiserror::Error;

/// Failure of a push. The item is always handed back to the caller.
pub enum PushError<T> {
    /// Non-blocking push found no free slot.
    Full(T),
    /// No slot became free before the timeout.
    Timeout(T),
    /// The channel has been stopped.
    Stopped(T),
    /// The caller's cancellation condition fired while waiting.
    Cancelled(T),
}

impl<T> PushError<T> {
    /// Take back the item that could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item)
            | PushError::Timeout(item)
            | PushError::Stopped(item)
            | PushError::Cancelled(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PushError::Timeout(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PushError::Stopped(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PushError::Cancelled(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Timeout(_) => f.write_str("Timeout(..)"),
            PushError::Stopped(_) => f.write_str("Stopped(..)"),
            PushError::Cancelled(_) => f.write_str("Cancelled(..)"),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("push on a full channel"),
            PushError::Timeout(_) => f.write_str("timed out waiting for a free slot"),
            PushError::Stopped(_) => f.write_str("push on a stopped channel"),
            PushError::Cancelled(_) => f.write_str("push cancelled"),
        }
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Failure of a pop.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    #[error("pop on an empty channel")]
    Empty,

    #[error("timed out waiting for an item")]
    Timeout,

    #[error("pop on a stopped channel")]
    Stopped,

    #[error("pop cancelled")]
    Cancelled,
}

/// An unexpected failure inside a processing policy.
///
/// This is distinct from a policy deciding to reject a product, which is a
/// normal outcome and not an error.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("product arrived in state {found}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: ProductState,
    },

    #[error("Processing error: {0}")]
    Fault(String),
}

pub type PolicyResult<T> = std::result::Result<T, PolicyError>;
