//! Error types for the Turnstile service.

use thiserror::Error;

use crate::limit::{LimitDecision, StoreError};

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The request was denied by normal policy evaluation.
    #[error("rate limit exceeded, retry after {}s", .0.retry_after)]
    Exceeded(LimitDecision),

    /// The request was denied by an active block marker.
    #[error("temporarily blocked, retry after {}s", .0.retry_after)]
    Blocked(LimitDecision),

    /// The shared counter store could not complete an operation. Never a
    /// policy decision; callers decide whether to fail open or closed.
    #[error("counter store unavailable: {0}")]
    Store(#[from] StoreError),

    /// Malformed caller input (zero cost, unresolvable namespace).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// The decision payload carried by a denial, if any.
    pub fn decision(&self) -> Option<&LimitDecision> {
        match self {
            TurnstileError::Exceeded(d) | TurnstileError::Blocked(d) => Some(d),
            _ => None,
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
