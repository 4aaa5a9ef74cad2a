//! Domain error types.

use crate::session::{SessionId, SessionState};
use thiserror::Error;

/// Errors raised by session state transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The requested transition is not part of the state machine.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// The session is already in a terminal state; nothing may follow.
    #[error("session {session_id} is terminal ({state})")]
    Terminal {
        session_id: SessionId,
        state: SessionState,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
