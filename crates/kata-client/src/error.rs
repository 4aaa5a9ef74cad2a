//! Error types for the Kata client library.
//!
//! Classification matters more than messages here: a conflict on create
//! feeds the recovery flow, a vanished session drops the local handle,
//! and a network failure on an idempotent call is retried at the next
//! scheduled interval. Callers match on the variant, not the text.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free
//! guidelines. No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`,
//! or `todo!()`.

use std::io;
use thiserror::Error;

use kata_core::Session;
use kata_protocol::ErrorCode;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors surfaced by the client-side session components.
///
/// # Classification
///
/// - `Conflict` on a create is not fatal: it is the expected trigger for
///   the recovery flow and is handled there, never shown raw to users.
/// - `SessionGone` means the session no longer exists or is already
///   finalized; the controller drops its handle and reports that no
///   recoverable session exists.
/// - `Network` on heartbeat/flush is retried silently at the next
///   interval; state mutations are never blindly retried.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The owner already has a live session. Carries it when the
    /// authority sent it along, saving the recovery flow a query.
    #[error("another session is already live for this owner")]
    Conflict {
        /// The live session the authority reported, if it sent one
        existing: Option<Box<Session>>,
    },

    /// The targeted session does not exist or is already finalized.
    #[error("session no longer exists")]
    SessionGone,

    /// No current session to operate on (nothing started or recovered yet).
    #[error("no current session")]
    NoCurrentSession,

    /// The request itself was rejected as malformed.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Transient connectivity failure. Safe to retry idempotent calls.
    #[error("network error: {0}")]
    Network(String),

    /// Protocol version mismatch with the authority.
    ///
    /// The client and daemon are running incompatible protocol versions.
    /// Ensure both are the same release.
    #[error("protocol version mismatch (client: {client_version}, authority: {authority_version})")]
    VersionMismatch {
        /// The protocol version this client supports.
        client_version: String,
        /// The protocol version the authority is running.
        authority_version: String,
    },

    /// A message could not be parsed or arrived out of sequence.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The authority reported an internal failure.
    #[error("authority error: {0}")]
    Authority(String),

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    /// Builds a client error from a wire-level error code.
    pub fn from_wire(code: ErrorCode, message: String, existing: Option<Box<Session>>) -> Self {
        match code {
            ErrorCode::Conflict => Self::Conflict { existing },
            ErrorCode::NotFound => Self::SessionGone,
            ErrorCode::Invalid => Self::Invalid(message),
            ErrorCode::Protocol => Self::Protocol(message),
            ErrorCode::Internal => Self::Authority(message),
        }
    }

    /// Returns true for failures where retrying an idempotent call at
    /// the next scheduled interval is the right response.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Returns true if the session this call targeted should be treated
    /// as gone (drop the local handle, offer a fresh start).
    pub fn is_session_gone(&self) -> bool {
        matches!(self, Self::SessionGone)
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================
