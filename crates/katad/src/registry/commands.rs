//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the
//! `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `SessionEvent`: Events published by the registry for subscribers
//!
//! All types are designed for async message passing and follow the
//! panic-free policy.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;

use kata_core::{
    CodeSnapshot, CourseRef, DomainError, OwnerId, PracticeCounters, ProblemRef, Session,
    SessionId, SessionKind, SessionSummary, TerminationReason,
};

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking. The actor
/// processes commands strictly in order, which is what serializes
/// concurrent `Create` attempts for the same owner.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Create a new session for an owner.
    ///
    /// # Errors
    /// - `RegistryError::Conflict` if the owner already has a live session
    /// - `RegistryError::Invalid` for a roadmap create without a course
    /// - `RegistryError::CapacityExceeded` if at maximum capacity
    Create {
        owner: OwnerId,
        kind: SessionKind,
        problem: ProblemRef,
        course: Option<CourseRef>,
        /// Channel to send the result
        respond_to: oneshot::Sender<Result<Session, RegistryError>>,
    },

    /// Look up an owner's live session, if any.
    QueryActive {
        owner: OwnerId,
        respond_to: oneshot::Sender<Option<Session>>,
    },

    /// Look up an owner's live session for one specific problem.
    QueryActiveForProblem {
        owner: OwnerId,
        problem_id: String,
        respond_to: oneshot::Sender<Option<Session>>,
    },

    /// Record a presence touch for a live session.
    ///
    /// Idempotent: the activity timestamp is a high-water mark, so
    /// replayed or out-of-order touches are harmless.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if the session is unknown or finalized
    Heartbeat {
        session_id: SessionId,
        at: DateTime<Utc>,
        /// Responds with the recorded high-water mark
        respond_to: oneshot::Sender<Result<DateTime<Utc>, RegistryError>>,
    },

    /// Pause a live session.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if the session is unknown or finalized
    /// - `RegistryError::Transition` if the session is not `Active`
    Pause {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<Session, RegistryError>>,
    },

    /// Resume a paused session.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if the session is unknown or finalized
    /// - `RegistryError::Transition` if the session is not `Paused`
    Resume {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<Session, RegistryError>>,
    },

    /// Upsert analytics counters and the latest code snapshot.
    ///
    /// Counters merge by per-field maximum, so this is safe to retry.
    ///
    /// # Errors
    /// - `RegistryError::NotFound` if the session is unknown or finalized
    Flush {
        session_id: SessionId,
        counters: PracticeCounters,
        snapshot: Option<CodeSnapshot>,
        /// Responds with the recorded activity high-water mark
        respond_to: oneshot::Sender<Result<DateTime<Utc>, RegistryError>>,
    },

    /// Finalize a session into the terminal state implied by the reason.
    ///
    /// Appends a summary to the history log and removes the session from
    /// the live set. A second terminate for the same id gets `NotFound`,
    /// so double-submits cannot double-record history.
    Terminate {
        session_id: SessionId,
        reason: TerminationReason,
        respond_to: oneshot::Sender<Result<SessionSummary, RegistryError>>,
    },

    /// Fetch an owner's finalized-session history.
    History {
        owner: OwnerId,
        respond_to: oneshot::Sender<Vec<SessionSummary>>,
    },

    /// Registry occupancy, for the resource monitor.
    Stats {
        respond_to: oneshot::Sender<RegistryStats>,
    },

    /// Expire live sessions past the staleness policy.
    ///
    /// Fire-and-forget; triggered by the sweep task.
    SweepStale,
}

/// Occupancy snapshot for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    /// Live (active or paused) sessions
    pub live: usize,
    /// Finalized sessions in the history log
    pub history: usize,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The owner already has a live session. Carries that session so the
    /// losing side of a create race can go straight into recovery.
    #[error("owner {owner} already has a live session {}", .existing.id)]
    Conflict {
        owner: OwnerId,
        existing: Box<Session>,
    },

    /// The requested session does not exist or is already finalized.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The requested transition is not legal from the current state.
    #[error(transparent)]
    Transition(#[from] DomainError),

    /// The request is malformed.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The registry has reached its maximum live-session capacity.
    #[error("registry is full (max: {max} live sessions)")]
    CapacityExceeded { max: usize },

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Session Events
// ============================================================================

/// Events published by the registry to subscribers.
///
/// Broadcast to connected observer clients via the broadcast channel;
/// the server filters them per subscription owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new session was created.
    Created {
        /// The new session (boxed for size)
        session: Box<Session>,
    },

    /// A live session changed (touch, pause, resume, analytics flush).
    Updated {
        /// The updated session (boxed for size)
        session: Box<Session>,
    },

    /// A session left the live set.
    Finalized {
        session_id: SessionId,
        owner: OwnerId,
        reason: TerminationReason,
    },
}

impl SessionEvent {
    /// The owner the event concerns, for subscription filtering.
    pub fn owner(&self) -> &OwnerId {
        match self {
            Self::Created { session } | Self::Updated { session } => &session.owner,
            Self::Finalized { owner, .. } => owner,
        }
    }
}
