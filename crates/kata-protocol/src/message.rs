//! Protocol message types for client-authority communication.
//!
//! Messages travel as newline-delimited JSON over the authority's Unix
//! socket. Requests map one-to-one onto authority operations; responses
//! carry full session records so clients can refresh their local mirror
//! from any exchange.

use crate::version::ProtocolVersion;
use chrono::{DateTime, Utc};
use kata_core::{
    CodeSnapshot, CourseRef, OwnerId, PracticeCounters, ProblemRef, Session, SessionId,
    SessionKind, SessionSummary, StalenessPolicy, TerminationReason,
};
use serde::{Deserialize, Serialize};

/// Request payloads clients can send to the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    /// Client handshake/connection request
    Hello {
        /// Client identifier (optional; the authority assigns one if absent)
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Look up the owner's live session, if any
    QueryActive { owner: OwnerId },

    /// Look up the owner's live session for one specific problem
    QueryActiveForProblem { owner: OwnerId, problem_id: String },

    /// Create a new session for the owner
    Create {
        owner: OwnerId,
        kind: SessionKind,
        problem: ProblemRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        course: Option<CourseRef>,
    },

    /// Idempotent presence touch for a live session
    Heartbeat {
        session_id: SessionId,
        /// Client's reconciled clock reading for this touch
        at: DateTime<Utc>,
    },

    /// Pause a live session
    Pause { session_id: SessionId },

    /// Resume a paused session
    Resume { session_id: SessionId },

    /// Upsert accumulated analytics counters and the latest code snapshot
    Flush {
        session_id: SessionId,
        counters: PracticeCounters,
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<CodeSnapshot>,
    },

    /// Finalize a session into the terminal state implied by the reason
    Terminate {
        session_id: SessionId,
        reason: TerminationReason,
    },

    /// Fetch the owner's finalized-session history
    History { owner: OwnerId },

    /// Subscribe to session change events, optionally scoped to one owner
    Subscribe {
        #[serde(skip_serializing_if = "Option::is_none")]
        owner: Option<OwnerId>,
    },

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Request payload
    #[serde(flatten)]
    pub request: RequestKind,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(request: RequestKind) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            request,
        }
    }

    pub fn hello(client_id: Option<String>) -> Self {
        Self::new(RequestKind::Hello { client_id })
    }

    pub fn query_active(owner: OwnerId) -> Self {
        Self::new(RequestKind::QueryActive { owner })
    }

    pub fn query_active_for_problem(owner: OwnerId, problem_id: impl Into<String>) -> Self {
        Self::new(RequestKind::QueryActiveForProblem {
            owner,
            problem_id: problem_id.into(),
        })
    }

    pub fn create(
        owner: OwnerId,
        kind: SessionKind,
        problem: ProblemRef,
        course: Option<CourseRef>,
    ) -> Self {
        Self::new(RequestKind::Create {
            owner,
            kind,
            problem,
            course,
        })
    }

    pub fn heartbeat(session_id: SessionId, at: DateTime<Utc>) -> Self {
        Self::new(RequestKind::Heartbeat { session_id, at })
    }

    pub fn pause(session_id: SessionId) -> Self {
        Self::new(RequestKind::Pause { session_id })
    }

    pub fn resume(session_id: SessionId) -> Self {
        Self::new(RequestKind::Resume { session_id })
    }

    pub fn flush(
        session_id: SessionId,
        counters: PracticeCounters,
        snapshot: Option<CodeSnapshot>,
    ) -> Self {
        Self::new(RequestKind::Flush {
            session_id,
            counters,
            snapshot,
        })
    }

    pub fn terminate(session_id: SessionId, reason: TerminationReason) -> Self {
        Self::new(RequestKind::Terminate { session_id, reason })
    }

    pub fn history(owner: OwnerId) -> Self {
        Self::new(RequestKind::History { owner })
    }

    pub fn subscribe(owner: Option<OwnerId>) -> Self {
        Self::new(RequestKind::Subscribe { owner })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(RequestKind::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(RequestKind::Disconnect)
    }
}

/// Machine-readable error category carried across the wire.
///
/// Clients re-type these into their own error enums; the code is the
/// contract, the message is for logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The owner already has a live session (create), or the requested
    /// transition is not legal from the session's current state.
    Conflict,

    /// The session does not exist or is already finalized.
    NotFound,

    /// The request itself is malformed (e.g. roadmap create without a course).
    Invalid,

    /// Protocol-level problem (bad message, unexpected sequence).
    Protocol,

    /// Authority-side failure.
    Internal,
}

/// Messages sent from the authority to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthorityMessage {
    /// Connection accepted
    Welcome {
        /// Authority's protocol version
        protocol_version: ProtocolVersion,
        /// Assigned client ID
        client_id: String,
        /// Authority clock reading; anchors the client's clock reconciler
        server_time: DateTime<Utc>,
        /// Cadence/staleness policy the client should follow
        policy: StalenessPolicy,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        /// Reason for rejection
        reason: String,
        /// Authority's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Answer to the active-session queries
    ActiveSession {
        /// The live session, if one exists (boxed for size)
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<Box<Session>>,
        /// Authority clock reading at answer time
        server_time: DateTime<Utc>,
    },

    /// A session was created for this client's request
    Created { session: Box<Session> },

    /// Updated session record after a pause/resume
    StateChanged { session: Box<Session> },

    /// Heartbeat accepted
    HeartbeatAck {
        /// The recorded activity high-water mark
        last_activity: DateTime<Utc>,
        /// Authority clock reading, for reconciler re-sync
        server_time: DateTime<Utc>,
    },

    /// Analytics flush accepted
    FlushAck {
        /// The recorded activity high-water mark
        last_activity: DateTime<Utc>,
    },

    /// Session finalized; carries the history record that was appended
    Terminated { summary: Box<SessionSummary> },

    /// The owner's finalized-session history
    HistoryList { summaries: Vec<SessionSummary> },

    /// Broadcast: a live session changed (created, touched, paused, resumed)
    SessionChanged { session: Box<Session> },

    /// Broadcast: a session left the live set
    SessionFinalized {
        session_id: SessionId,
        reason: TerminationReason,
    },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response
    Error {
        /// Machine-readable category
        code: ErrorCode,
        /// Human-readable detail for logs
        message: String,
        /// On `Conflict` from a create: the session that already exists,
        /// so the recovery flow starts without another round trip
        #[serde(skip_serializing_if = "Option::is_none")]
        existing: Option<Box<Session>>,
    },
}

impl AuthorityMessage {
    pub fn welcome(client_id: String, server_time: DateTime<Utc>, policy: StalenessPolicy) -> Self {
        Self::Welcome {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
            server_time,
            policy,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn active_session(session: Option<Session>, server_time: DateTime<Utc>) -> Self {
        Self::ActiveSession {
            session: session.map(Box::new),
            server_time,
        }
    }

    pub fn created(session: Session) -> Self {
        Self::Created {
            session: Box::new(session),
        }
    }

    pub fn state_changed(session: Session) -> Self {
        Self::StateChanged {
            session: Box::new(session),
        }
    }

    pub fn heartbeat_ack(last_activity: DateTime<Utc>, server_time: DateTime<Utc>) -> Self {
        Self::HeartbeatAck {
            last_activity,
            server_time,
        }
    }

    pub fn flush_ack(last_activity: DateTime<Utc>) -> Self {
        Self::FlushAck { last_activity }
    }

    pub fn terminated(summary: SessionSummary) -> Self {
        Self::Terminated {
            summary: Box::new(summary),
        }
    }

    pub fn history_list(summaries: Vec<SessionSummary>) -> Self {
        Self::HistoryList { summaries }
    }

    pub fn session_changed(session: Session) -> Self {
        Self::SessionChanged {
            session: Box::new(session),
        }
    }

    pub fn session_finalized(session_id: SessionId, reason: TerminationReason) -> Self {
        Self::SessionFinalized { session_id, reason }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(code: ErrorCode, message: &str) -> Self {
        Self::Error {
            code,
            message: message.to_string(),
            existing: None,
        }
    }

    /// Conflict error carrying the already-live session.
    pub fn conflict(message: &str, existing: Session) -> Self {
        Self::Error {
            code: ErrorCode::Conflict,
            message: message.to_string(),
            existing: Some(Box::new(existing)),
        }
    }
}
