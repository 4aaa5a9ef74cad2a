//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending
//! commands to the registry actor and subscribing to session events.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};

use kata_core::{
    CodeSnapshot, CourseRef, OwnerId, PracticeCounters, ProblemRef, Session, SessionId,
    SessionKind, SessionSummary, TerminationReason,
};

use super::commands::{RegistryCommand, RegistryError, RegistryStats, SessionEvent};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
/// All methods are async and communicate with the actor via channels.
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<SessionEvent>,
}

impl RegistryHandle {
    /// Create a new registry handle.
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Create a new session for an owner.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Conflict` if the owner already has a live session
    /// - `RegistryError::Invalid` for a roadmap create without a course
    /// - `RegistryError::CapacityExceeded` at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn create(
        &self,
        owner: OwnerId,
        kind: SessionKind,
        problem: ProblemRef,
        course: Option<CourseRef>,
    ) -> Result<Session, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Create {
                owner,
                kind,
                problem,
                course,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Look up an owner's live session.
    ///
    /// Returns `None` if there is none or if communication with the
    /// actor fails.
    pub async fn query_active(&self, owner: OwnerId) -> Option<Session> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::QueryActive {
                owner,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Look up an owner's live session for one specific problem.
    pub async fn query_active_for_problem(
        &self,
        owner: OwnerId,
        problem_id: impl Into<String>,
    ) -> Option<Session> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::QueryActiveForProblem {
                owner,
                problem_id: problem_id.into(),
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Record a presence heartbeat. Returns the activity high-water mark.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` if the session is unknown or finalized
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn heartbeat(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Heartbeat {
                session_id,
                at,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Pause a live session. Returns the updated record.
    pub async fn pause(&self, session_id: SessionId) -> Result<Session, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Pause {
                session_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Resume a paused session. Returns the updated record.
    pub async fn resume(&self, session_id: SessionId) -> Result<Session, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Resume {
                session_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Upsert analytics counters and the latest snapshot.
    ///
    /// Safe to retry: counters merge by per-field maximum.
    pub async fn flush(
        &self,
        session_id: SessionId,
        counters: PracticeCounters,
        snapshot: Option<CodeSnapshot>,
    ) -> Result<DateTime<Utc>, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Flush {
                session_id,
                counters,
                snapshot,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Finalize a session. Returns the history record that was appended.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotFound` if the session is unknown or already
    ///   finalized (this is what a double-submit sees)
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn terminate(
        &self,
        session_id: SessionId,
        reason: TerminationReason,
    ) -> Result<SessionSummary, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Terminate {
                session_id,
                reason,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Fetch an owner's finalized-session history.
    ///
    /// Returns an empty vector if communication with the actor fails.
    pub async fn history(&self, owner: OwnerId) -> Vec<SessionSummary> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::History {
                owner,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Registry occupancy, for monitoring.
    pub async fn stats(&self) -> RegistryStats {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::Stats { respond_to: tx })
            .await
            .is_err()
        {
            return RegistryStats::default();
        }

        rx.await.unwrap_or_default()
    }

    /// Trigger a staleness sweep.
    ///
    /// Fire-and-forget; used by the sweep task.
    pub async fn sweep_stale(&self) {
        // Ignore send errors - actor may be shutting down
        let _ = self.sender.send(RegistryCommand::SweepStale).await;
    }

    /// Subscribe to session events.
    ///
    /// Returns a broadcast receiver for all session events (creations,
    /// updates, finalizations) published by the registry actor.
    ///
    /// This is a synchronous operation - it doesn't communicate with the
    /// actor.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Check if the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
