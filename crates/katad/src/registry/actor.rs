//! Registry actor - owns all session state and processes commands.
//!
//! The RegistryActor is the single owner of session state in the system.
//! It receives commands via an mpsc channel and publishes events via
//! broadcast. Because commands are processed strictly in order by one
//! task, two `Create` requests for the same owner can never interleave:
//! whichever lands second sees the first one's session and is rejected
//! with a conflict. That sequential processing IS the at-most-one-live-
//! session-per-owner guarantee; client-side pre-checks are advisory only.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kata_core::{
    CodeSnapshot, CourseRef, OwnerId, PracticeCounters, ProblemRef, Session, SessionId,
    SessionKind, SessionState, SessionSummary, StalenessPolicy, TerminationReason,
};

use super::commands::{RegistryCommand, RegistryError, RegistryStats, SessionEvent};

// ============================================================================
// Resource Limits
// ============================================================================

/// Maximum number of live sessions the registry will hold.
pub const MAX_LIVE_SESSIONS: usize = 10_000;

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all session state.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially, and publishes events to subscribers.
///
/// # Ownership
///
/// The actor owns:
/// - `live`: live sessions keyed by owner (one slot per owner, which
///   makes the single-live-session rule structural)
/// - `index`: session_id → owner lookups
/// - `history`: append-only log of finalized session summaries
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Live sessions, keyed by owner. An owner occupies at most one slot.
    live: HashMap<OwnerId, Session>,

    /// Index for session_id → owner lookups.
    index: HashMap<SessionId, OwnerId>,

    /// Append-only log of finalized sessions. Never truncated here;
    /// durable storage and aggregate reporting live elsewhere.
    history: Vec<SessionSummary>,

    /// Staleness thresholds applied by the sweep.
    policy: StalenessPolicy,

    /// Event publisher for real-time updates to observer clients
    event_publisher: broadcast::Sender<SessionEvent>,
}

impl RegistryActor {
    /// Creates a new registry actor.
    ///
    /// # Arguments
    ///
    /// * `receiver` - Channel for receiving commands
    /// * `event_publisher` - Broadcast channel for publishing events
    /// * `policy` - Staleness thresholds for the sweep
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<SessionEvent>,
        policy: StalenessPolicy,
    ) -> Self {
        Self {
            receiver,
            live: HashMap::new(),
            index: HashMap::new(),
            history: Vec::new(),
            policy,
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    /// This is the main entry point - call this in a spawned task.
    pub async fn run(mut self) {
        info!("Session registry starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            live = self.live.len(),
            history = self.history.len(),
            "Session registry stopped"
        );
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Create {
                owner,
                kind,
                problem,
                course,
                respond_to,
            } => {
                let result = self.handle_create(owner, kind, problem, course);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::QueryActive { owner, respond_to } => {
                let _ = respond_to.send(self.live.get(&owner).cloned());
            }
            RegistryCommand::QueryActiveForProblem {
                owner,
                problem_id,
                respond_to,
            } => {
                let result = self
                    .live
                    .get(&owner)
                    .filter(|s| s.problem.id == problem_id)
                    .cloned();
                let _ = respond_to.send(result);
            }
            RegistryCommand::Heartbeat {
                session_id,
                at,
                respond_to,
            } => {
                let result = self.handle_heartbeat(session_id, at);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Pause {
                session_id,
                respond_to,
            } => {
                let result = self.handle_pause(session_id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Resume {
                session_id,
                respond_to,
            } => {
                let result = self.handle_resume(session_id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Flush {
                session_id,
                counters,
                snapshot,
                respond_to,
            } => {
                let result = self.handle_flush(session_id, counters, snapshot);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Terminate {
                session_id,
                reason,
                respond_to,
            } => {
                let result = self.handle_terminate(session_id, reason);
                let _ = respond_to.send(result);
            }
            RegistryCommand::History { owner, respond_to } => {
                let summaries = self
                    .history
                    .iter()
                    .filter(|s| s.owner == owner)
                    .cloned()
                    .collect();
                let _ = respond_to.send(summaries);
            }
            RegistryCommand::Stats { respond_to } => {
                let _ = respond_to.send(RegistryStats {
                    live: self.live.len(),
                    history: self.history.len(),
                });
            }
            RegistryCommand::SweepStale => {
                self.handle_sweep_stale(Utc::now());
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Handles session creation.
    ///
    /// The owner's live slot is checked and filled within this single
    /// sequential handler, so a create that loses a race is rejected
    /// here, never silently accepted.
    fn handle_create(
        &mut self,
        owner: OwnerId,
        kind: SessionKind,
        problem: ProblemRef,
        course: Option<CourseRef>,
    ) -> Result<Session, RegistryError> {
        if kind.requires_course() && course.is_none() {
            return Err(RegistryError::Invalid(
                "roadmap sessions require a course reference".to_string(),
            ));
        }

        // One live session per owner: reject the create and hand back the
        // existing session for the recovery flow.
        if let Some(existing) = self.live.get(&owner) {
            debug!(
                owner = %owner,
                existing = %existing.id,
                state = %existing.state,
                "Create rejected, owner already has a live session"
            );
            return Err(RegistryError::Conflict {
                owner,
                existing: Box::new(existing.clone()),
            });
        }

        if self.live.len() >= MAX_LIVE_SESSIONS {
            warn!(
                owner = %owner,
                current = self.live.len(),
                max = MAX_LIVE_SESSIONS,
                "Registry is full, rejecting create"
            );
            return Err(RegistryError::CapacityExceeded {
                max: MAX_LIVE_SESSIONS,
            });
        }

        let id = SessionId::new(Uuid::new_v4().to_string());
        let session = Session::new(id.clone(), owner.clone(), kind, problem, course, Utc::now());

        self.index.insert(id.clone(), owner.clone());
        self.live.insert(owner.clone(), session.clone());

        info!(
            session_id = %id,
            owner = %owner,
            kind = %kind,
            problem = %session.problem.id,
            live_sessions = self.live.len(),
            "Session created"
        );

        // Publish event (ignore if no subscribers)
        let _ = self.event_publisher.send(SessionEvent::Created {
            session: Box::new(session.clone()),
        });

        Ok(session)
    }

    /// Handles a presence heartbeat.
    fn handle_heartbeat(
        &mut self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RegistryError> {
        let session = self.live_session_mut(&session_id)?;
        let recorded = session.touch(at);

        debug!(
            session_id = %session_id,
            last_activity = %recorded,
            "Heartbeat recorded"
        );

        let updated = session.clone();
        let _ = self.event_publisher.send(SessionEvent::Updated {
            session: Box::new(updated),
        });

        Ok(recorded)
    }

    /// Handles pausing a session.
    fn handle_pause(&mut self, session_id: SessionId) -> Result<Session, RegistryError> {
        let now = Utc::now();
        let session = self.live_session_mut(&session_id)?;
        session.pause(now)?;

        info!(session_id = %session_id, "Session paused");

        let updated = session.clone();
        let _ = self.event_publisher.send(SessionEvent::Updated {
            session: Box::new(updated.clone()),
        });

        Ok(updated)
    }

    /// Handles resuming a paused session.
    fn handle_resume(&mut self, session_id: SessionId) -> Result<Session, RegistryError> {
        let now = Utc::now();
        let session = self.live_session_mut(&session_id)?;
        session.resume(now)?;

        info!(
            session_id = %session_id,
            paused_ms = session.paused_ms,
            "Session resumed"
        );

        let updated = session.clone();
        let _ = self.event_publisher.send(SessionEvent::Updated {
            session: Box::new(updated.clone()),
        });

        Ok(updated)
    }

    /// Handles an analytics flush.
    fn handle_flush(
        &mut self,
        session_id: SessionId,
        counters: PracticeCounters,
        snapshot: Option<CodeSnapshot>,
    ) -> Result<DateTime<Utc>, RegistryError> {
        let now = Utc::now();
        let session = self.live_session_mut(&session_id)?;
        session.record_flush(&counters, snapshot, now);

        debug!(
            session_id = %session_id,
            counters = %session.counters,
            has_snapshot = session.snapshot.is_some(),
            "Analytics flushed"
        );

        let last_activity = session.last_activity;
        let updated = session.clone();
        let _ = self.event_publisher.send(SessionEvent::Updated {
            session: Box::new(updated),
        });

        Ok(last_activity)
    }

    /// Handles session termination.
    ///
    /// Removes the session from the live set and appends exactly one
    /// summary to history. A repeated terminate finds no live session
    /// and gets `NotFound`, so double-submits cannot double-record.
    fn handle_terminate(
        &mut self,
        session_id: SessionId,
        reason: TerminationReason,
    ) -> Result<SessionSummary, RegistryError> {
        let owner = match self.index.get(&session_id) {
            Some(owner) => owner.clone(),
            None => return Err(RegistryError::NotFound(session_id)),
        };

        let now = Utc::now();

        // Finalize in place first; only a legal transition removes the
        // session from the live set.
        let summary = match self.live.get_mut(&owner) {
            Some(session) if session.id == session_id => {
                session.finalize(reason, now)?;
                SessionSummary::from_session(session, now)
            }
            _ => return Err(RegistryError::NotFound(session_id)),
        };

        self.live.remove(&owner);
        self.index.remove(&session_id);
        self.history.push(summary.clone());

        info!(
            session_id = %session_id,
            owner = %owner,
            reason = %reason,
            active_secs = summary.active_secs,
            live_sessions = self.live.len(),
            "Session finalized"
        );

        let _ = self.event_publisher.send(SessionEvent::Finalized {
            session_id,
            owner,
            reason,
        });

        Ok(summary)
    }

    /// Expires live sessions past the staleness policy.
    ///
    /// Active sessions expire once idle beyond `idle_timeout` (their
    /// heartbeat has evidently stopped). Paused sessions are exempt from
    /// the idle rule - their heartbeat is suspended on purpose - and
    /// instead expire after `pause_timeout` in the paused state.
    fn handle_sweep_stale(&mut self, now: DateTime<Utc>) {
        let idle_timeout = self.policy.idle_timeout();
        let pause_timeout = self.policy.pause_timeout();

        let to_expire: Vec<SessionId> = self
            .live
            .values()
            .filter(|session| match session.state {
                SessionState::Active => session.idle_for(now) > idle_timeout,
                SessionState::Paused => session.paused_for(now) > pause_timeout,
                _ => false,
            })
            .map(|session| session.id.clone())
            .collect();

        if to_expire.is_empty() {
            debug!("No stale sessions to expire");
            return;
        }

        info!(count = to_expire.len(), "Expiring stale sessions");

        for session_id in to_expire {
            match self.handle_terminate(session_id.clone(), TerminationReason::Expired) {
                Ok(summary) => {
                    // warn! so expiries show up without debug logging
                    warn!(
                        session_id = %session_id,
                        idle_secs = (now - summary.finished_at).num_seconds().abs(),
                        "Session expired by staleness sweep"
                    );
                }
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "Expiry skipped");
                }
            }
        }
    }

    /// Looks up a live session by id.
    fn live_session_mut(
        &mut self,
        session_id: &SessionId,
    ) -> Result<&mut Session, RegistryError> {
        let owner = self
            .index
            .get(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.clone()))?;
        match self.live.get_mut(owner) {
            Some(session) if &session.id == session_id => Ok(session),
            _ => Err(RegistryError::NotFound(session_id.clone())),
        }
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    /// Returns the number of live sessions.
    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Returns the number of history records.
    #[cfg(test)]
    fn history_count(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tokio::sync::oneshot;

    fn create_actor() -> (
        RegistryActor,
        broadcast::Receiver<SessionEvent>,
    ) {
        let (_cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(16);
        let actor = RegistryActor::new(cmd_rx, event_tx, StalenessPolicy::default());
        (actor, event_rx)
    }

    fn create_cmd(owner: &str) -> (RegistryCommand, oneshot::Receiver<Result<Session, RegistryError>>) {
        let (tx, rx) = oneshot::channel();
        (
            RegistryCommand::Create {
                owner: OwnerId::new(owner),
                kind: SessionKind::DailyChallenge,
                problem: ProblemRef::new("two-sum", "Two Sum"),
                course: None,
                respond_to: tx,
            },
            rx,
        )
    }

    fn must_create(actor: &mut RegistryActor, owner: &str) -> Session {
        let (cmd, mut rx) = create_cmd(owner);
        actor.handle_command(cmd);
        rx.try_recv().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_create_session() {
        let (mut actor, mut event_rx) = create_actor();

        let session = must_create(&mut actor, "learner-1");

        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.owner.as_str(), "learner-1");
        assert!(!session.id.as_str().is_empty());
        assert_eq!(actor.live_count(), 1);

        let event = event_rx.try_recv().unwrap();
        assert!(matches!(event, SessionEvent::Created { .. }));
    }

    #[tokio::test]
    async fn test_create_conflict_for_same_owner() {
        let (mut actor, _) = create_actor();

        let first = must_create(&mut actor, "learner-1");

        let (cmd, mut rx) = create_cmd("learner-1");
        actor.handle_command(cmd);
        let result = rx.try_recv().unwrap();

        match result {
            Err(RegistryError::Conflict { existing, .. }) => {
                assert_eq!(existing.id, first.id);
            }
            other => panic!("Expected Conflict, got {other:?}"),
        }
        assert_eq!(actor.live_count(), 1);
    }

    #[tokio::test]
    async fn test_create_allowed_for_different_owners() {
        let (mut actor, _) = create_actor();

        must_create(&mut actor, "learner-1");
        must_create(&mut actor, "learner-2");

        assert_eq!(actor.live_count(), 2);
    }

    #[tokio::test]
    async fn test_roadmap_create_requires_course() {
        let (mut actor, _) = create_actor();

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Create {
            owner: OwnerId::new("learner-1"),
            kind: SessionKind::RoadmapChallenge,
            problem: ProblemRef::new("graphs-1", "Shortest Path"),
            course: None,
            respond_to: tx,
        });

        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(RegistryError::Invalid(_))));
        assert_eq!(actor.live_count(), 0);
    }

    #[tokio::test]
    async fn test_query_active() {
        let (mut actor, _) = create_actor();
        let session = must_create(&mut actor, "learner-1");

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::QueryActive {
            owner: OwnerId::new("learner-1"),
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap().unwrap().id, session.id);

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::QueryActive {
            owner: OwnerId::new("learner-2"),
            respond_to: tx,
        });
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_active_for_problem_filters() {
        let (mut actor, _) = create_actor();
        must_create(&mut actor, "learner-1");

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::QueryActiveForProblem {
            owner: OwnerId::new("learner-1"),
            problem_id: "two-sum".to_string(),
            respond_to: tx,
        });
        assert!(rx.try_recv().unwrap().is_some());

        // Same owner, different problem: the query is scoped, so no match
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::QueryActiveForProblem {
            owner: OwnerId::new("learner-1"),
            problem_id: "three-sum".to_string(),
            respond_to: tx,
        });
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_is_monotonic() {
        let (mut actor, _) = create_actor();
        let session = must_create(&mut actor, "learner-1");

        let later = session.started_at + Duration::seconds(30);
        let earlier = session.started_at + Duration::seconds(10);

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Heartbeat {
            session_id: session.id.clone(),
            at: later,
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap().unwrap(), later);

        // Replaying an earlier heartbeat must not regress the mark
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Heartbeat {
            session_id: session.id.clone(),
            at: earlier,
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap().unwrap(), later);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_session() {
        let (mut actor, _) = create_actor();

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Heartbeat {
            session_id: SessionId::new("nope"),
            at: Utc::now(),
            respond_to: tx,
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let (mut actor, _) = create_actor();
        let session = must_create(&mut actor, "learner-1");

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Pause {
            session_id: session.id.clone(),
            respond_to: tx,
        });
        let paused = rx.try_recv().unwrap().unwrap();
        assert_eq!(paused.state, SessionState::Paused);
        assert!(paused.paused_at.is_some());

        // Pausing again is a transition conflict, not a silent success
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Pause {
            session_id: session.id.clone(),
            respond_to: tx,
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(RegistryError::Transition(_))
        ));

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Resume {
            session_id: session.id.clone(),
            respond_to: tx,
        });
        let resumed = rx.try_recv().unwrap().unwrap();
        assert_eq!(resumed.state, SessionState::Active);
        assert!(resumed.paused_at.is_none());
    }

    #[tokio::test]
    async fn test_flush_merges_counters_and_stores_snapshot() {
        let (mut actor, _) = create_actor();
        let session = must_create(&mut actor, "learner-1");

        let counters = PracticeCounters {
            code_changes: 3,
            test_runs: 1,
            ..PracticeCounters::default()
        };
        let code = "print('hello')\n";

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Flush {
            session_id: session.id.clone(),
            counters,
            snapshot: Some(CodeSnapshot::new(code, "python")),
            respond_to: tx,
        });
        rx.try_recv().unwrap().unwrap();

        // The snapshot comes back byte-for-byte on the next query
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::QueryActive {
            owner: OwnerId::new("learner-1"),
            respond_to: tx,
        });
        let fetched = rx.try_recv().unwrap().unwrap();
        assert_eq!(fetched.counters.code_changes, 3);
        let snapshot = fetched.snapshot.unwrap();
        assert_eq!(snapshot.code.as_bytes(), code.as_bytes());
        assert_eq!(snapshot.language, "python");
    }

    #[tokio::test]
    async fn test_terminate_moves_to_history() {
        let (mut actor, mut event_rx) = create_actor();
        let session = must_create(&mut actor, "learner-1");
        let _ = event_rx.try_recv();

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Terminate {
            session_id: session.id.clone(),
            reason: TerminationReason::Solved,
            respond_to: tx,
        });
        let summary = rx.try_recv().unwrap().unwrap();

        assert!(summary.is_completed);
        assert_eq!(summary.termination, TerminationReason::Solved);
        assert_eq!(actor.live_count(), 0);
        assert_eq!(actor.history_count(), 1);

        let event = event_rx.try_recv().unwrap();
        assert!(matches!(
            event,
            SessionEvent::Finalized {
                reason: TerminationReason::Solved,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_double_terminate_is_not_found() {
        let (mut actor, _) = create_actor();
        let session = must_create(&mut actor, "learner-1");

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Terminate {
            session_id: session.id.clone(),
            reason: TerminationReason::Solved,
            respond_to: tx,
        });
        rx.try_recv().unwrap().unwrap();

        // Double-submit: second terminate fails and history stays at one
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Terminate {
            session_id: session.id.clone(),
            reason: TerminationReason::Solved,
            respond_to: tx,
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(actor.history_count(), 1);
    }

    #[tokio::test]
    async fn test_owner_can_start_again_after_terminate() {
        let (mut actor, _) = create_actor();
        let session = must_create(&mut actor, "learner-1");

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Terminate {
            session_id: session.id,
            reason: TerminationReason::UserDismissed,
            respond_to: tx,
        });
        rx.try_recv().unwrap().unwrap();

        let replacement = must_create(&mut actor, "learner-1");
        assert_eq!(replacement.state, SessionState::Active);
        assert_eq!(actor.live_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_expires_idle_active_sessions() {
        let (mut actor, _) = create_actor();
        let session = must_create(&mut actor, "learner-1");

        // Age the session past the idle timeout
        let idle = actor.policy.idle_timeout() + Duration::seconds(1);
        if let Some(s) = actor.live.get_mut(&OwnerId::new("learner-1")) {
            s.last_activity = s.last_activity - idle;
            s.started_at = s.started_at - idle;
        }

        actor.handle_sweep_stale(Utc::now());

        assert_eq!(actor.live_count(), 0);
        assert_eq!(actor.history_count(), 1);
        let record = actor.history.first().unwrap();
        assert_eq!(record.session_id, session.id);
        assert_eq!(record.termination, TerminationReason::Expired);
    }

    #[tokio::test]
    async fn test_sweep_spares_paused_sessions_within_pause_timeout() {
        let (mut actor, _) = create_actor();
        let session = must_create(&mut actor, "learner-1");

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Pause {
            session_id: session.id,
            respond_to: tx,
        });
        rx.try_recv().unwrap().unwrap();

        // Well past the idle timeout, but paused sessions don't heartbeat;
        // only the (much longer) pause timeout applies.
        let idle = actor.policy.idle_timeout() + Duration::seconds(1);
        if let Some(s) = actor.live.get_mut(&OwnerId::new("learner-1")) {
            s.last_activity = s.last_activity - idle;
            if let Some(paused_at) = s.paused_at.as_mut() {
                *paused_at = *paused_at - idle;
            }
        }

        actor.handle_sweep_stale(Utc::now());
        assert_eq!(actor.live_count(), 1);

        // Past the pause timeout the sweep does expire it
        let parked = actor.policy.pause_timeout() + Duration::seconds(1);
        if let Some(s) = actor.live.get_mut(&OwnerId::new("learner-1")) {
            if let Some(paused_at) = s.paused_at.as_mut() {
                *paused_at = *paused_at - parked;
            }
        }

        actor.handle_sweep_stale(Utc::now());
        assert_eq!(actor.live_count(), 0);
        assert_eq!(actor.history_count(), 1);
    }

    #[tokio::test]
    async fn test_history_is_per_owner() {
        let (mut actor, _) = create_actor();

        for owner in ["learner-1", "learner-2"] {
            let session = must_create(&mut actor, owner);
            let (tx, mut rx) = oneshot::channel();
            actor.handle_command(RegistryCommand::Terminate {
                session_id: session.id,
                reason: TerminationReason::Solved,
                respond_to: tx,
            });
            rx.try_recv().unwrap().unwrap();
        }

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::History {
            owner: OwnerId::new("learner-1"),
            respond_to: tx,
        });
        let summaries = rx.try_recv().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries.first().unwrap().owner.as_str(), "learner-1");
    }

    #[tokio::test]
    async fn test_stats() {
        let (mut actor, _) = create_actor();
        must_create(&mut actor, "learner-1");

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(RegistryCommand::Stats { respond_to: tx });
        let stats = rx.try_recv().unwrap();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.history, 0);
    }
}
