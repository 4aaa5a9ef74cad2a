//! Session lifecycle controller.
//!
//! [`SessionManager`] is the one component allowed to request state
//! mutations against the authority. Each UI context constructs its own
//! instance (no ambient global session); views receive it by injection
//! and observe through read-only subscriptions.
//!
//! Every start passes through the recovery negotiator first. On attach,
//! the controller wires up the presence heartbeat and the analytics
//! flush task; on any terminal transition it flushes synchronously,
//! terminates at the authority, and tears both tasks down.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free
//! guidelines. No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`,
//! or `todo!()`.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kata_core::{
    active_elapsed, CodeSnapshot, CourseRef, OwnerId, PracticeEvent, ProblemRef, Session,
    SessionId, SessionKind, SessionState, SessionSummary, StalenessPolicy, TerminationReason,
};

use crate::analytics::{spawn_flush_task, AnalyticsAggregator, LiveStats};
use crate::authority::SessionAuthority;
use crate::error::{ClientError, Result};
use crate::heartbeat::{spawn_heartbeat, HeartbeatHandle, HeartbeatHealth};
use crate::recovery::{Negotiation, RecoveryNegotiator, RecoveryPrompt};
use crate::store::SessionStore;
use crate::{clock_now, SharedClock};

// ============================================================================
// Requests and Outcomes
// ============================================================================

/// What the caller wants to start practicing.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub kind: SessionKind,
    pub problem: ProblemRef,
    pub course: Option<CourseRef>,
}

impl StartRequest {
    /// A daily-challenge start.
    pub fn daily(problem: ProblemRef) -> Self {
        Self {
            kind: SessionKind::DailyChallenge,
            problem,
            course: None,
        }
    }

    /// A roadmap start within a course.
    pub fn roadmap(problem: ProblemRef, course: CourseRef) -> Self {
        Self {
            kind: SessionKind::RoadmapChallenge,
            problem,
            course: Some(course),
        }
    }
}

/// How a start request was satisfied.
#[derive(Debug)]
pub enum StartOutcome {
    /// A fresh session was created for the requested problem.
    Started(Box<Session>),

    /// An existing session was recovered instead. It may be for a
    /// different problem than requested - the caller routes to
    /// whichever view matches its kind/problem/course.
    Recovered(Box<Session>),
}

impl StartOutcome {
    /// The session now current, whichever way it arrived.
    pub fn session(&self) -> &Session {
        match self {
            Self::Started(s) | Self::Recovered(s) => s,
        }
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// Background tasks attached to the current session.
struct CurrentTasks {
    session_id: SessionId,
    heartbeat: HeartbeatHandle,
    flush_cancel: CancellationToken,
}

impl CurrentTasks {
    fn stop(self) {
        self.heartbeat.stop();
        self.flush_cancel.cancel();
    }
}

/// Per-context session lifecycle controller.
///
/// Owns the authority handle, the local store, the analytics
/// aggregator, and the background tasks of the current session. Clone
/// the watch receivers for read-only observation; all mutation goes
/// through the methods here.
pub struct SessionManager {
    owner: OwnerId,
    authority: Arc<dyn SessionAuthority>,
    negotiator: RecoveryNegotiator,
    policy: StalenessPolicy,
    clock: SharedClock,
    store: SessionStore,
    aggregator: AnalyticsAggregator,
    stats_tx: watch::Sender<LiveStats>,
    health_tx: watch::Sender<HeartbeatHealth>,
    current: Mutex<Option<CurrentTasks>>,
}

impl SessionManager {
    /// Creates a controller for one owner in one UI context.
    ///
    /// The clock is shared with the [`AuthorityClient`] so authority
    /// timestamps keep it anchored.
    ///
    /// [`AuthorityClient`]: crate::authority::AuthorityClient
    pub fn new(
        owner: OwnerId,
        authority: Arc<dyn SessionAuthority>,
        prompt: Arc<dyn RecoveryPrompt>,
        policy: StalenessPolicy,
        clock: SharedClock,
    ) -> Self {
        let negotiator =
            RecoveryNegotiator::new(Arc::clone(&authority), prompt, clock.clone());
        let (stats_tx, _) = watch::channel(LiveStats::default());
        let (health_tx, _) = watch::channel(HeartbeatHealth::Ok);

        Self {
            owner,
            authority,
            negotiator,
            policy,
            clock,
            store: SessionStore::new(),
            aggregator: AnalyticsAggregator::new(),
            stats_tx,
            health_tx,
            current: Mutex::new(None),
        }
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Starts practicing, recovering a pre-existing session if one is
    /// live. This is the only entry point for session starts.
    ///
    /// A conflict from `create` is never surfaced raw: it re-enters
    /// negotiation once (the advisory query can lose a race that the
    /// authority's serialized create then reports), and only a second
    /// consecutive loss propagates as [`ClientError::Conflict`].
    pub async fn start_or_recover(&self, request: StartRequest) -> Result<StartOutcome> {
        for attempt in 0..2 {
            match self
                .negotiator
                .negotiate(&self.owner, &request.problem.id)
                .await?
            {
                Negotiation::Recovered(session) => {
                    self.attach(*session.clone()).await;
                    return Ok(StartOutcome::Recovered(session));
                }
                Negotiation::ProceedToCreate | Negotiation::DismissedExisting => {}
            }

            match self
                .authority
                .create(
                    &self.owner,
                    request.kind,
                    request.problem.clone(),
                    request.course.clone(),
                )
                .await
            {
                Ok(session) => {
                    info!(
                        session_id = %session.id,
                        problem = %session.problem.id,
                        "Session started"
                    );
                    self.attach(session.clone()).await;
                    return Ok(StartOutcome::Started(Box::new(session)));
                }
                Err(ClientError::Conflict { existing }) if attempt == 0 => {
                    // Lost a create race after a clean query. When the
                    // authority sent the winning session along, resolve
                    // against it directly; otherwise loop and requery.
                    warn!(owner = %self.owner, "Create lost a race, renegotiating");
                    if let Some(existing) = existing {
                        match self
                            .negotiator
                            .resolve(&self.owner, *existing, &request.problem.id)
                            .await?
                        {
                            Negotiation::Recovered(session) => {
                                self.attach(*session.clone()).await;
                                return Ok(StartOutcome::Recovered(session));
                            }
                            Negotiation::ProceedToCreate
                            | Negotiation::DismissedExisting => continue,
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClientError::Conflict { existing: None })
    }

    /// Re-attaches to the owner's live session without the recovery
    /// prompt, for flows that already know they want to continue (an
    /// in-app navigation back to the problem view, a CLI invocation
    /// operating on "the current session"). Returns `None` when the
    /// owner has nothing live.
    pub async fn attach_active(&self) -> Result<Option<Session>> {
        match self.authority.query_active(&self.owner).await? {
            Some(session) => {
                self.attach(session.clone()).await;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Flushes accumulated analytics to the authority immediately.
    pub async fn flush_now(&self) -> Result<()> {
        let id = self.current_session_id().await?;
        match self.aggregator.flush_now(&self.authority, &id).await {
            Ok(()) => Ok(()),
            Err(e) => self.fail_mutation(e).await,
        }
    }

    /// Pauses the current session and suspends its heartbeat.
    pub async fn pause_current(&self) -> Result<Session> {
        let id = self.current_session_id().await?;

        match self.authority.pause(&id).await {
            Ok(session) => {
                self.store.update(Some(session.clone()));
                if let Some(tasks) = self.current.lock().await.as_ref() {
                    tasks.heartbeat.suspend().await;
                }
                info!(session_id = %id, "Session paused");
                Ok(session)
            }
            Err(e) => self.fail_mutation(e).await,
        }
    }

    /// Resumes the current (paused) session and its heartbeat.
    pub async fn resume_current(&self) -> Result<Session> {
        let id = self.current_session_id().await?;

        match self.authority.resume(&id).await {
            Ok(session) => {
                self.store.update(Some(session.clone()));
                if let Some(tasks) = self.current.lock().await.as_ref() {
                    tasks.heartbeat.resume().await;
                }
                info!(session_id = %id, "Session resumed");
                Ok(session)
            }
            Err(e) => self.fail_mutation(e).await,
        }
    }

    /// Completes the current session as solved.
    ///
    /// The final code snapshot, if provided, rides along with the
    /// synchronous terminal flush, so history and recovery queries see
    /// exactly what the learner last wrote.
    pub async fn complete_current(
        &self,
        final_snapshot: Option<CodeSnapshot>,
    ) -> Result<SessionSummary> {
        self.finish(TerminationReason::Solved, final_snapshot).await
    }

    /// Abandons the current session with a caller-supplied reason.
    ///
    /// Only the user-driven reasons are accepted; `Solved` goes through
    /// [`complete_current`](Self::complete_current) and `Expired` is the
    /// authority sweep's verdict alone.
    pub async fn abandon_current(&self, reason: TerminationReason) -> Result<SessionSummary> {
        match reason {
            TerminationReason::UserAbandoned
            | TerminationReason::UserDismissed
            | TerminationReason::Superseded => self.finish(reason, None).await,
            other => Err(ClientError::Invalid(format!(
                "abandon cannot use reason {other}"
            ))),
        }
    }

    /// Shared finalization path: synchronous flush, then terminate,
    /// then tear down tasks.
    async fn finish(
        &self,
        reason: TerminationReason,
        final_snapshot: Option<CodeSnapshot>,
    ) -> Result<SessionSummary> {
        let id = self.current_session_id().await?;

        if let Some(snapshot) = final_snapshot {
            self.aggregator
                .update_snapshot(snapshot.code, snapshot.language);
        }

        // Always flush before the terminal transition so the history
        // record carries the final counters. A transient failure is
        // logged but does not block termination.
        if let Err(e) = self.aggregator.flush_now(&self.authority, &id).await {
            if e.is_session_gone() {
                return self.fail_mutation(e).await;
            }
            warn!(session_id = %id, error = %e, "Final analytics flush failed");
        }

        match self.authority.terminate(&id, reason).await {
            Ok(summary) => {
                info!(
                    session_id = %id,
                    reason = %reason,
                    active_secs = summary.active_secs,
                    "Session finalized"
                );
                self.drop_current().await;
                Ok(summary)
            }
            Err(e) => self.fail_mutation(e).await,
        }
    }

    /// Classifies a failed mutation. A vanished session drops the local
    /// handle so the caller can offer a fresh start; anything else
    /// propagates untouched. Mutations are never blindly retried.
    async fn fail_mutation<T>(&self, e: ClientError) -> Result<T> {
        if e.is_session_gone() {
            warn!(owner = %self.owner, "Current session is gone; dropping local handle");
            self.drop_current().await;
            return Err(ClientError::SessionGone);
        }
        Err(e)
    }

    // ========================================================================
    // Read-only surface
    // ========================================================================

    /// Records a practice event and republishes live stats.
    pub fn record_event(&self, event: PracticeEvent) {
        self.aggregator.record(event);
        self.publish_stats();
    }

    /// Opportunistically updates the code snapshot (not per keystroke).
    pub fn update_snapshot(&self, code: impl Into<String>, language: impl Into<String>) {
        self.aggregator.update_snapshot(code, language);
    }

    /// Skew-immune active elapsed time of the current session.
    ///
    /// Computed from the authority-issued start time and the reconciled
    /// clock, never from a local incrementing counter - a context that
    /// slept and woke shows the same answer as one that never did.
    pub fn elapsed(&self) -> Option<ChronoDuration> {
        let session = self.store.hint()?;
        Some(active_elapsed(&session, clock_now(&self.clock)))
    }

    /// Last known session record (a hint, not the truth).
    pub fn session_hint(&self) -> Option<Session> {
        self.store.hint()
    }

    /// Subscribe to session record updates.
    pub fn subscribe_session(&self) -> watch::Receiver<Option<Session>> {
        self.store.subscribe()
    }

    /// Subscribe to live elapsed/metrics updates.
    pub fn subscribe_stats(&self) -> watch::Receiver<LiveStats> {
        self.stats_tx.subscribe()
    }

    /// Subscribe to heartbeat/connection health.
    pub fn subscribe_health(&self) -> watch::Receiver<HeartbeatHealth> {
        self.health_tx.subscribe()
    }

    /// Asks the authority for this owner's live session on one problem.
    pub async fn active_for_problem(&self, problem_id: &str) -> Result<Option<Session>> {
        self.authority
            .query_active_for_problem(&self.owner, problem_id)
            .await
    }

    /// This owner's finalized-session history.
    pub async fn history(&self) -> Result<Vec<SessionSummary>> {
        self.authority.history(&self.owner).await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Wires up a session that just started or was recovered: seeds the
    /// aggregator, mirrors the record, and spawns heartbeat and flush
    /// tasks (heartbeat suspended when the session arrived paused).
    async fn attach(&self, session: Session) {
        let mut current = self.current.lock().await;
        if let Some(tasks) = current.take() {
            tasks.stop();
        }

        self.aggregator.reset();
        self.aggregator
            .seed(session.counters, session.snapshot.clone());
        self.store.update(Some(session.clone()));

        let suspended = session.state == SessionState::Paused;
        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.authority),
            session.id.clone(),
            self.clock.clone(),
            self.policy.heartbeat_interval(),
            suspended,
            self.health_tx.clone(),
        );

        let flush_cancel = CancellationToken::new();
        let session_rx = self.store.subscribe();
        let clock = self.clock.clone();
        spawn_flush_task(
            Arc::clone(&self.authority),
            session.id.clone(),
            self.aggregator.clone(),
            move || {
                session_rx
                    .borrow()
                    .as_ref()
                    .map(|s| active_elapsed(s, clock_now(&clock)))
                    .unwrap_or_else(ChronoDuration::zero)
            },
            self.policy.flush_interval(),
            self.stats_tx.clone(),
            flush_cancel.clone(),
        );

        *current = Some(CurrentTasks {
            session_id: session.id,
            heartbeat,
            flush_cancel,
        });

        self.publish_stats();
    }

    /// Tears down the current session's tasks and clears the mirror.
    async fn drop_current(&self) {
        let mut current = self.current.lock().await;
        if let Some(tasks) = current.take() {
            tasks.stop();
        }
        self.store.clear();
    }

    /// The id of the current session, or `NoCurrentSession`.
    async fn current_session_id(&self) -> Result<SessionId> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|tasks| tasks.session_id.clone())
            .ok_or(ClientError::NoCurrentSession)
    }

    /// Recomputes and publishes live stats right now.
    fn publish_stats(&self) {
        let elapsed = self.elapsed().unwrap_or_else(ChronoDuration::zero);
        let stats = LiveStats::compute(&self.aggregator.counters(), elapsed);
        let _ = self.stats_tx.send(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{RecoveryChoice, RecoverySummary};
    use crate::shared_clock;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use kata_core::PracticeCounters;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    /// In-memory authority with full single-owner semantics.
    #[derive(Default)]
    struct MemoryAuthority {
        live: StdMutex<HashMap<String, Session>>,
        history: StdMutex<Vec<SessionSummary>>,
        next_id: AtomicU64,
    }

    impl MemoryAuthority {
        fn find_mut<'a>(
            live: &'a mut HashMap<String, Session>,
            session_id: &SessionId,
        ) -> Option<&'a mut Session> {
            live.values_mut().find(|s| &s.id == session_id)
        }
    }

    #[async_trait]
    impl SessionAuthority for MemoryAuthority {
        async fn query_active(&self, owner: &OwnerId) -> Result<Option<Session>> {
            Ok(self
                .live
                .lock()
                .map(|l| l.get(owner.as_str()).cloned())
                .unwrap_or(None))
        }

        async fn query_active_for_problem(
            &self,
            owner: &OwnerId,
            problem_id: &str,
        ) -> Result<Option<Session>> {
            Ok(self
                .query_active(owner)
                .await?
                .filter(|s| s.problem.id == problem_id))
        }

        async fn create(
            &self,
            owner: &OwnerId,
            kind: SessionKind,
            problem: ProblemRef,
            course: Option<CourseRef>,
        ) -> Result<Session> {
            let mut live = self
                .live
                .lock()
                .map_err(|_| ClientError::Authority("lock".into()))?;

            if let Some(existing) = live.get(owner.as_str()) {
                return Err(ClientError::Conflict {
                    existing: Some(Box::new(existing.clone())),
                });
            }

            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let session = Session::new(
                SessionId::new(format!("mem-{n}")),
                owner.clone(),
                kind,
                problem,
                course,
                Utc::now(),
            );
            live.insert(owner.as_str().to_string(), session.clone());
            Ok(session)
        }

        async fn heartbeat(
            &self,
            session_id: &SessionId,
            at: DateTime<Utc>,
        ) -> Result<DateTime<Utc>> {
            let mut live = self
                .live
                .lock()
                .map_err(|_| ClientError::Authority("lock".into()))?;
            match Self::find_mut(&mut live, session_id) {
                Some(session) => Ok(session.touch(at)),
                None => Err(ClientError::SessionGone),
            }
        }

        async fn pause(&self, session_id: &SessionId) -> Result<Session> {
            let mut live = self
                .live
                .lock()
                .map_err(|_| ClientError::Authority("lock".into()))?;
            match Self::find_mut(&mut live, session_id) {
                Some(session) => {
                    session
                        .pause(Utc::now())
                        .map_err(|e| ClientError::Invalid(e.to_string()))?;
                    Ok(session.clone())
                }
                None => Err(ClientError::SessionGone),
            }
        }

        async fn resume(&self, session_id: &SessionId) -> Result<Session> {
            let mut live = self
                .live
                .lock()
                .map_err(|_| ClientError::Authority("lock".into()))?;
            match Self::find_mut(&mut live, session_id) {
                Some(session) => {
                    session
                        .resume(Utc::now())
                        .map_err(|e| ClientError::Invalid(e.to_string()))?;
                    Ok(session.clone())
                }
                None => Err(ClientError::SessionGone),
            }
        }

        async fn flush(
            &self,
            session_id: &SessionId,
            counters: PracticeCounters,
            snapshot: Option<CodeSnapshot>,
        ) -> Result<DateTime<Utc>> {
            let mut live = self
                .live
                .lock()
                .map_err(|_| ClientError::Authority("lock".into()))?;
            match Self::find_mut(&mut live, session_id) {
                Some(session) => {
                    session.record_flush(&counters, snapshot, Utc::now());
                    Ok(session.last_activity)
                }
                None => Err(ClientError::SessionGone),
            }
        }

        async fn terminate(
            &self,
            session_id: &SessionId,
            reason: TerminationReason,
        ) -> Result<SessionSummary> {
            let mut live = self
                .live
                .lock()
                .map_err(|_| ClientError::Authority("lock".into()))?;

            let owner_key = live
                .iter()
                .find(|(_, s)| &s.id == session_id)
                .map(|(k, _)| k.clone());

            match owner_key {
                Some(key) => {
                    let mut session = match live.remove(&key) {
                        Some(s) => s,
                        None => return Err(ClientError::SessionGone),
                    };
                    session
                        .finalize(reason, Utc::now())
                        .map_err(|e| ClientError::Invalid(e.to_string()))?;
                    let summary = SessionSummary::from_session(&session, Utc::now());
                    if let Ok(mut history) = self.history.lock() {
                        history.push(summary.clone());
                    }
                    Ok(summary)
                }
                None => Err(ClientError::SessionGone),
            }
        }

        async fn history(&self, owner: &OwnerId) -> Result<Vec<SessionSummary>> {
            Ok(self
                .history
                .lock()
                .map(|h| h.iter().filter(|s| &s.owner == owner).cloned().collect())
                .unwrap_or_default())
        }
    }

    /// Prompt answering a fixed choice.
    struct FixedPrompt(RecoveryChoice);

    #[async_trait]
    impl RecoveryPrompt for FixedPrompt {
        async fn decide(&self, _summary: &RecoverySummary) -> RecoveryChoice {
            self.0
        }
    }

    fn manager(
        authority: Arc<MemoryAuthority>,
        choice: RecoveryChoice,
    ) -> SessionManager {
        SessionManager::new(
            OwnerId::new("learner-1"),
            authority,
            Arc::new(FixedPrompt(choice)),
            StalenessPolicy::default(),
            shared_clock(Utc::now()),
        )
    }

    fn daily_request(problem_id: &str) -> StartRequest {
        StartRequest::daily(ProblemRef::new(problem_id, "A Problem"))
    }

    #[tokio::test]
    async fn test_start_fresh() {
        let authority = Arc::new(MemoryAuthority::default());
        let manager = manager(Arc::clone(&authority), RecoveryChoice::Recover);

        let outcome = manager
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();

        assert!(matches!(outcome, StartOutcome::Started(_)));
        assert_eq!(outcome.session().state, SessionState::Active);
        assert!(manager.session_hint().is_some());
        assert!(manager.elapsed().is_some());
    }

    #[tokio::test]
    async fn test_second_start_recovers_existing() {
        let authority = Arc::new(MemoryAuthority::default());

        // Context 1 starts problem X
        let first = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        first
            .start_or_recover(daily_request("problem-x"))
            .await
            .unwrap();

        // Context 2 tries problem Y for the same owner: it must surface
        // context 1's session rather than create a second one.
        let second = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        let outcome = second
            .start_or_recover(daily_request("problem-y"))
            .await
            .unwrap();

        match outcome {
            StartOutcome::Recovered(session) => {
                assert_eq!(session.problem.id, "problem-x");
            }
            other => panic!("Expected Recovered, got {other:?}"),
        }

        // Still exactly one live session
        assert_eq!(authority.live.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dismiss_replaces_session() {
        let authority = Arc::new(MemoryAuthority::default());

        let first = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        first
            .start_or_recover(daily_request("problem-x"))
            .await
            .unwrap();

        let second = manager(Arc::clone(&authority), RecoveryChoice::Dismiss);
        let outcome = second
            .start_or_recover(daily_request("problem-y"))
            .await
            .unwrap();

        // A brand-new session for the requested problem...
        match outcome {
            StartOutcome::Started(session) => {
                assert_eq!(session.problem.id, "problem-y");
            }
            other => panic!("Expected Started, got {other:?}"),
        }

        // ...and the old one went to history as user-dismissed
        let history = authority.history.lock().unwrap();
        assert_eq!(history.len(), 1);
        let old = history.first().unwrap();
        assert_eq!(old.termination, TerminationReason::UserDismissed);
        assert_eq!(old.problem.id, "problem-x");
        assert!(!old.is_completed);
    }

    #[tokio::test]
    async fn test_pause_resume_roundtrip() {
        let authority = Arc::new(MemoryAuthority::default());
        let manager = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        manager
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();

        let paused = manager.pause_current().await.unwrap();
        assert_eq!(paused.state, SessionState::Paused);
        assert_eq!(
            manager.session_hint().unwrap().state,
            SessionState::Paused
        );

        let resumed = manager.resume_current().await.unwrap();
        assert_eq!(resumed.state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_complete_flushes_and_finalizes() {
        let authority = Arc::new(MemoryAuthority::default());
        let manager = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        manager
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();

        manager.record_event(PracticeEvent::CodeChange);
        manager.record_event(PracticeEvent::AnswerSubmitted { correct: true });

        let summary = manager
            .complete_current(Some(CodeSnapshot::new("fn solve() {}", "rust")))
            .await
            .unwrap();

        assert!(summary.is_completed);
        assert_eq!(summary.termination, TerminationReason::Solved);
        // The terminal flush delivered the counters before termination
        assert_eq!(summary.counters.code_changes, 1);
        assert_eq!(summary.counters.attempts, 1);

        // The local handle is gone
        assert!(manager.session_hint().is_none());
        assert!(matches!(
            manager.pause_current().await,
            Err(ClientError::NoCurrentSession)
        ));
    }

    #[tokio::test]
    async fn test_double_complete_is_not_double_recorded() {
        let authority = Arc::new(MemoryAuthority::default());
        let manager = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        manager
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();

        manager.complete_current(None).await.unwrap();
        let second = manager.complete_current(None).await;

        // Second submit finds no current session; nothing double-recorded
        assert!(matches!(second, Err(ClientError::NoCurrentSession)));
        assert_eq!(authority.history.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_rejects_solved_reason() {
        let authority = Arc::new(MemoryAuthority::default());
        let manager = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        manager
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();

        let result = manager.abandon_current(TerminationReason::Solved).await;
        assert!(matches!(result, Err(ClientError::Invalid(_))));

        let summary = manager
            .abandon_current(TerminationReason::UserAbandoned)
            .await
            .unwrap();
        assert_eq!(summary.termination, TerminationReason::UserAbandoned);
    }

    #[tokio::test]
    async fn test_vanished_session_drops_handle() {
        let authority = Arc::new(MemoryAuthority::default());
        let manager = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        manager
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();

        // The authority loses the session out from under us (sweep or
        // superseding context)
        authority.live.lock().unwrap().clear();

        let result = manager.pause_current().await;
        assert!(matches!(result, Err(ClientError::SessionGone)));
        assert!(manager.session_hint().is_none());

        // A fresh start works afterwards
        let outcome = manager
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Started(_)));
    }

    #[tokio::test]
    async fn test_recovered_session_seeds_analytics() {
        let authority = Arc::new(MemoryAuthority::default());

        let first = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        first
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();
        first.record_event(PracticeEvent::TestRun);
        first.record_event(PracticeEvent::TestRun);
        // Push the counters to the authority before "the tab dies"
        let id = first.session_hint().unwrap().id;
        first
            .aggregator
            .flush_now(&first.authority, &id)
            .await
            .unwrap();

        let second = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        second
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();

        // Accumulation continues where the previous context left off
        assert_eq!(second.aggregator.counters().test_runs, 2);
    }

    #[tokio::test]
    async fn test_record_event_updates_live_stats() {
        let authority = Arc::new(MemoryAuthority::default());
        let manager = manager(Arc::clone(&authority), RecoveryChoice::Recover);
        manager
            .start_or_recover(daily_request("two-sum"))
            .await
            .unwrap();

        let stats_rx = manager.subscribe_stats();
        manager.record_event(PracticeEvent::AnswerSubmitted { correct: true });

        let stats = *stats_rx.borrow();
        assert!((stats.metrics.accuracy - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_no_current_session_errors() {
        let authority = Arc::new(MemoryAuthority::default());
        let manager = manager(authority, RecoveryChoice::Recover);

        assert!(matches!(
            manager.pause_current().await,
            Err(ClientError::NoCurrentSession)
        ));
        assert!(matches!(
            manager.resume_current().await,
            Err(ClientError::NoCurrentSession)
        ));
        assert!(matches!(
            manager.complete_current(None).await,
            Err(ClientError::NoCurrentSession)
        ));
        assert!(manager.elapsed().is_none());
    }
}
