//! Recovery negotiation.
//!
//! Runs before any session create. If the authority already holds a live
//! session for the owner, the negotiator assembles a recovery summary
//! and puts the decision to the caller's [`RecoveryPrompt`]; session
//! starting is blocked until the prompt resolves. The negotiator never
//! lets a second session start alongside an unresolved one - but if the
//! recovery *query itself* fails (network down), it fails open toward a
//! fresh create, logging the ambiguity, because the authority still
//! arbitrates and blocking the learner indefinitely is worse.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, info, warn};

use kata_core::{CodeSnapshot, OwnerId, PracticeCounters, Session, SessionState};

use crate::authority::SessionAuthority;
use crate::error::{ClientError, Result};
use crate::{clock_now, SharedClock};

// ============================================================================
// Prompt Interface
// ============================================================================

/// The learner's answer to a recovery prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    /// Return to the existing session (resuming it if paused).
    Recover,

    /// Discard the existing session and start the requested one.
    Dismiss,
}

/// The UI collaborator that puts the recover-or-discard decision to the
/// learner. How long the prompt may stay open is the implementor's
/// policy; the negotiator simply awaits the answer.
#[async_trait]
pub trait RecoveryPrompt: Send + Sync {
    async fn decide(&self, summary: &RecoverySummary) -> RecoveryChoice;
}

/// Everything a prompt needs to render the decision.
#[derive(Debug, Clone)]
pub struct RecoverySummary {
    /// The live session that would conflict with the new start
    pub session: Session,

    /// Time since the session's last recorded activity, computed
    /// against the reconciled authority clock
    pub idle_for: Duration,

    /// Analytics accumulated so far
    pub counters: PracticeCounters,

    /// Last flushed code, if any
    pub snapshot: Option<CodeSnapshot>,

    /// Whether the session was paused when found
    pub was_paused: bool,

    /// False when the live session is for a different problem than the
    /// one now requested. Recovery is still offered - sessions are
    /// global per owner - the caller decides whether to navigate back
    /// or discard.
    pub matches_requested_problem: bool,
}

// ============================================================================
// Negotiator
// ============================================================================

/// Outcome of a negotiation pass.
#[derive(Debug)]
pub enum Negotiation {
    /// No live session found (or query failed open); proceed to create.
    ProceedToCreate,

    /// The learner chose to return to the existing session. It has
    /// already been resumed if it was paused.
    Recovered(Box<Session>),

    /// The learner dismissed the existing session; it has been
    /// terminated. Proceed to create the requested one.
    DismissedExisting,
}

/// Drives the recover-or-discard flow against the authority.
pub struct RecoveryNegotiator {
    authority: Arc<dyn SessionAuthority>,
    prompt: Arc<dyn RecoveryPrompt>,
    clock: SharedClock,
}

impl RecoveryNegotiator {
    pub fn new(
        authority: Arc<dyn SessionAuthority>,
        prompt: Arc<dyn RecoveryPrompt>,
        clock: SharedClock,
    ) -> Self {
        Self {
            authority,
            prompt,
            clock,
        }
    }

    /// Runs one negotiation pass for `owner`, who is about to start
    /// `requested_problem_id`.
    ///
    /// The query is global: a live session for a *different* problem
    /// still blocks the start and still gets a recovery offer.
    pub async fn negotiate(
        &self,
        owner: &OwnerId,
        requested_problem_id: &str,
    ) -> Result<Negotiation> {
        let existing = match self.authority.query_active(owner).await {
            Ok(existing) => existing,
            Err(e) if e.is_retryable() => {
                // Fail open: the create below is still arbitrated by the
                // authority, so the worst case is an immediate conflict
                // rather than a stuck learner. Log for reconciliation.
                warn!(
                    owner = %owner,
                    error = %e,
                    "Recovery query failed; proceeding to create and \
                     leaving duplicate reconciliation to the authority"
                );
                return Ok(Negotiation::ProceedToCreate);
            }
            Err(e) => return Err(e),
        };

        let Some(session) = existing else {
            debug!(owner = %owner, "No live session, no recovery needed");
            return Ok(Negotiation::ProceedToCreate);
        };

        self.resolve(owner, session, requested_problem_id).await
    }

    /// Puts a found session to the prompt and executes the choice.
    ///
    /// Also the entry point when a `create` loses its race: the conflict
    /// carries the winning session, which lands here directly.
    pub async fn resolve(
        &self,
        owner: &OwnerId,
        session: Session,
        requested_problem_id: &str,
    ) -> Result<Negotiation> {
        let summary = self.summarize(session, requested_problem_id);

        info!(
            owner = %owner,
            session_id = %summary.session.id,
            problem = %summary.session.problem.id,
            idle_secs = summary.idle_for.num_seconds(),
            was_paused = summary.was_paused,
            same_problem = summary.matches_requested_problem,
            "Offering session recovery"
        );

        // Block further session-starting until the prompt resolves.
        let choice = self.prompt.decide(&summary).await;

        match choice {
            RecoveryChoice::Recover => {
                let session = if summary.was_paused {
                    match self.authority.resume(&summary.session.id).await {
                        Ok(session) => session,
                        Err(ClientError::SessionGone) => {
                            // Vanished between query and resume (swept or
                            // superseded); nothing left to recover.
                            info!(
                                session_id = %summary.session.id,
                                "Session vanished before recovery completed"
                            );
                            return Ok(Negotiation::ProceedToCreate);
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    summary.session.clone()
                };

                info!(session_id = %session.id, "Session recovered");
                Ok(Negotiation::Recovered(Box::new(session)))
            }

            RecoveryChoice::Dismiss => {
                match self
                    .authority
                    .terminate(
                        &summary.session.id,
                        kata_core::TerminationReason::UserDismissed,
                    )
                    .await
                {
                    Ok(_) | Err(ClientError::SessionGone) => {
                        // Gone either way; the new create follows strictly
                        // after this point, never concurrently.
                        info!(
                            session_id = %summary.session.id,
                            "Existing session dismissed"
                        );
                        Ok(Negotiation::DismissedExisting)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Assembles the recovery summary for a found session.
    fn summarize(&self, session: Session, requested_problem_id: &str) -> RecoverySummary {
        let now = clock_now(&self.clock);
        RecoverySummary {
            idle_for: session.idle_for(now),
            counters: session.counters,
            snapshot: session.snapshot.clone(),
            was_paused: session.state == SessionState::Paused,
            matches_requested_problem: session.problem.id == requested_problem_id,
            session,
        }
    }
}
