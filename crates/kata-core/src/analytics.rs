//! Practice analytics: raw counters, discrete events, and derived metrics.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::{
    CourseRef, OwnerId, ProblemRef, Session, SessionId, SessionKind, TerminationReason,
};

// ============================================================================
// Events and Counters
// ============================================================================

/// A discrete practice event observed in the editor context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PracticeEvent {
    /// The learner edited their code (debounced upstream, not per keystroke).
    CodeChange,

    /// The learner ran the problem's tests.
    TestRun,

    /// The learner revealed a hint.
    HintUsed,

    /// The learner submitted an answer for judging.
    AnswerSubmitted {
        /// Whether the external judge accepted it
        correct: bool,
    },
}

/// Raw, monotonically increasing counters for one session.
///
/// Counters only ever grow, so two copies can be reconciled by taking the
/// per-field maximum. That makes analytics flushes safe to retry or to
/// arrive out of order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PracticeCounters {
    /// Code edit events
    pub code_changes: u64,
    /// Test run events
    pub test_runs: u64,
    /// Hints revealed
    pub hints_used: u64,
    /// Answers submitted
    pub attempts: u64,
    /// Submitted answers the judge accepted
    pub correct_attempts: u64,
}

impl PracticeCounters {
    /// Applies one event to the counters.
    pub fn record(&mut self, event: PracticeEvent) {
        match event {
            PracticeEvent::CodeChange => self.code_changes += 1,
            PracticeEvent::TestRun => self.test_runs += 1,
            PracticeEvent::HintUsed => self.hints_used += 1,
            PracticeEvent::AnswerSubmitted { correct } => {
                self.attempts += 1;
                if correct {
                    self.correct_attempts += 1;
                }
            }
        }
    }

    /// Reconciles with another copy by keeping the larger of each field.
    pub fn merge_max(&mut self, other: &Self) {
        self.code_changes = self.code_changes.max(other.code_changes);
        self.test_runs = self.test_runs.max(other.test_runs);
        self.hints_used = self.hints_used.max(other.hints_used);
        self.attempts = self.attempts.max(other.attempts);
        self.correct_attempts = self.correct_attempts.max(other.correct_attempts);
    }

    /// Returns true if nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Total events across all counters, for quick summaries.
    pub fn total_events(&self) -> u64 {
        self.code_changes + self.test_runs + self.hints_used + self.attempts
    }
}

impl fmt::Display for PracticeCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} edits, {} runs, {} hints, {}/{} attempts",
            self.code_changes, self.test_runs, self.hints_used, self.correct_attempts,
            self.attempts
        )
    }
}

// ============================================================================
// Code Snapshot
// ============================================================================

/// Last known code text with its declared language.
///
/// Updated opportunistically by flushes, never per keystroke. The text is
/// stored and returned verbatim so a recovery can restore exactly what
/// the learner last saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnapshot {
    /// Code text, byte-for-byte
    pub code: String,
    /// Declared language of the code
    pub language: String,
}

impl CodeSnapshot {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
        }
    }

    /// Size of the snapshot text in bytes.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

// ============================================================================
// Derived Metrics
// ============================================================================

/// Presentation metrics recomputed deterministically from the raw counters.
///
/// These carry no invariant of their own; they exist so every display
/// surface derives the same numbers from the same inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    /// Accepted / submitted attempts, in [0, 1]. Zero before any attempt.
    pub accuracy: f64,

    /// Mean active seconds per submitted attempt, if any were made
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_attempt_secs: Option<f64>,

    /// Weighted score in [0, 100]: accuracy scaled down by hint usage
    pub estimated_score: f64,
}

/// Score points deducted per hint revealed.
const HINT_PENALTY: f64 = 5.0;

impl DerivedMetrics {
    /// Computes metrics from raw counters and the session's active elapsed
    /// time (paused spans already excluded by the caller).
    pub fn compute(counters: &PracticeCounters, active_elapsed: Duration) -> Self {
        let accuracy = if counters.attempts == 0 {
            0.0
        } else {
            counters.correct_attempts as f64 / counters.attempts as f64
        };

        let avg_attempt_secs = if counters.attempts == 0 {
            None
        } else {
            let secs = active_elapsed.num_milliseconds().max(0) as f64 / 1000.0;
            Some(secs / counters.attempts as f64)
        };

        let estimated_score =
            (accuracy * 100.0 - HINT_PENALTY * counters.hints_used as f64).clamp(0.0, 100.0);

        Self {
            accuracy,
            avg_attempt_secs,
            estimated_score,
        }
    }
}

// ============================================================================
// Session Summary (history record)
// ============================================================================

/// Immutable record appended to session history when a session finalizes.
///
/// History is an append-only log separate from the live session record;
/// aggregate reporting over it (streaks, completion-rate trends) lives
/// outside this system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Identity of the finalized session
    pub session_id: SessionId,

    /// Owning learner
    pub owner: OwnerId,

    /// Daily or roadmap practice
    pub kind: SessionKind,

    /// Problem that was attempted
    pub problem: ProblemRef,

    /// Course reference for roadmap sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course: Option<CourseRef>,

    /// When the session was created
    pub started_at: DateTime<Utc>,

    /// When the session was finalized
    pub finished_at: DateTime<Utc>,

    /// Active seconds (wall time minus paused time)
    pub active_secs: i64,

    /// Final raw counters
    pub counters: PracticeCounters,

    /// Metrics derived from the final counters
    pub metrics: DerivedMetrics,

    /// Why the session ended
    pub termination: TerminationReason,

    /// True exactly when the session finished `Completed`
    pub is_completed: bool,
}

impl SessionSummary {
    /// Builds the history record for a session that has just finalized.
    ///
    /// Expects `session.termination` to be set; falls back to
    /// `UserAbandoned` if a caller ever finalizes without one.
    pub fn from_session(session: &Session, finished_at: DateTime<Utc>) -> Self {
        let termination = session
            .termination
            .unwrap_or(TerminationReason::UserAbandoned);
        let active = crate::clock::active_elapsed(session, finished_at);

        Self {
            session_id: session.id.clone(),
            owner: session.owner.clone(),
            kind: session.kind,
            problem: session.problem.clone(),
            course: session.course.clone(),
            started_at: session.started_at,
            finished_at,
            active_secs: active.num_seconds(),
            counters: session.counters,
            metrics: DerivedMetrics::compute(&session.counters, active),
            termination,
            is_completed: session.is_completed(),
        }
    }
}
