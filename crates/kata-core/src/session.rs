//! Session domain entities and value objects.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::analytics::{CodeSnapshot, PracticeCounters};
use crate::error::{DomainError, DomainResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a practice session.
///
/// Minted by the session authority at creation time (UUID v4 string).
/// Clients never generate session ids themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    ///
    /// Note: This does not validate UUID format. The authority mints ids,
    /// so we trust their shape.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of the learner who owns a session.
///
/// Issued by the external identity layer; opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Problem / Course References
// ============================================================================

/// Reference to the problem being attempted.
///
/// The catalog resolving ids to full problem content is external; the
/// title is carried along so recovery summaries can be rendered without
/// a catalog round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemRef {
    /// Catalog identifier of the problem
    pub id: String,
    /// Human-readable problem title
    pub title: String,
}

impl ProblemRef {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

impl fmt::Display for ProblemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.title, self.id)
    }
}

/// Reference to the course a roadmap session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseRef(String);

impl CourseRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CourseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Session Kind
// ============================================================================

/// What kind of practice a session tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// One-off daily challenge problem.
    DailyChallenge,

    /// Problem attempted as part of a course roadmap.
    /// Sessions of this kind must carry a [`CourseRef`].
    RoadmapChallenge,
}

impl SessionKind {
    /// Returns the display label for this kind.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::DailyChallenge => "daily",
            Self::RoadmapChallenge => "roadmap",
        }
    }

    /// Returns true if sessions of this kind require a course reference.
    #[must_use]
    pub fn requires_course(&self) -> bool {
        matches!(self, Self::RoadmapChallenge)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a session.
///
/// `Active` and `Paused` are the live states; everything else is terminal
/// and final. Transitions go through the [`Session`] methods only, which
/// is what keeps the machine monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session is running; the heartbeat is expected to tick.
    Active,

    /// Session is paused by the learner; heartbeat suspended.
    Paused,

    /// Problem solved.
    Completed,

    /// Given up, dismissed during recovery, or superseded.
    Abandoned,

    /// Finalized by the staleness sweep.
    Expired,
}

impl SessionState {
    /// Returns true if no further transition is possible from this state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned | Self::Expired)
    }

    /// Returns true if the session is still in progress (counts against
    /// the one-live-session-per-owner rule).
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    /// Returns the display label for this state.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Termination Reason
// ============================================================================

/// Why a session left the live states.
///
/// Recorded exactly once, when the session is finalized. The reason
/// determines which terminal state the session lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The learner solved the problem.
    Solved,

    /// The learner explicitly gave up.
    UserAbandoned,

    /// The learner declined recovery of this session.
    UserDismissed,

    /// Replaced by a newly created session.
    Superseded,

    /// Finalized by the authority's staleness sweep.
    Expired,
}

impl TerminationReason {
    /// The terminal state a session enters when finalized with this reason.
    #[must_use]
    pub fn terminal_state(&self) -> SessionState {
        match self {
            Self::Solved => SessionState::Completed,
            Self::UserAbandoned | Self::UserDismissed | Self::Superseded => {
                SessionState::Abandoned
            }
            Self::Expired => SessionState::Expired,
        }
    }

    /// Returns the wire/display label for this reason.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Solved => "solved",
            Self::UserAbandoned => "user_abandoned",
            Self::UserDismissed => "user_dismissed",
            Self::Superseded => "superseded",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Session Entity
// ============================================================================

/// The record of one continuous (possibly paused) attempt at a problem.
///
/// The authority owns the canonical copy; clients hold disposable mirrors.
/// All state mutation goes through the transition methods below so the
/// state machine stays monotonic: live states move freely between
/// `Active` and `Paused`, terminal states are never exited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Authority-minted identifier
    pub id: SessionId,

    /// Owning learner
    pub owner: OwnerId,

    /// Daily or roadmap practice
    pub kind: SessionKind,

    /// Problem under attempt
    pub problem: ProblemRef,

    /// Course reference (present for roadmap sessions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course: Option<CourseRef>,

    /// Current lifecycle state
    pub state: SessionState,

    /// Authority-issued creation time; the basis for all elapsed-time math
    pub started_at: DateTime<Utc>,

    /// High-water mark of observed activity; never regresses
    pub last_activity: DateTime<Utc>,

    /// Set exactly while `state == Paused`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,

    /// Milliseconds spent paused across completed pause/resume cycles
    pub paused_ms: u64,

    /// Last flushed code snapshot, stored verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<CodeSnapshot>,

    /// Accumulated practice counters
    pub counters: PracticeCounters,

    /// Set once, on entering a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
}

impl Session {
    /// Creates a new session in `Active` state.
    ///
    /// `started_at` is the authority's clock reading at creation; it
    /// doubles as the initial activity timestamp.
    pub fn new(
        id: SessionId,
        owner: OwnerId,
        kind: SessionKind,
        problem: ProblemRef,
        course: Option<CourseRef>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner,
            kind,
            problem,
            course,
            state: SessionState::Active,
            started_at,
            last_activity: started_at,
            paused_at: None,
            paused_ms: 0,
            snapshot: None,
            counters: PracticeCounters::default(),
            termination: None,
        }
    }

    /// Advances `last_activity` to `at` if it is newer.
    ///
    /// Idempotent and order-tolerant: replaying an older heartbeat after a
    /// newer one has been recorded leaves the high-water mark untouched.
    /// Returns the recorded value.
    pub fn touch(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        if at > self.last_activity {
            self.last_activity = at;
        }
        self.last_activity
    }

    /// Transitions `Active → Paused`, stamping `paused_at`.
    pub fn pause(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.state {
            SessionState::Active => {
                self.state = SessionState::Paused;
                self.paused_at = Some(now);
                self.touch(now);
                Ok(())
            }
            from => Err(self.transition_error(from, SessionState::Paused)),
        }
    }

    /// Transitions `Paused → Active`, folding the pause span into
    /// `paused_ms` and clearing `paused_at`.
    pub fn resume(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.state {
            SessionState::Paused => {
                self.accumulate_pause(now);
                self.state = SessionState::Active;
                self.touch(now);
                Ok(())
            }
            from => Err(self.transition_error(from, SessionState::Active)),
        }
    }

    /// Finalizes the session into the terminal state implied by `reason`.
    ///
    /// Valid from `Active` or `Paused`. A pending pause span is folded in
    /// first so the paused-time accounting stays correct for summaries.
    pub fn finalize(
        &mut self,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let target = reason.terminal_state();
        match self.state {
            SessionState::Active | SessionState::Paused => {
                self.accumulate_pause(now);
                self.state = target;
                self.termination = Some(reason);
                self.touch(now);
                Ok(())
            }
            from => Err(self.transition_error(from, target)),
        }
    }

    /// Applies a flushed analytics batch: counters merge by per-field
    /// maximum (flushes are cumulative, so replays and reordering are
    /// harmless), the snapshot replaces the stored one verbatim, and the
    /// flush counts as activity.
    pub fn record_flush(
        &mut self,
        counters: &PracticeCounters,
        snapshot: Option<CodeSnapshot>,
        at: DateTime<Utc>,
    ) {
        self.counters.merge_max(counters);
        if snapshot.is_some() {
            self.snapshot = snapshot;
        }
        self.touch(at);
    }

    /// Time since the last observed activity (zero if `now` is behind).
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        clamp_non_negative(now.signed_duration_since(self.last_activity))
    }

    /// How long the current pause has lasted. Zero unless paused.
    pub fn paused_for(&self, now: DateTime<Utc>) -> Duration {
        match self.paused_at {
            Some(at) => clamp_non_negative(now.signed_duration_since(at)),
            None => Duration::zero(),
        }
    }

    /// Total time spent paused, including a still-open pause span.
    pub fn total_paused(&self, now: DateTime<Utc>) -> Duration {
        Duration::milliseconds(self.paused_ms as i64) + self.paused_for(now)
    }

    /// Returns true if the session finished in `Completed`.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == SessionState::Completed
    }

    /// Folds an open pause span into `paused_ms` and clears `paused_at`.
    fn accumulate_pause(&mut self, now: DateTime<Utc>) {
        if let Some(at) = self.paused_at.take() {
            let span = clamp_non_negative(now.signed_duration_since(at));
            self.paused_ms = self
                .paused_ms
                .saturating_add(span.num_milliseconds().max(0) as u64);
        }
    }

    fn transition_error(&self, from: SessionState, to: SessionState) -> DomainError {
        if from.is_terminal() {
            DomainError::Terminal {
                session_id: self.id.clone(),
                state: from,
            }
        } else {
            DomainError::InvalidTransition { from, to }
        }
    }
}

fn clamp_non_negative(d: Duration) -> Duration {
    if d < Duration::zero() {
        Duration::zero()
    } else {
        d
    }
}
