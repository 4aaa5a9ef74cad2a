//! Clock reconciliation for skew-immune elapsed time.
//!
//! A client's wall clock may disagree with the authority's by minutes.
//! Elapsed time is therefore derived from the authority-issued
//! `started_at` plus a locally measured monotonic delta, never from a
//! client-side incrementing counter. A tab that slept and regained focus
//! recomputes the same answer as one that ticked the whole time.

use chrono::{DateTime, Duration, Utc};
use std::time::Instant;

use crate::session::Session;

/// Active elapsed time for a session at a given instant: wall time since
/// `started_at` minus every paused span (including one still open).
///
/// Pure over its inputs so callers can evaluate it with synthetic clocks.
pub fn active_elapsed(session: &Session, now: DateTime<Utc>) -> Duration {
    let wall = now.signed_duration_since(session.started_at);
    let elapsed = wall - session.total_paused(now);
    if elapsed < Duration::zero() {
        Duration::zero()
    } else {
        elapsed
    }
}

/// Translates authority time into the present using a monotonic anchor.
///
/// Constructed from an authority-issued timestamp (typically the create
/// or query response); `now()` then advances it by `Instant` deltas, so
/// the result is immune to local wall-clock skew and adjustment.
#[derive(Debug, Clone)]
pub struct ClockReconciler {
    /// Authority clock reading at the anchor point
    server_anchor: DateTime<Utc>,

    /// Local monotonic instant captured together with the anchor
    local_anchor: Instant,
}

impl ClockReconciler {
    /// Anchors the reconciler to an authority-issued timestamp.
    pub fn new(server_now: DateTime<Utc>) -> Self {
        Self {
            server_anchor: server_now,
            local_anchor: Instant::now(),
        }
    }

    /// Re-anchors on a fresher authority timestamp.
    ///
    /// Only moves forward: an older reading (a delayed response) is
    /// ignored so the reconciled clock never jumps backwards.
    pub fn sync(&mut self, server_now: DateTime<Utc>) {
        if server_now > self.now() {
            self.server_anchor = server_now;
            self.local_anchor = Instant::now();
        }
    }

    /// Best estimate of the authority's current clock.
    pub fn now(&self) -> DateTime<Utc> {
        let delta = self.local_anchor.elapsed();
        self.server_anchor + Duration::from_std(delta).unwrap_or_else(|_| Duration::zero())
    }

    /// Skew-immune active elapsed time for a session.
    pub fn elapsed(&self, session: &Session) -> Duration {
        active_elapsed(session, self.now())
    }

    /// Time since the session's last recorded activity.
    pub fn idle_for(&self, session: &Session) -> Duration {
        session.idle_for(self.now())
    }
}

/// Formats a duration for human-readable display ("35s", "2m 15s", "1h 30m").
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let rem = secs % 60;
        if rem == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {rem}s")
        }
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h {mins}m")
        }
    }
}
