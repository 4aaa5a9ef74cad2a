//! Analytics aggregation for the current session.
//!
//! Discrete practice events accumulate into in-memory counters; a
//! periodic task flushes counters plus the latest code snapshot to the
//! authority, so a crash loses at most one flush interval of data.
//! Terminal transitions flush synchronously before the terminate call.
//!
//! Live derived metrics are recomputed deterministically from the raw
//! counters and published on a `watch` channel - they are display aids
//! with no invariant of their own.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kata_core::{CodeSnapshot, DerivedMetrics, PracticeCounters, PracticeEvent, SessionId};

use crate::authority::SessionAuthority;
use crate::error::Result;

/// Live display bundle: skew-immune elapsed time plus derived metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LiveStats {
    /// Active seconds (paused spans excluded)
    pub elapsed_secs: i64,

    /// Metrics derived from the raw counters
    pub metrics: DerivedMetrics,
}

impl LiveStats {
    /// Computes the bundle for a counters/elapsed pair.
    pub fn compute(counters: &PracticeCounters, elapsed: ChronoDuration) -> Self {
        Self {
            elapsed_secs: elapsed.num_seconds().max(0),
            metrics: DerivedMetrics::compute(counters, elapsed),
        }
    }
}

/// Mutable aggregation state, shared between the recording surface and
/// the flush task.
#[derive(Debug, Default)]
struct AggregateState {
    counters: PracticeCounters,
    snapshot: Option<CodeSnapshot>,
    /// Set by records, cleared by flushes; lets idle intervals skip the
    /// round trip.
    dirty: bool,
}

/// Accumulates practice events for the current session.
///
/// Cheap to clone (shared state); one aggregator instance lives as long
/// as the controller and is reset when a new session attaches.
#[derive(Clone, Default)]
pub struct AnalyticsAggregator {
    state: Arc<StdMutex<AggregateState>>,
}

impl AnalyticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one discrete event.
    pub fn record(&self, event: PracticeEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.counters.record(event);
            state.dirty = true;
        }
    }

    /// Opportunistically replaces the code snapshot (not per keystroke).
    pub fn update_snapshot(&self, code: impl Into<String>, language: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.snapshot = Some(CodeSnapshot::new(code, language));
            state.dirty = true;
        }
    }

    /// Current raw counters.
    pub fn counters(&self) -> PracticeCounters {
        self.state
            .lock()
            .map(|state| state.counters)
            .unwrap_or_default()
    }

    /// Clears all accumulated state for a fresh session.
    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = AggregateState::default();
        }
    }

    /// Seeds counters/snapshot from a recovered session, so accumulation
    /// continues where the previous context left off.
    pub fn seed(&self, counters: PracticeCounters, snapshot: Option<CodeSnapshot>) {
        if let Ok(mut state) = self.state.lock() {
            state.counters = counters;
            state.snapshot = snapshot;
            state.dirty = false;
        }
    }

    /// Returns the flush payload and clears the dirty flag.
    ///
    /// `None` when nothing changed since the last flush.
    fn take_payload(&self) -> Option<(PracticeCounters, Option<CodeSnapshot>)> {
        let mut state = self.state.lock().ok()?;
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        Some((state.counters, state.snapshot.clone()))
    }

    /// Flushes synchronously, regardless of the dirty flag.
    ///
    /// Used on terminal transitions so history always records the final
    /// counters. Counters merge by maximum authority-side, so flushing
    /// the same totals twice is harmless.
    pub async fn flush_now(
        &self,
        authority: &Arc<dyn SessionAuthority>,
        session_id: &SessionId,
    ) -> Result<()> {
        let (counters, snapshot) = self
            .state
            .lock()
            .map(|mut state| {
                state.dirty = false;
                (state.counters, state.snapshot.clone())
            })
            .unwrap_or_default();

        authority.flush(session_id, counters, snapshot).await?;
        Ok(())
    }
}

/// Spawns the periodic flush task for a session.
///
/// Each interval, a dirty aggregator is flushed to the authority and the
/// live stats channel is republished with fresh elapsed time. A network
/// failure leaves the payload dirty and is retried next interval; a
/// vanished session ends the task.
///
/// * `elapsed` - closure computing the session's current active elapsed
///   time from the shared clock
pub fn spawn_flush_task(
    authority: Arc<dyn SessionAuthority>,
    session_id: SessionId,
    aggregator: AnalyticsAggregator,
    elapsed: impl Fn() -> ChronoDuration + Send + 'static,
    every: Duration,
    stats_tx: watch::Sender<LiveStats>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(
            session_id = %session_id,
            interval_secs = every.as_secs(),
            "Analytics flush task started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(session_id = %session_id, "Analytics flush task stopped");
                    return;
                }

                _ = ticker.tick() => {
                    // Republish live stats every tick so elapsed time
                    // advances for observers even without new events.
                    let stats = LiveStats::compute(&aggregator.counters(), elapsed());
                    let _ = stats_tx.send(stats);

                    let Some((counters, snapshot)) = aggregator.take_payload() else {
                        continue;
                    };

                    match authority.flush(&session_id, counters, snapshot).await {
                        Ok(last_activity) => {
                            debug!(
                                session_id = %session_id,
                                last_activity = %last_activity,
                                "Analytics flushed"
                            );
                        }
                        Err(e) if e.is_session_gone() => {
                            warn!(
                                session_id = %session_id,
                                "Flush target no longer exists, stopping"
                            );
                            return;
                        }
                        Err(e) => {
                            // Leave the data dirty; retried next interval
                            if let Ok(mut state) = aggregator.state.lock() {
                                state.dirty = true;
                            }
                            warn!(
                                session_id = %session_id,
                                error = %e,
                                "Analytics flush failed, will retry next interval"
                            );
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use kata_core::{
        CourseRef, OwnerId, ProblemRef, Session, SessionKind, SessionSummary, TerminationReason,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_record_accumulates() {
        let aggregator = AnalyticsAggregator::new();
        aggregator.record(PracticeEvent::CodeChange);
        aggregator.record(PracticeEvent::TestRun);
        aggregator.record(PracticeEvent::AnswerSubmitted { correct: true });

        let counters = aggregator.counters();
        assert_eq!(counters.code_changes, 1);
        assert_eq!(counters.test_runs, 1);
        assert_eq!(counters.attempts, 1);
        assert_eq!(counters.correct_attempts, 1);
    }

    #[test]
    fn test_take_payload_clears_dirty() {
        let aggregator = AnalyticsAggregator::new();
        assert!(aggregator.take_payload().is_none());

        aggregator.record(PracticeEvent::HintUsed);
        let (counters, snapshot) = aggregator.take_payload().unwrap();
        assert_eq!(counters.hints_used, 1);
        assert!(snapshot.is_none());

        // Clean again until the next record
        assert!(aggregator.take_payload().is_none());
    }

    #[test]
    fn test_snapshot_updates_mark_dirty() {
        let aggregator = AnalyticsAggregator::new();
        aggregator.update_snapshot("x = 1", "python");

        let (_, snapshot) = aggregator.take_payload().unwrap();
        assert_eq!(snapshot.unwrap().code, "x = 1");
    }

    #[test]
    fn test_seed_from_recovered_session() {
        let aggregator = AnalyticsAggregator::new();
        let counters = PracticeCounters {
            code_changes: 7,
            ..PracticeCounters::default()
        };
        aggregator.seed(counters, Some(CodeSnapshot::new("old", "rust")));

        assert_eq!(aggregator.counters().code_changes, 7);
        // Seeding is not dirty - nothing new to flush yet
        assert!(aggregator.take_payload().is_none());

        aggregator.record(PracticeEvent::CodeChange);
        let (merged, _) = aggregator.take_payload().unwrap();
        assert_eq!(merged.code_changes, 8);
    }

    #[test]
    fn test_reset() {
        let aggregator = AnalyticsAggregator::new();
        aggregator.record(PracticeEvent::CodeChange);
        aggregator.reset();
        assert!(aggregator.counters().is_empty());
    }

    #[test]
    fn test_live_stats_compute() {
        let counters = PracticeCounters {
            attempts: 2,
            correct_attempts: 1,
            ..PracticeCounters::default()
        };
        let stats = LiveStats::compute(&counters, ChronoDuration::seconds(120));
        assert_eq!(stats.elapsed_secs, 120);
        assert!((stats.metrics.accuracy - 0.5).abs() < f64::EPSILON);
    }

    /// Authority stub counting flushes, optionally failing the first N.
    struct FlushCounting {
        flushes: AtomicU32,
        fail_first: u32,
    }

    impl FlushCounting {
        fn new(fail_first: u32) -> Self {
            Self {
                flushes: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl SessionAuthority for FlushCounting {
        async fn query_active(&self, _owner: &OwnerId) -> crate::error::Result<Option<Session>> {
            Ok(None)
        }

        async fn query_active_for_problem(
            &self,
            _owner: &OwnerId,
            _problem_id: &str,
        ) -> crate::error::Result<Option<Session>> {
            Ok(None)
        }

        async fn create(
            &self,
            _owner: &OwnerId,
            _kind: SessionKind,
            _problem: ProblemRef,
            _course: Option<CourseRef>,
        ) -> crate::error::Result<Session> {
            Err(ClientError::Authority("not used".into()))
        }

        async fn heartbeat(
            &self,
            _session_id: &SessionId,
            at: DateTime<Utc>,
        ) -> crate::error::Result<DateTime<Utc>> {
            Ok(at)
        }

        async fn pause(&self, _session_id: &SessionId) -> crate::error::Result<Session> {
            Err(ClientError::Authority("not used".into()))
        }

        async fn resume(&self, _session_id: &SessionId) -> crate::error::Result<Session> {
            Err(ClientError::Authority("not used".into()))
        }

        async fn flush(
            &self,
            _session_id: &SessionId,
            _counters: PracticeCounters,
            _snapshot: Option<CodeSnapshot>,
        ) -> crate::error::Result<DateTime<Utc>> {
            let n = self.flushes.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ClientError::Network("simulated outage".into()))
            } else {
                Ok(Utc::now())
            }
        }

        async fn terminate(
            &self,
            _session_id: &SessionId,
            _reason: TerminationReason,
        ) -> crate::error::Result<SessionSummary> {
            Err(ClientError::SessionGone)
        }

        async fn history(&self, _owner: &OwnerId) -> crate::error::Result<Vec<SessionSummary>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_task_flushes_dirty_state() {
        let authority = Arc::new(FlushCounting::new(0));
        let aggregator = AnalyticsAggregator::new();
        aggregator.record(PracticeEvent::CodeChange);

        let (stats_tx, stats_rx) = watch::channel(LiveStats::default());
        let cancel = CancellationToken::new();
        let dyn_authority: Arc<dyn SessionAuthority> = Arc::clone(&authority) as _;

        let _task = spawn_flush_task(
            dyn_authority,
            SessionId::new("s-1"),
            aggregator.clone(),
            || ChronoDuration::seconds(60),
            Duration::from_secs(20),
            stats_tx,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(authority.flushes.load(Ordering::SeqCst) >= 1);
        assert_eq!(stats_rx.borrow().elapsed_secs, 60);

        // No new events: the next interval publishes stats but skips the
        // authority round trip.
        let flushed = authority.flushes.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(authority.flushes.load(Ordering::SeqCst), flushed);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_failure_retries_next_interval() {
        let authority = Arc::new(FlushCounting::new(1));
        let aggregator = AnalyticsAggregator::new();
        aggregator.record(PracticeEvent::TestRun);

        let (stats_tx, _stats_rx) = watch::channel(LiveStats::default());
        let cancel = CancellationToken::new();
        let dyn_authority: Arc<dyn SessionAuthority> = Arc::clone(&authority) as _;

        let _task = spawn_flush_task(
            dyn_authority,
            SessionId::new("s-1"),
            aggregator.clone(),
            || ChronoDuration::zero(),
            Duration::from_secs(20),
            stats_tx,
            cancel.clone(),
        );

        // First tick fails; the payload stays dirty and the second tick
        // retries successfully.
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(authority.flushes.load(Ordering::SeqCst) >= 2);
        assert!(aggregator.take_payload().is_none());

        cancel.cancel();
    }
}
