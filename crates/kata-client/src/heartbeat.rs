//! Presence heartbeat task.
//!
//! While a session is active, one task per controller pushes an
//! idempotent touch to the authority at a fixed cadence; views subscribe
//! to its health signal instead of running their own timers.
//!
//! A failed touch is retried at the next tick, never immediately, so a
//! flaky network does not hammer the authority. Repeated failure only
//! degrades the health signal - the session is never terminated locally;
//! staleness is decided by the authority's sweep alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kata_core::SessionId;

use crate::authority::SessionAuthority;
use crate::{clock_now, SharedClock};

/// Consecutive failures before the health signal degrades.
const DEGRADED_AFTER_FAILURES: u32 = 2;

/// Connection health derived from heartbeat outcomes.
///
/// A non-blocking display signal: `Degraded` never interrupts the
/// session, it only tells the UI to show "connection degraded".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatHealth {
    /// Touches are landing.
    #[default]
    Ok,

    /// Consecutive touches have failed; retrying at the normal cadence.
    Degraded {
        /// How many ticks in a row have failed
        consecutive_failures: u32,
    },

    /// The authority no longer knows the session (expired or superseded).
    /// Discovered, not asserted: the client never expires sessions itself.
    SessionGone,
}

/// Commands accepted by the running heartbeat task.
#[derive(Debug)]
enum HeartbeatCommand {
    /// Stop ticking without ending the task (session paused).
    Suspend,
    /// Start ticking again (session resumed).
    Resume,
}

/// Handle to a spawned heartbeat task.
///
/// Suspend/resume map to the session's pause/resume; dropping the
/// controller cancels the token and ends the task.
pub struct HeartbeatHandle {
    cmd_tx: mpsc::Sender<HeartbeatCommand>,
    health_rx: watch::Receiver<HeartbeatHealth>,
    cancel: CancellationToken,
}

impl HeartbeatHandle {
    /// Suspends ticking (the task stays alive).
    pub async fn suspend(&self) {
        let _ = self.cmd_tx.send(HeartbeatCommand::Suspend).await;
    }

    /// Resumes ticking after a suspension.
    pub async fn resume(&self) {
        let _ = self.cmd_tx.send(HeartbeatCommand::Resume).await;
    }

    /// Current health reading.
    pub fn health(&self) -> HeartbeatHealth {
        *self.health_rx.borrow()
    }

    /// Subscribe to health changes.
    pub fn subscribe(&self) -> watch::Receiver<HeartbeatHealth> {
        self.health_rx.clone()
    }

    /// Stops the task for good.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawns the presence heartbeat for a session.
///
/// * `suspended` - start suspended (the session was recovered in the
///   paused state)
/// * `health_tx` - health channel owned by the controller, so observers
///   keep one subscription across successive sessions
pub fn spawn_heartbeat(
    authority: Arc<dyn SessionAuthority>,
    session_id: SessionId,
    clock: SharedClock,
    every: Duration,
    suspended: bool,
    health_tx: watch::Sender<HeartbeatHealth>,
) -> HeartbeatHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
    let health_rx = health_tx.subscribe();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let _ = health_tx.send(HeartbeatHealth::Ok);

    tokio::spawn(async move {
        let mut ticker = interval(every);
        // A tab that slept should send one fresh touch, not a burst
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut suspended = suspended;
        let mut failures: u32 = 0;

        info!(
            session_id = %session_id,
            interval_secs = every.as_secs(),
            suspended,
            "Presence heartbeat started"
        );

        loop {
            tokio::select! {
                biased;

                _ = task_cancel.cancelled() => {
                    debug!(session_id = %session_id, "Heartbeat stopped");
                    return;
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(HeartbeatCommand::Suspend) => {
                            debug!(session_id = %session_id, "Heartbeat suspended");
                            suspended = true;
                        }
                        Some(HeartbeatCommand::Resume) => {
                            debug!(session_id = %session_id, "Heartbeat resumed");
                            suspended = false;
                            ticker.reset();
                        }
                        None => {
                            // Handle dropped without cancel; treat as stop
                            return;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if suspended {
                        continue;
                    }

                    let at = clock_now(&clock);
                    match authority.heartbeat(&session_id, at).await {
                        Ok(recorded) => {
                            if failures > 0 {
                                info!(
                                    session_id = %session_id,
                                    after_failures = failures,
                                    "Heartbeat recovered"
                                );
                            }
                            failures = 0;
                            let _ = health_tx.send(HeartbeatHealth::Ok);
                            debug!(
                                session_id = %session_id,
                                last_activity = %recorded,
                                "Heartbeat acknowledged"
                            );
                        }
                        Err(e) if e.is_session_gone() => {
                            // The authority finalized it (staleness sweep
                            // or a superseding session). Report and stop;
                            // no local state is touched.
                            warn!(
                                session_id = %session_id,
                                "Heartbeat target no longer exists"
                            );
                            let _ = health_tx.send(HeartbeatHealth::SessionGone);
                            return;
                        }
                        Err(e) => {
                            // Retried at the next tick, not immediately
                            failures = failures.saturating_add(1);
                            warn!(
                                session_id = %session_id,
                                consecutive_failures = failures,
                                error = %e,
                                "Heartbeat failed, will retry next interval"
                            );
                            if failures >= DEGRADED_AFTER_FAILURES {
                                let _ = health_tx.send(HeartbeatHealth::Degraded {
                                    consecutive_failures: failures,
                                });
                            }
                        }
                    }
                }
            }
        }
    });

    HeartbeatHandle {
        cmd_tx,
        health_rx,
        cancel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, Result};
    use crate::shared_clock;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use kata_core::{
        CodeSnapshot, CourseRef, OwnerId, PracticeCounters, ProblemRef, Session, SessionKind,
        SessionSummary, TerminationReason,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted authority: each heartbeat pops the next outcome.
    #[derive(Default)]
    struct ScriptedAuthority {
        outcomes: Mutex<Vec<Outcome>>,
        calls: AtomicU32,
    }

    enum Outcome {
        Ok,
        NetworkError,
        Gone,
    }

    impl ScriptedAuthority {
        fn with_outcomes(outcomes: Vec<Outcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionAuthority for ScriptedAuthority {
        async fn query_active(&self, _owner: &OwnerId) -> Result<Option<Session>> {
            Ok(None)
        }

        async fn query_active_for_problem(
            &self,
            _owner: &OwnerId,
            _problem_id: &str,
        ) -> Result<Option<Session>> {
            Ok(None)
        }

        async fn create(
            &self,
            _owner: &OwnerId,
            _kind: SessionKind,
            _problem: ProblemRef,
            _course: Option<CourseRef>,
        ) -> Result<Session> {
            Err(ClientError::Authority("not scripted".into()))
        }

        async fn heartbeat(
            &self,
            _session_id: &SessionId,
            at: DateTime<Utc>,
        ) -> Result<DateTime<Utc>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .outcomes
                .lock()
                .ok()
                .and_then(|mut o| if o.is_empty() { None } else { Some(o.remove(0)) });
            match outcome {
                Some(Outcome::NetworkError) => {
                    Err(ClientError::Network("simulated outage".into()))
                }
                Some(Outcome::Gone) => Err(ClientError::SessionGone),
                _ => Ok(at),
            }
        }

        async fn pause(&self, _session_id: &SessionId) -> Result<Session> {
            Err(ClientError::Authority("not scripted".into()))
        }

        async fn resume(&self, _session_id: &SessionId) -> Result<Session> {
            Err(ClientError::Authority("not scripted".into()))
        }

        async fn flush(
            &self,
            _session_id: &SessionId,
            _counters: PracticeCounters,
            _snapshot: Option<CodeSnapshot>,
        ) -> Result<DateTime<Utc>> {
            Ok(Utc::now())
        }

        async fn terminate(
            &self,
            _session_id: &SessionId,
            _reason: TerminationReason,
        ) -> Result<SessionSummary> {
            Err(ClientError::SessionGone)
        }

        async fn history(&self, _owner: &OwnerId) -> Result<Vec<SessionSummary>> {
            Ok(Vec::new())
        }
    }

    fn spawn_test_heartbeat(
        authority: Arc<ScriptedAuthority>,
        every: Duration,
    ) -> (HeartbeatHandle, watch::Receiver<HeartbeatHealth>) {
        let (health_tx, health_rx) = watch::channel(HeartbeatHealth::Ok);
        let handle = spawn_heartbeat(
            authority,
            SessionId::new("s-1"),
            shared_clock(Utc::now()),
            every,
            false,
            health_tx,
        );
        (handle, health_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_interval() {
        let authority = Arc::new(ScriptedAuthority::default());
        let (handle, _health) =
            spawn_test_heartbeat(Arc::clone(&authority), Duration::from_secs(25));

        tokio::time::sleep(Duration::from_secs(80)).await;

        // First tick fires immediately, then one per interval
        assert!(authority.calls() >= 3);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_degrades_then_recovers_without_termination() {
        // Three consecutive failures, then success: health degrades and
        // clears, the task keeps running, and nothing is terminated.
        let authority = Arc::new(ScriptedAuthority::with_outcomes(vec![
            Outcome::NetworkError,
            Outcome::NetworkError,
            Outcome::NetworkError,
            Outcome::Ok,
        ]));
        let (handle, health) =
            spawn_test_heartbeat(Arc::clone(&authority), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(matches!(
            *health.borrow(),
            HeartbeatHealth::Degraded { consecutive_failures } if consecutive_failures >= 2
        ));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(*health.borrow(), HeartbeatHealth::Ok);
        assert!(authority.calls() >= 4);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_stops_touches() {
        let authority = Arc::new(ScriptedAuthority::default());
        let (handle, _health) =
            spawn_test_heartbeat(Arc::clone(&authority), Duration::from_secs(10));

        // Let the immediate tick land, then suspend
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.suspend().await;
        let calls_at_suspend = authority.calls();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(authority.calls(), calls_at_suspend);

        handle.resume().await;
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(authority.calls() > calls_at_suspend);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_gone_reported_and_task_ends() {
        let authority = Arc::new(ScriptedAuthority::with_outcomes(vec![Outcome::Gone]));
        let (handle, health) =
            spawn_test_heartbeat(Arc::clone(&authority), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(*health.borrow(), HeartbeatHealth::SessionGone);

        // No further touches after the task ended
        let calls = authority.calls();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(authority.calls(), calls);
        handle.stop();
    }
}
