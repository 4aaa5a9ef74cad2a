//! End-to-end lifecycle tests: real SessionManager instances (one per
//! simulated context) against a real katad authority over a Unix socket.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - the panic-free policy
//! applies to production code, which is exercised through assertions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use kata_client::{
    shared_clock, AuthorityClient, AuthorityConfig, ClientError, RecoveryChoice, RecoveryPrompt,
    RecoverySummary, SessionManager, StartOutcome, StartRequest,
};
use kata_core::{
    CodeSnapshot, OwnerId, PracticeEvent, ProblemRef, SessionState, StalenessPolicy,
    TerminationReason,
};
use katad::registry::spawn_registry;
use katad::server::AuthorityServer;

// ============================================================================
// Test Harness
// ============================================================================

/// A running daemon on a temp socket.
struct TestDaemon {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestDaemon {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("katad.sock");
        let policy = StalenessPolicy::default();

        let registry = spawn_registry(policy);
        let cancel_token = CancellationToken::new();
        let server = AuthorityServer::new(
            socket_path.clone(),
            registry,
            policy,
            cancel_token.clone(),
        );

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            if socket_path.exists() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(socket_path.exists(), "daemon socket did not appear");

        Self {
            socket_path,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    /// Builds one "browser context": its own client, clock, and manager.
    async fn context(&self, owner: &str, choice: RecoveryChoice) -> SessionManager {
        let clock = shared_clock(Utc::now());
        let config = AuthorityConfig {
            socket_path: self.socket_path.clone(),
            ..Default::default()
        };
        let client = Arc::new(
            AuthorityClient::connect(config, clock.clone())
                .await
                .expect("connect to test daemon"),
        );
        let policy = client.policy().expect("handshake advertises policy");

        SessionManager::new(
            OwnerId::new(owner),
            client as _,
            Arc::new(FixedPrompt(choice)),
            policy,
            clock,
        )
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(Duration::from_millis(100)).await;
    }
}

/// Prompt with a fixed answer, standing in for the UI layer.
struct FixedPrompt(RecoveryChoice);

#[async_trait]
impl RecoveryPrompt for FixedPrompt {
    async fn decide(&self, _summary: &RecoverySummary) -> RecoveryChoice {
        self.0
    }
}

fn daily(problem_id: &str) -> StartRequest {
    StartRequest::daily(ProblemRef::new(problem_id, format!("Problem {problem_id}")))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_fresh_start_over_socket() {
    let daemon = TestDaemon::spawn().await;
    let manager = daemon.context("learner-1", RecoveryChoice::Recover).await;

    let outcome = manager.start_or_recover(daily("two-sum")).await.unwrap();

    assert!(matches!(outcome, StartOutcome::Started(_)));
    assert_eq!(outcome.session().state, SessionState::Active);
    assert_eq!(outcome.session().owner.as_str(), "learner-1");
    assert!(manager.elapsed().is_some());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_two_contexts_one_session() {
    // Scenario: context 1 starts problem X; context 2 (another tab)
    // requests problem Y for the same owner. Context 2 must surface
    // context 1's session instead of creating a second one.
    let daemon = TestDaemon::spawn().await;

    let ctx1 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    let started = ctx1.start_or_recover(daily("problem-x")).await.unwrap();

    let ctx2 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    let outcome = ctx2.start_or_recover(daily("problem-y")).await.unwrap();

    match outcome {
        StartOutcome::Recovered(session) => {
            assert_eq!(session.id, started.session().id);
            assert_eq!(session.problem.id, "problem-x");
            assert_eq!(session.state, SessionState::Active);
        }
        other => panic!("Expected Recovered, got {other:?}"),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_dismiss_then_fresh_session() {
    // Scenario: the learner declines recovery. The prior session must
    // land in history as user_dismissed and the new session must be
    // created strictly afterwards.
    let daemon = TestDaemon::spawn().await;

    let ctx1 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    ctx1.start_or_recover(daily("problem-x")).await.unwrap();
    ctx1.record_event(PracticeEvent::CodeChange);
    ctx1.flush_now().await.unwrap();

    let ctx2 = daemon.context("learner-1", RecoveryChoice::Dismiss).await;
    let outcome = ctx2.start_or_recover(daily("problem-y")).await.unwrap();

    match &outcome {
        StartOutcome::Started(session) => assert_eq!(session.problem.id, "problem-y"),
        other => panic!("Expected Started, got {other:?}"),
    }

    let history = ctx2.history().await.unwrap();
    assert_eq!(history.len(), 1);
    let dismissed = &history[0];
    assert_eq!(dismissed.problem.id, "problem-x");
    assert_eq!(dismissed.termination, TerminationReason::UserDismissed);
    assert_eq!(dismissed.counters.code_changes, 1);
    assert!(!dismissed.is_completed);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_pause_resume_and_recovery_of_paused_session() {
    let daemon = TestDaemon::spawn().await;

    let ctx1 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    ctx1.start_or_recover(daily("two-sum")).await.unwrap();
    let paused = ctx1.pause_current().await.unwrap();
    assert_eq!(paused.state, SessionState::Paused);

    // A new context recovering a paused session resumes it
    let ctx2 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    let outcome = ctx2.start_or_recover(daily("two-sum")).await.unwrap();

    match outcome {
        StartOutcome::Recovered(session) => {
            assert_eq!(session.state, SessionState::Active);
            assert!(session.paused_at.is_none());
        }
        other => panic!("Expected Recovered, got {other:?}"),
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_round_trips_through_recovery() {
    let daemon = TestDaemon::spawn().await;
    let code = "class Solution:\n    def twoSum(self, nums, target):\n        pass\n";

    let ctx1 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    ctx1.start_or_recover(daily("two-sum")).await.unwrap();
    ctx1.update_snapshot(code, "python");
    ctx1.flush_now().await.unwrap();

    let ctx2 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    let outcome = ctx2.start_or_recover(daily("two-sum")).await.unwrap();

    let snapshot = outcome.session().snapshot.clone().expect("snapshot present");
    assert_eq!(snapshot.code.as_bytes(), code.as_bytes());
    assert_eq!(snapshot.language, "python");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_complete_lands_in_history_once() {
    let daemon = TestDaemon::spawn().await;
    let manager = daemon.context("learner-1", RecoveryChoice::Recover).await;

    manager.start_or_recover(daily("two-sum")).await.unwrap();
    manager.record_event(PracticeEvent::TestRun);
    manager.record_event(PracticeEvent::AnswerSubmitted { correct: true });

    let summary = manager
        .complete_current(Some(CodeSnapshot::new("final code", "rust")))
        .await
        .unwrap();
    assert!(summary.is_completed);
    assert_eq!(summary.counters.test_runs, 1);
    assert_eq!(summary.counters.attempts, 1);

    // Nothing live afterwards, exactly one history record
    let fresh = daemon.context("learner-1", RecoveryChoice::Recover).await;
    assert!(fresh.attach_active().await.unwrap().is_none());
    assert_eq!(fresh.history().await.unwrap().len(), 1);

    // Double-submit from this context is a clean no-op error
    assert!(matches!(
        manager.complete_current(None).await,
        Err(ClientError::NoCurrentSession)
    ));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_stale_handle_mutation_fails_cleanly() {
    // Context 1 holds a session that context 2 dismisses (supersedes).
    // Context 1's next mutation must fail with a typed "gone" error and
    // drop its handle, not corrupt anything.
    let daemon = TestDaemon::spawn().await;

    let ctx1 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    ctx1.start_or_recover(daily("problem-x")).await.unwrap();

    let ctx2 = daemon.context("learner-1", RecoveryChoice::Dismiss).await;
    ctx2.start_or_recover(daily("problem-y")).await.unwrap();

    let result = ctx1.pause_current().await;
    assert!(matches!(result, Err(ClientError::SessionGone)));
    assert!(ctx1.session_hint().is_none());

    // Context 2's replacement session is untouched
    let live = ctx2.session_hint().unwrap();
    assert_eq!(live.problem.id, "problem-y");
    assert_eq!(live.state, SessionState::Active);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_elapsed_uses_authority_start_time() {
    let daemon = TestDaemon::spawn().await;
    let manager = daemon.context("learner-1", RecoveryChoice::Recover).await;

    let outcome = manager.start_or_recover(daily("two-sum")).await.unwrap();
    let elapsed = manager.elapsed().unwrap();

    // Fresh session: elapsed is near zero and never negative, even
    // though client and daemon clocks are independent.
    assert!(elapsed >= chrono::Duration::zero());
    assert!(elapsed < chrono::Duration::seconds(5));
    assert!(outcome.session().started_at <= Utc::now() + chrono::Duration::seconds(5));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_history_visible_across_contexts() {
    let daemon = TestDaemon::spawn().await;

    let ctx1 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    ctx1.start_or_recover(daily("one")).await.unwrap();
    ctx1.complete_current(None).await.unwrap();

    let ctx2 = daemon.context("learner-1", RecoveryChoice::Recover).await;
    ctx2.start_or_recover(daily("two")).await.unwrap();
    ctx2.abandon_current(TerminationReason::UserAbandoned)
        .await
        .unwrap();

    // Another owner's history stays separate
    let other = daemon.context("learner-2", RecoveryChoice::Recover).await;
    assert!(other.history().await.unwrap().is_empty());

    let history = ctx2.history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|s| s.is_completed).count(), 1);

    daemon.shutdown().await;
}
