//! Kata CLI - drive practice sessions from the command line.
//!
//! A thin front door over the kata-client library, useful for local
//! workflows and for poking at a running daemon. Rendering-heavy
//! surfaces (editors, dashboards) live elsewhere; this prints plain
//! text.
//!
//! # Usage
//!
//! ```text
//! kata --owner alice start two-sum --title "Two Sum" --hold
//! kata --owner alice status
//! kata --owner alice event test-run
//! kata --owner alice pause
//! kata --owner alice resume
//! kata --owner alice complete
//! kata --owner alice abandon
//! kata --owner alice history
//! kata --owner alice watch
//! ```
//!
//! The owner id comes from `--owner` or `KATA_OWNER`; authentication is
//! handled by whatever issued that id, not here.

use std::env;
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kata_client::{
    shared_clock, AuthorityClient, AuthorityConfig, RecoveryChoice, RecoveryPrompt,
    RecoverySummary, SessionManager, StartOutcome, StartRequest,
};
use kata_core::{
    format_duration, CodeSnapshot, CourseRef, OwnerId, PracticeEvent, ProblemRef, Session,
    SessionState, StalenessPolicy, TerminationReason,
};
use kata_protocol::AuthorityMessage;

// ============================================================================
// CLI Arguments
// ============================================================================

/// Kata - track coding practice sessions
#[derive(Parser, Debug)]
#[command(name = "kata")]
#[command(about = "Track coding practice sessions against a katad daemon")]
#[command(version)]
struct Args {
    /// Learner identity (defaults to $KATA_OWNER)
    #[arg(long, global = true)]
    owner: Option<String>,

    /// Daemon socket path (defaults to $KATA_SOCKET or /tmp/katad.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start practicing a problem (negotiating recovery first)
    Start {
        /// Problem id from the catalog
        problem_id: String,

        /// Problem title for display
        #[arg(long)]
        title: Option<String>,

        /// Course id; makes this a roadmap session
        #[arg(long)]
        course: Option<String>,

        /// What to do when another session is already live
        #[arg(long, value_enum, default_value_t = OnConflict::Ask)]
        on_conflict: OnConflict,

        /// Keep running (heartbeating) until Ctrl+C
        #[arg(long)]
        hold: bool,
    },

    /// Show the current session, if any
    Status {
        /// Only match a session for this specific problem
        #[arg(long)]
        problem: Option<String>,
    },

    /// Pause the current session
    Pause,

    /// Resume the current (paused) session
    Resume,

    /// Complete the current session as solved
    Complete {
        /// File whose contents become the final code snapshot
        #[arg(long)]
        code_file: Option<PathBuf>,

        /// Language of the final snapshot
        #[arg(long, default_value = "text")]
        language: String,
    },

    /// Abandon the current session
    Abandon,

    /// Record a practice event against the current session
    Event {
        #[command(subcommand)]
        event: EventKind,
    },

    /// Show finalized-session history
    History,

    /// Stream session change events until Ctrl+C
    Watch,
}

#[derive(Subcommand, Debug)]
enum EventKind {
    /// The code changed
    CodeChange,
    /// Tests were run
    TestRun,
    /// A hint was revealed
    Hint,
    /// An answer was submitted
    Submit {
        /// The judge accepted it
        #[arg(long)]
        correct: bool,
    },
}

/// Non-interactive recovery policies for scripting.
#[derive(ValueEnum, Clone, Copy, Debug)]
enum OnConflict {
    /// Always return to the existing session
    Recover,
    /// Always discard the existing session
    Dismiss,
    /// Print the summary and ask on stdin
    Ask,
}

impl std::fmt::Display for OnConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Recover => "recover",
            Self::Dismiss => "dismiss",
            Self::Ask => "ask",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Recovery Prompt
// ============================================================================

/// Recovery decisions for the CLI: a fixed policy, or a stdin question.
struct CliPrompt {
    mode: OnConflict,
}

#[async_trait]
impl RecoveryPrompt for CliPrompt {
    async fn decide(&self, summary: &RecoverySummary) -> RecoveryChoice {
        match self.mode {
            OnConflict::Recover => RecoveryChoice::Recover,
            OnConflict::Dismiss => RecoveryChoice::Dismiss,
            OnConflict::Ask => ask_on_stdin(summary).await,
        }
    }
}

/// Prints the recovery summary and reads r/d from stdin.
async fn ask_on_stdin(summary: &RecoverySummary) -> RecoveryChoice {
    println!("You already have a session in progress:");
    println!(
        "  {} - {} ({})",
        summary.session.problem.title,
        summary.session.state,
        if summary.was_paused { "paused" } else { "running" },
    );
    println!("  idle for {}", format_duration(summary.idle_for));
    println!("  so far: {}", summary.counters);
    if let Some(snapshot) = &summary.snapshot {
        println!(
            "  last code: {} bytes of {}",
            snapshot.len(),
            snapshot.language
        );
    }
    if !summary.matches_requested_problem {
        println!("  note: this session is for a DIFFERENT problem than requested");
    }
    print!("Recover it, or dismiss and start fresh? [r/d] ");
    let _ = std::io::stdout().flush();

    // Stdin is blocking; don't stall the runtime
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok();
        line
    })
    .await
    .unwrap_or_default();

    if answer.trim().eq_ignore_ascii_case("d") {
        RecoveryChoice::Dismiss
    } else {
        RecoveryChoice::Recover
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn resolve_owner(args: &Args) -> Result<OwnerId> {
    match args
        .owner
        .clone()
        .or_else(|| env::var("KATA_OWNER").ok())
    {
        Some(owner) if !owner.is_empty() => Ok(OwnerId::new(owner)),
        _ => bail!("No owner given. Pass --owner or set KATA_OWNER."),
    }
}

fn authority_config(args: &Args) -> AuthorityConfig {
    let socket_path = args
        .socket
        .clone()
        .or_else(|| env::var("KATA_SOCKET").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/tmp/katad.sock"));

    AuthorityConfig {
        socket_path,
        ..Default::default()
    }
}

/// Builds a manager connected to the daemon, using the policy the
/// daemon advertised at handshake.
async fn connect_manager(
    args: &Args,
    on_conflict: OnConflict,
) -> Result<(SessionManager, Arc<AuthorityClient>)> {
    let owner = resolve_owner(args)?;
    let clock = shared_clock(Utc::now());

    let client = Arc::new(
        AuthorityClient::connect(authority_config(args), clock.clone())
            .await
            .context("Cannot reach the kata daemon; is katad running?")?,
    );
    let policy = client.policy().unwrap_or_else(StalenessPolicy::default);

    let manager = SessionManager::new(
        owner,
        Arc::clone(&client) as _,
        Arc::new(CliPrompt { mode: on_conflict }),
        policy,
        clock,
    );

    Ok((manager, client))
}

fn print_session(session: &Session, elapsed: Option<chrono::Duration>) {
    println!("session   {}", session.id);
    println!("problem   {}", session.problem);
    if let Some(course) = &session.course {
        println!("course    {course}");
    }
    println!("kind      {}", session.kind);
    println!("state     {}", session.state);
    println!("started   {}", session.started_at.to_rfc3339());
    if let Some(elapsed) = elapsed {
        println!("elapsed   {} (active)", format_duration(elapsed));
    }
    println!("activity  {}", session.last_activity.to_rfc3339());
    println!("progress  {}", session.counters);
    if let Some(snapshot) = &session.snapshot {
        println!("snapshot  {} bytes of {}", snapshot.len(), snapshot.language);
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match &args.command {
        Command::Start {
            problem_id,
            title,
            course,
            on_conflict,
            hold,
        } => {
            let (manager, _client) = connect_manager(&args, *on_conflict).await?;

            let problem = ProblemRef::new(
                problem_id.clone(),
                title.clone().unwrap_or_else(|| problem_id.clone()),
            );
            let request = match course {
                Some(course) => StartRequest::roadmap(problem, CourseRef::new(course.clone())),
                None => StartRequest::daily(problem),
            };

            let outcome = manager.start_or_recover(request).await?;
            match &outcome {
                StartOutcome::Started(session) => {
                    println!("Started a new session.");
                    print_session(session, manager.elapsed());
                }
                StartOutcome::Recovered(session) => {
                    println!("Recovered your existing session.");
                    print_session(session, manager.elapsed());
                }
            }

            if *hold {
                println!("Holding session (heartbeating); Ctrl+C to detach.");
                tokio::signal::ctrl_c().await?;
                println!("Detached. The session stays live until it expires or resumes elsewhere.");
            }
            Ok(())
        }

        Command::Status { problem } => {
            let (manager, _client) = connect_manager(&args, OnConflict::Recover).await?;

            let session = match problem {
                Some(problem_id) => manager.active_for_problem(problem_id).await?,
                None => manager.attach_active().await?,
            };

            match session {
                Some(session) => {
                    let elapsed = if session.state == SessionState::Active {
                        manager.elapsed()
                    } else {
                        None
                    };
                    print_session(&session, elapsed);
                }
                None => println!("No live session."),
            }
            Ok(())
        }

        Command::Pause => {
            let (manager, _client) = connect_manager(&args, OnConflict::Recover).await?;
            if manager.attach_active().await?.is_none() {
                bail!("No live session to pause.");
            }
            let session = manager.pause_current().await?;
            println!("Paused.");
            print_session(&session, None);
            Ok(())
        }

        Command::Resume => {
            let (manager, _client) = connect_manager(&args, OnConflict::Recover).await?;
            if manager.attach_active().await?.is_none() {
                bail!("No live session to resume.");
            }
            let session = manager.resume_current().await?;
            println!("Resumed.");
            print_session(&session, manager.elapsed());
            Ok(())
        }

        Command::Complete {
            code_file,
            language,
        } => {
            let (manager, _client) = connect_manager(&args, OnConflict::Recover).await?;
            if manager.attach_active().await?.is_none() {
                bail!("No live session to complete.");
            }

            let snapshot = match code_file {
                Some(path) => {
                    let code = std::fs::read_to_string(path)
                        .with_context(|| format!("Cannot read {}", path.display()))?;
                    Some(CodeSnapshot::new(code, language.clone()))
                }
                None => None,
            };

            let summary = manager.complete_current(snapshot).await?;
            println!(
                "Solved {} in {} ({}).",
                summary.problem.title,
                format_duration(chrono::Duration::seconds(summary.active_secs)),
                summary.counters,
            );
            println!("Estimated score: {:.0}", summary.metrics.estimated_score);
            Ok(())
        }

        Command::Abandon => {
            let (manager, _client) = connect_manager(&args, OnConflict::Recover).await?;
            if manager.attach_active().await?.is_none() {
                bail!("No live session to abandon.");
            }
            let summary = manager
                .abandon_current(TerminationReason::UserAbandoned)
                .await?;
            println!(
                "Abandoned {} after {}.",
                summary.problem.title,
                format_duration(chrono::Duration::seconds(summary.active_secs)),
            );
            Ok(())
        }

        Command::Event { event } => {
            let (manager, _client) = connect_manager(&args, OnConflict::Recover).await?;
            if manager.attach_active().await?.is_none() {
                bail!("No live session to record against.");
            }

            let event = match event {
                EventKind::CodeChange => PracticeEvent::CodeChange,
                EventKind::TestRun => PracticeEvent::TestRun,
                EventKind::Hint => PracticeEvent::HintUsed,
                EventKind::Submit { correct } => PracticeEvent::AnswerSubmitted {
                    correct: *correct,
                },
            };

            manager.record_event(event);
            manager.flush_now().await?;

            let counters = manager
                .session_hint()
                .map(|s| s.counters)
                .unwrap_or_default();
            println!("Recorded. Session now at: {counters}");
            Ok(())
        }

        Command::History => {
            let (manager, _client) = connect_manager(&args, OnConflict::Recover).await?;
            let summaries = manager.history().await?;

            if summaries.is_empty() {
                println!("No finished sessions yet.");
                return Ok(());
            }

            for summary in summaries {
                let mark = if summary.is_completed { "✓" } else { "✗" };
                println!(
                    "{mark} {}  {}  {}  {} [{}]",
                    summary.finished_at.format("%Y-%m-%d %H:%M"),
                    summary.problem.title,
                    format_duration(chrono::Duration::seconds(summary.active_secs)),
                    summary.counters,
                    summary.termination,
                );
            }
            Ok(())
        }

        Command::Watch => {
            let owner = resolve_owner(&args)?;
            let clock = shared_clock(Utc::now());
            let client = AuthorityClient::connect(authority_config(&args), clock)
                .await
                .context("Cannot reach the kata daemon; is katad running?")?;

            let cancel = CancellationToken::new();
            let mut events = client.spawn_event_listener(Some(owner), cancel.clone());

            println!("Watching session events; Ctrl+C to stop.");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        cancel.cancel();
                        return Ok(());
                    }
                    event = events.recv() => {
                        match event {
                            Some(AuthorityMessage::SessionChanged { session }) => {
                                println!(
                                    "{} {} [{}] {}",
                                    session.last_activity.format("%H:%M:%S"),
                                    session.problem.id,
                                    session.state,
                                    session.counters,
                                );
                            }
                            Some(AuthorityMessage::SessionFinalized { session_id, reason }) => {
                                println!("session {} finalized: {reason}", session_id.short());
                            }
                            Some(AuthorityMessage::ActiveSession { session, .. }) => {
                                match session {
                                    Some(session) => println!(
                                        "current: {} [{}]",
                                        session.problem.id, session.state
                                    ),
                                    None => println!("current: none"),
                                }
                            }
                            Some(_) => {}
                            None => {
                                println!("Event stream ended.");
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}
