//! Authority connection client.
//!
//! This module provides the [`SessionAuthority`] trait - the seam between
//! the client-side session components and the backend authority - and
//! [`AuthorityClient`], its Unix-socket implementation speaking the wire
//! protocol to katad.
//!
//! Every operation here is a cancellable, asynchronous request. The
//! client keeps one lazily-established connection for request/response
//! exchanges and re-dials with capped exponential backoff after a
//! failure. Event subscriptions get their own connection so broadcast
//! traffic never interleaves with responses.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free
//! guidelines. No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`,
//! or `todo!()`.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kata_core::{
    CodeSnapshot, CourseRef, OwnerId, PracticeCounters, ProblemRef, Session, SessionId,
    SessionKind, SessionSummary, StalenessPolicy, TerminationReason,
};
use kata_protocol::{AuthorityMessage, ClientMessage, ProtocolVersion};

use crate::error::{ClientError, Result};
use crate::{clock_sync, SharedClock};

// ============================================================================
// Authority Trait
// ============================================================================

/// Operations the backend session authority exposes to this client.
///
/// The authority is the single source of truth: the live session record
/// per owner lives there, and every conflict-sensitive decision is
/// arbitrated there. Local caches are hints only.
///
/// Implemented by [`AuthorityClient`] over the daemon socket; tests
/// substitute in-memory implementations with failure injection.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    /// Look up the owner's live session, if any.
    async fn query_active(&self, owner: &OwnerId) -> Result<Option<Session>>;

    /// Look up the owner's live session for one specific problem.
    async fn query_active_for_problem(
        &self,
        owner: &OwnerId,
        problem_id: &str,
    ) -> Result<Option<Session>>;

    /// Create a new session. Fails with [`ClientError::Conflict`] if the
    /// owner already has a live one - the authority is the final arbiter,
    /// a create that loses a race is rejected, not silently accepted.
    async fn create(
        &self,
        owner: &OwnerId,
        kind: SessionKind,
        problem: ProblemRef,
        course: Option<CourseRef>,
    ) -> Result<Session>;

    /// Idempotent presence touch. Returns the recorded activity
    /// high-water mark.
    async fn heartbeat(&self, session_id: &SessionId, at: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// Pause a live session. Returns the updated record.
    async fn pause(&self, session_id: &SessionId) -> Result<Session>;

    /// Resume a paused session. Returns the updated record.
    async fn resume(&self, session_id: &SessionId) -> Result<Session>;

    /// Upsert analytics counters and the latest snapshot. Safe to retry.
    async fn flush(
        &self,
        session_id: &SessionId,
        counters: PracticeCounters,
        snapshot: Option<CodeSnapshot>,
    ) -> Result<DateTime<Utc>>;

    /// Finalize a session. Returns the appended history record.
    async fn terminate(
        &self,
        session_id: &SessionId,
        reason: TerminationReason,
    ) -> Result<SessionSummary>;

    /// Fetch the owner's finalized-session history.
    async fn history(&self, owner: &OwnerId) -> Result<Vec<SessionSummary>>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the authority client.
///
/// Controls connection behavior including socket path and the retry
/// backoff used when (re)dialing the daemon.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Path to the Unix socket where the authority listens.
    pub socket_path: PathBuf,

    /// Optional client identifier sent in the handshake.
    pub client_id: Option<String>,

    /// Initial delay before the first redial after a connect failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between redial attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub retry_multiplier: f64,

    /// Dial attempts per request before giving up with a network error.
    pub connect_attempts: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/katad.sock"),
            client_id: None,
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(2),
            retry_multiplier: 2.0,
            connect_attempts: 3,
        }
    }
}

// ============================================================================
// Authority Client
// ============================================================================

/// A handshaken request/response connection to the daemon.
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    /// Sends one request and reads one response line.
    async fn exchange(&mut self, msg: &ClientMessage) -> Result<AuthorityMessage> {
        let json = serde_json::to_string(msg)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes = self.reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Err(ClientError::Network("authority closed connection".into()));
        }

        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Unix-socket client for the session authority daemon.
///
/// Holds one lazily-dialed connection for request/response exchanges
/// (one in flight at a time) and re-dials with exponential backoff when
/// it drops. Every response carrying an authority clock reading also
/// re-syncs the shared clock reconciler.
pub struct AuthorityClient {
    /// Connection behavior
    config: AuthorityConfig,

    /// Shared reconciler, re-anchored from authority timestamps
    clock: SharedClock,

    /// Cadence policy received in the last handshake
    policy: StdMutex<Option<StalenessPolicy>>,

    /// The current request/response connection, if established
    conn: Mutex<Option<Connection>>,
}

impl AuthorityClient {
    /// Creates a client and performs the initial handshake eagerly, so
    /// the caller immediately has the authority's clock and policy.
    pub async fn connect(config: AuthorityConfig, clock: SharedClock) -> Result<Self> {
        let client = Self::new_lazy(config, clock);
        {
            let mut guard = client.conn.lock().await;
            let conn = client.open_connection().await?;
            *guard = Some(conn);
        }
        Ok(client)
    }

    /// Creates a client without dialing; the first request connects.
    pub fn new_lazy(config: AuthorityConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            policy: StdMutex::new(None),
            conn: Mutex::new(None),
        }
    }

    /// The cadence policy the authority advertised, once connected.
    pub fn policy(&self) -> Option<StalenessPolicy> {
        self.policy.lock().ok().and_then(|p| *p)
    }

    /// Dials the socket with capped exponential backoff.
    async fn dial(&self) -> Result<UnixStream> {
        let mut delay = self.config.retry_initial_delay;
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.config.connect_attempts.max(1) {
            debug!(
                attempt,
                socket_path = %self.config.socket_path.display(),
                "Dialing authority"
            );

            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_error = e.to_string();
                    debug!(attempt, error = %e, "Dial attempt failed");
                }
            }

            if attempt < self.config.connect_attempts {
                sleep(delay).await;
                let next_ms = (delay.as_millis() as f64 * self.config.retry_multiplier) as u64;
                delay = Duration::from_millis(next_ms).min(self.config.retry_max_delay);
            }
        }

        Err(ClientError::Network(format!(
            "cannot reach authority at {}: {last_error}",
            self.config.socket_path.display()
        )))
    }

    /// Dials and performs the protocol handshake.
    async fn open_connection(&self) -> Result<Connection> {
        let stream = self.dial().await?;
        let (reader, writer) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(reader),
            writer,
        };

        let hello = ClientMessage::hello(self.config.client_id.clone());
        let response = conn.exchange(&hello).await?;

        match response {
            AuthorityMessage::Welcome {
                protocol_version,
                client_id,
                server_time,
                policy,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        authority_version: protocol_version.to_string(),
                    });
                }

                clock_sync(&self.clock, server_time);
                if let Ok(mut slot) = self.policy.lock() {
                    *slot = Some(policy);
                }

                info!(
                    client_id,
                    protocol_version = %protocol_version,
                    "Authority handshake complete"
                );
                Ok(conn)
            }
            AuthorityMessage::Rejected {
                protocol_version, ..
            } => Err(ClientError::VersionMismatch {
                client_version: ProtocolVersion::CURRENT.to_string(),
                authority_version: protocol_version.to_string(),
            }),
            other => Err(ClientError::Protocol(format!(
                "unexpected handshake response: {other:?}"
            ))),
        }
    }

    /// Sends one request over the shared connection, re-dialing first if
    /// necessary. A connection-level failure drops the connection so the
    /// next request starts clean; the error itself is returned to the
    /// caller, which decides whether a retry is safe.
    async fn request(&self, msg: ClientMessage) -> Result<AuthorityMessage> {
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            *guard = Some(self.open_connection().await?);
        }

        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => return Err(ClientError::Network("connection unavailable".into())),
        };

        match conn.exchange(&msg).await {
            Ok(response) => Ok(self.apply_clock(response)),
            Err(e) => {
                // Drop the broken connection; next request re-dials
                *guard = None;
                Err(e)
            }
        }
    }

    /// Re-anchors the shared clock from any response carrying a server
    /// timestamp, then passes the response through.
    fn apply_clock(&self, response: AuthorityMessage) -> AuthorityMessage {
        match &response {
            AuthorityMessage::ActiveSession { server_time, .. }
            | AuthorityMessage::HeartbeatAck { server_time, .. } => {
                clock_sync(&self.clock, *server_time);
            }
            _ => {}
        }
        response
    }

    /// Spawns an event listener on its own connection.
    ///
    /// Subscribes to session change events (optionally scoped to one
    /// owner) and forwards them until cancelled. Reconnects with
    /// backoff if the connection drops, in which case observers simply
    /// see a gap - events are display aids, not state.
    pub fn spawn_event_listener(
        &self,
        owner: Option<OwnerId>,
        cancel_token: CancellationToken,
    ) -> mpsc::UnboundedReceiver<AuthorityMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let clock = self.clock.clone();

        tokio::spawn(async move {
            let mut delay = config.retry_initial_delay;

            loop {
                if cancel_token.is_cancelled() {
                    debug!("Event listener cancelled");
                    return;
                }

                match listen_once(&config, &clock, owner.clone(), &tx, &cancel_token).await {
                    Ok(()) => {
                        debug!("Event stream closed");
                    }
                    Err(e) => {
                        if !cancel_token.is_cancelled() {
                            warn!(error = %e, "Event stream error, will reconnect");
                        }
                    }
                }

                if tx.is_closed() || cancel_token.is_cancelled() {
                    return;
                }

                tokio::select! {
                    _ = sleep(delay) => {
                        let next_ms = (delay.as_millis() as f64 * config.retry_multiplier) as u64;
                        delay = Duration::from_millis(next_ms).min(config.retry_max_delay);
                    }
                    _ = cancel_token.cancelled() => return,
                }
            }
        });

        rx
    }
}

/// One subscribe-and-read pass of the event listener.
async fn listen_once(
    config: &AuthorityConfig,
    clock: &SharedClock,
    owner: Option<OwnerId>,
    tx: &mpsc::UnboundedSender<AuthorityMessage>,
    cancel_token: &CancellationToken,
) -> Result<()> {
    let stream = UnixStream::connect(&config.socket_path)
        .await
        .map_err(|e| ClientError::Network(e.to_string()))?;
    let (reader, writer) = stream.into_split();
    let mut conn = Connection {
        reader: BufReader::new(reader),
        writer,
    };

    // Handshake
    match conn.exchange(&ClientMessage::hello(None)).await? {
        AuthorityMessage::Welcome { server_time, .. } => clock_sync(clock, server_time),
        other => {
            return Err(ClientError::Protocol(format!(
                "unexpected handshake response: {other:?}"
            )))
        }
    }

    // Subscribe; the authority answers owner-scoped subscriptions with
    // the current session as initial state, which we forward too.
    let subscribe = ClientMessage::subscribe(owner);
    let json = serde_json::to_string(&subscribe)?;
    conn.writer.write_all(json.as_bytes()).await?;
    conn.writer.write_all(b"\n").await?;
    conn.writer.flush().await?;

    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),

            read = conn.reader.read_line(&mut line) => {
                match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => {
                        match serde_json::from_str::<AuthorityMessage>(line.trim()) {
                            Ok(msg) => {
                                if tx.send(msg).is_err() {
                                    // Receiver dropped - observer went away
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Skipping unparseable event");
                            }
                        }
                    }
                    Err(e) => return Err(ClientError::Network(e.to_string())),
                }
            }
        }
    }
}

// ============================================================================
// Trait implementation over the wire
// ============================================================================

#[async_trait]
impl SessionAuthority for AuthorityClient {
    async fn query_active(&self, owner: &OwnerId) -> Result<Option<Session>> {
        let response = self
            .request(ClientMessage::query_active(owner.clone()))
            .await?;
        expect_active_session(response)
    }

    async fn query_active_for_problem(
        &self,
        owner: &OwnerId,
        problem_id: &str,
    ) -> Result<Option<Session>> {
        let response = self
            .request(ClientMessage::query_active_for_problem(
                owner.clone(),
                problem_id,
            ))
            .await?;
        expect_active_session(response)
    }

    async fn create(
        &self,
        owner: &OwnerId,
        kind: SessionKind,
        problem: ProblemRef,
        course: Option<CourseRef>,
    ) -> Result<Session> {
        let response = self
            .request(ClientMessage::create(owner.clone(), kind, problem, course))
            .await?;
        match response {
            AuthorityMessage::Created { session } => Ok(*session),
            other => Err(unexpected(other)),
        }
    }

    async fn heartbeat(&self, session_id: &SessionId, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let response = self
            .request(ClientMessage::heartbeat(session_id.clone(), at))
            .await?;
        match response {
            AuthorityMessage::HeartbeatAck { last_activity, .. } => Ok(last_activity),
            other => Err(unexpected(other)),
        }
    }

    async fn pause(&self, session_id: &SessionId) -> Result<Session> {
        let response = self
            .request(ClientMessage::pause(session_id.clone()))
            .await?;
        match response {
            AuthorityMessage::StateChanged { session } => Ok(*session),
            other => Err(unexpected(other)),
        }
    }

    async fn resume(&self, session_id: &SessionId) -> Result<Session> {
        let response = self
            .request(ClientMessage::resume(session_id.clone()))
            .await?;
        match response {
            AuthorityMessage::StateChanged { session } => Ok(*session),
            other => Err(unexpected(other)),
        }
    }

    async fn flush(
        &self,
        session_id: &SessionId,
        counters: PracticeCounters,
        snapshot: Option<CodeSnapshot>,
    ) -> Result<DateTime<Utc>> {
        let response = self
            .request(ClientMessage::flush(session_id.clone(), counters, snapshot))
            .await?;
        match response {
            AuthorityMessage::FlushAck { last_activity } => Ok(last_activity),
            other => Err(unexpected(other)),
        }
    }

    async fn terminate(
        &self,
        session_id: &SessionId,
        reason: TerminationReason,
    ) -> Result<SessionSummary> {
        let response = self
            .request(ClientMessage::terminate(session_id.clone(), reason))
            .await?;
        match response {
            AuthorityMessage::Terminated { summary } => Ok(*summary),
            other => Err(unexpected(other)),
        }
    }

    async fn history(&self, owner: &OwnerId) -> Result<Vec<SessionSummary>> {
        let response = self.request(ClientMessage::history(owner.clone())).await?;
        match response {
            AuthorityMessage::HistoryList { summaries } => Ok(summaries),
            other => Err(unexpected(other)),
        }
    }
}

/// Unwraps the shared `ActiveSession` response shape.
fn expect_active_session(response: AuthorityMessage) -> Result<Option<Session>> {
    match response {
        AuthorityMessage::ActiveSession { session, .. } => Ok(session.map(|s| *s)),
        other => Err(unexpected(other)),
    }
}

/// Turns an authority error message into a typed client error; anything
/// else is a protocol violation.
fn unexpected(response: AuthorityMessage) -> ClientError {
    match response {
        AuthorityMessage::Error {
            code,
            message,
            existing,
        } => ClientError::from_wire(code, message, existing),
        other => ClientError::Protocol(format!("unexpected response: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_clock;
    use kata_protocol::ErrorCode;

    #[test]
    fn test_config_defaults() {
        let config = AuthorityConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/katad.sock"));
        assert_eq!(config.connect_attempts, 3);
        assert!((config.retry_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unexpected_maps_wire_errors() {
        let err = unexpected(AuthorityMessage::error(ErrorCode::NotFound, "gone"));
        assert!(matches!(err, ClientError::SessionGone));

        let err = unexpected(AuthorityMessage::pong(1));
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_connect_fails_without_daemon() {
        let config = AuthorityConfig {
            socket_path: PathBuf::from("/tmp/kata-test-no-such-socket.sock"),
            retry_initial_delay: Duration::from_millis(1),
            connect_attempts: 2,
            ..Default::default()
        };

        let result = AuthorityClient::connect(config, shared_clock(Utc::now())).await;
        assert!(matches!(result, Err(ClientError::Network(_))));
    }

    #[tokio::test]
    async fn test_lazy_client_reports_no_policy() {
        let client = AuthorityClient::new_lazy(
            AuthorityConfig::default(),
            shared_clock(Utc::now()),
        );
        assert!(client.policy().is_none());
    }
}
