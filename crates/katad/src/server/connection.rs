//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming requests
//! - Routes them to the registry
//! - Sends responses and broadcasts events to subscribers
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use kata_core::{OwnerId, StalenessPolicy};
use kata_protocol::{AuthorityMessage, ClientMessage, ErrorCode, ProtocolVersion, RequestKind};

use crate::registry::{RegistryError, RegistryHandle};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Information about a subscribed client
pub struct Subscriber {
    /// Writer for sending events
    pub writer: SubscriberWriter,

    /// Optional filter for owner-scoped subscriptions
    pub filter: Option<OwnerId>,
}

/// Type alias for the subscribers map
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum number of concurrent observer clients
pub const MAX_OBSERVER_CLIENTS: usize = 32;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for this connection
type ClientId = String;

/// Connection handler for a single client.
///
/// Manages the lifecycle of a client connection including:
/// - Protocol handshake
/// - Request processing loop
/// - Event subscription (for observer clients)
/// - Graceful shutdown
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer for outgoing messages (shared for event broadcast)
    writer: SubscriberWriter,

    /// Handle to the session registry
    registry: RegistryHandle,

    /// Shared subscribers map for event broadcasting
    subscribers: SubscribersMap,

    /// Policy advertised to clients at handshake
    policy: StalenessPolicy,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    /// Counter for generating client IDs
    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        registry: RegistryHandle,
        subscribers: SubscribersMap,
        policy: StalenessPolicy,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            registry,
            subscribers,
            policy,
            client_id: None,
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// This is the main entry point - performs handshake then enters
    /// the request processing loop. Returns when the connection closes.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        }

        let client_id = self.client_id.clone();

        if let Err(e) = self.process_requests().await {
            debug!(
                client_id = ?self.client_id,
                error = %e,
                "Connection closed"
            );
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// Handles the initial protocol handshake.
    ///
    /// Expects a `Hello` request from the client, validates the protocol
    /// version, and responds with `Welcome` (carrying the authority's
    /// clock reading and cadence policy) or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        // Check version compatibility using the top-level protocol_version
        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(AuthorityMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.request {
            RequestKind::Hello { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));

                self.client_id = Some(assigned_id.clone());

                self.send_message(AuthorityMessage::welcome(
                    assigned_id,
                    Utc::now(),
                    self.policy,
                ))
                .await?;

                Ok(())
            }
            other => {
                self.send_message(AuthorityMessage::error(
                    ErrorCode::Protocol,
                    "Expected hello for handshake",
                ))
                .await?;

                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Main request processing loop.
    ///
    /// Reads and processes requests until the connection closes or an
    /// unrecoverable error occurs.
    async fn process_requests(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Read with timeout for idle connections
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            match self.handle_request(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(e) => {
                    error!(
                        client_id = ?self.client_id,
                        error = %e,
                        "Error handling request"
                    );

                    // Send error response but continue processing
                    let _ = self
                        .send_message(AuthorityMessage::error(
                            ErrorCode::Protocol,
                            &e.to_string(),
                        ))
                        .await;
                }
            }
        }
    }

    /// Handles a single client request.
    async fn handle_request(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.request {
            RequestKind::Hello { .. } => {
                self.send_message(AuthorityMessage::error(
                    ErrorCode::Protocol,
                    "Already connected",
                ))
                .await?;
            }

            RequestKind::QueryActive { owner } => {
                let session = self.registry.query_active(owner).await;
                self.send_message(AuthorityMessage::active_session(session, Utc::now()))
                    .await?;
            }

            RequestKind::QueryActiveForProblem { owner, problem_id } => {
                let session = self
                    .registry
                    .query_active_for_problem(owner, problem_id)
                    .await;
                self.send_message(AuthorityMessage::active_session(session, Utc::now()))
                    .await?;
            }

            RequestKind::Create {
                owner,
                kind,
                problem,
                course,
            } => {
                let response = match self.registry.create(owner, kind, problem, course).await {
                    Ok(session) => AuthorityMessage::created(session),
                    Err(e) => registry_error_response(e),
                };
                self.send_message(response).await?;
            }

            RequestKind::Heartbeat { session_id, at } => {
                let response = match self.registry.heartbeat(session_id, at).await {
                    Ok(last_activity) => {
                        AuthorityMessage::heartbeat_ack(last_activity, Utc::now())
                    }
                    Err(e) => registry_error_response(e),
                };
                self.send_message(response).await?;
            }

            RequestKind::Pause { session_id } => {
                let response = match self.registry.pause(session_id).await {
                    Ok(session) => AuthorityMessage::state_changed(session),
                    Err(e) => registry_error_response(e),
                };
                self.send_message(response).await?;
            }

            RequestKind::Resume { session_id } => {
                let response = match self.registry.resume(session_id).await {
                    Ok(session) => AuthorityMessage::state_changed(session),
                    Err(e) => registry_error_response(e),
                };
                self.send_message(response).await?;
            }

            RequestKind::Flush {
                session_id,
                counters,
                snapshot,
            } => {
                let response = match self.registry.flush(session_id, counters, snapshot).await {
                    Ok(last_activity) => AuthorityMessage::flush_ack(last_activity),
                    Err(e) => registry_error_response(e),
                };
                self.send_message(response).await?;
            }

            RequestKind::Terminate { session_id, reason } => {
                let response = match self.registry.terminate(session_id, reason).await {
                    Ok(summary) => AuthorityMessage::terminated(summary),
                    Err(e) => registry_error_response(e),
                };
                self.send_message(response).await?;
            }

            RequestKind::History { owner } => {
                let summaries = self.registry.history(owner).await;
                self.send_message(AuthorityMessage::history_list(summaries))
                    .await?;
            }

            RequestKind::Subscribe { owner } => {
                self.handle_subscribe(owner).await?;
            }

            RequestKind::Ping { seq } => {
                self.send_message(AuthorityMessage::pong(seq)).await?;
            }

            RequestKind::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    /// Registers this connection as an event subscriber.
    async fn handle_subscribe(
        &mut self,
        owner: Option<OwnerId>,
    ) -> Result<(), ConnectionError> {
        let client_id = match &self.client_id {
            Some(id) => id.clone(),
            None => {
                self.send_message(AuthorityMessage::error(
                    ErrorCode::Protocol,
                    "Must connect before subscribing",
                ))
                .await?;
                return Ok(());
            }
        };

        {
            let mut subs = self.subscribers.write().await;

            if subs.len() >= MAX_OBSERVER_CLIENTS && !subs.contains_key(&client_id) {
                self.send_message(AuthorityMessage::error(
                    ErrorCode::Internal,
                    &format!("Too many subscribers (max: {MAX_OBSERVER_CLIENTS})"),
                ))
                .await?;
                return Ok(());
            }

            subs.insert(
                client_id.clone(),
                Subscriber {
                    writer: Arc::clone(&self.writer),
                    filter: owner.clone(),
                },
            );
        }

        debug!(
            client_id = %client_id,
            filter = ?owner,
            "Client subscribed to updates"
        );

        // For owner-scoped subscriptions, send that owner's live session
        // as the initial state.
        if let Some(owner) = owner {
            let session = self.registry.query_active(owner).await;
            self.send_message(AuthorityMessage::active_session(session, Utc::now()))
                .await?;
        }

        Ok(())
    }

    /// Reads a single message from the client.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            request = ?std::mem::discriminant(&msg.request),
            "Received request"
        );

        Ok(msg)
    }

    /// Sends a message to the client.
    async fn send_message(&self, msg: AuthorityMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(&msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        let mut writer = self.writer.lock().await;

        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Maps a registry error onto the wire.
///
/// A conflict from `create` carries the existing live session so the
/// client's recovery flow starts without another round trip.
fn registry_error_response(err: RegistryError) -> AuthorityMessage {
    match err {
        RegistryError::Conflict { existing, .. } => AuthorityMessage::conflict(
            "owner already has a live session",
            *existing,
        ),
        RegistryError::NotFound(id) => AuthorityMessage::error(
            ErrorCode::NotFound,
            &format!("session not found: {id}"),
        ),
        RegistryError::Transition(e) => {
            AuthorityMessage::error(ErrorCode::Conflict, &e.to_string())
        }
        RegistryError::Invalid(reason) => AuthorityMessage::error(ErrorCode::Invalid, &reason),
        RegistryError::CapacityExceeded { max } => AuthorityMessage::error(
            ErrorCode::Internal,
            &format!("registry is full (max: {max})"),
        ),
        RegistryError::ChannelClosed => {
            AuthorityMessage::error(ErrorCode::Internal, "registry unavailable")
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}
