//! Kata Protocol - wire protocol for authority communication.
//!
//! Defines the newline-delimited JSON messages exchanged between clients
//! (kata-client) and the session authority daemon (katad), plus the
//! protocol version handshake.

pub mod message;
pub mod version;

pub use message::{AuthorityMessage, ClientMessage, ErrorCode, RequestKind};
pub use version::{ProtocolVersion, VersionError};
