//! Kata Daemon - the practice session authority.
//!
//! This crate provides the core infrastructure for the katad daemon:
//! - `registry` - Session registry actor owning the authoritative record
//!   of every live session (one per owner) and the finalized history
//! - `server` - Unix socket server for client connections
//! - `monitor` - Daemon self-monitoring (CPU/memory/occupancy)
//! - `config` - Toml/env configuration including the staleness policy
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      katad daemon                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ AuthorityServer │────▶│     RegistryActor           │   │
//! │  │ (Unix Socket)   │     │  (session state owner)      │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ events            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│     │   broadcast::Sender         │   │
//! │  │  (per client)   │     │   (event distribution)      │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry actor processes commands sequentially; that is the
//! mechanism enforcing at most one live session per owner even under
//! concurrent create attempts from different connections.
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod monitor;
pub mod registry;
pub mod server;
