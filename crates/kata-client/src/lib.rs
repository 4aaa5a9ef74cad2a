//! Kata Client - per-context session lifecycle components.
//!
//! Each UI context (tab, device, embedded view) constructs its own
//! [`SessionManager`]; there is no shared in-process state between
//! contexts. The authority daemon is the only shared truth, reached
//! over the wire through [`AuthorityClient`] (or any other
//! [`SessionAuthority`] implementation).
//!
//! - `authority` - the [`SessionAuthority`] seam and its socket client
//! - `controller` - the lifecycle controller ([`SessionManager`])
//! - `recovery` - the recover-or-discard negotiation before any start
//! - `heartbeat` - the presence heartbeat task
//! - `analytics` - event aggregation and periodic flushing
//! - `store` - the local, never-authoritative session mirror
//! - `error` - the typed client error taxonomy
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod analytics;
pub mod authority;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod recovery;
pub mod store;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use kata_core::ClockReconciler;

// Re-exports for convenience
pub use analytics::{AnalyticsAggregator, LiveStats};
pub use authority::{AuthorityClient, AuthorityConfig, SessionAuthority};
pub use controller::{SessionManager, StartOutcome, StartRequest};
pub use error::{ClientError, Result};
pub use heartbeat::{HeartbeatHandle, HeartbeatHealth};
pub use recovery::{
    Negotiation, RecoveryChoice, RecoveryNegotiator, RecoveryPrompt, RecoverySummary,
};
pub use store::SessionStore;

/// Clock reconciler shared between the authority client (which re-anchors
/// it from server timestamps) and everything that computes elapsed time.
pub type SharedClock = Arc<Mutex<ClockReconciler>>;

/// Creates a shared clock anchored at a server timestamp.
pub fn shared_clock(server_now: DateTime<Utc>) -> SharedClock {
    Arc::new(Mutex::new(ClockReconciler::new(server_now)))
}

/// Reads the reconciled "now". Falls back to the local wall clock only
/// if the reconciler mutex is poisoned, which cannot happen in
/// panic-free production code.
pub(crate) fn clock_now(clock: &SharedClock) -> DateTime<Utc> {
    clock.lock().map(|c| c.now()).unwrap_or_else(|_| Utc::now())
}

/// Re-anchors the shared clock on a fresher server timestamp.
pub(crate) fn clock_sync(clock: &SharedClock, server_now: DateTime<Utc>) {
    if let Ok(mut c) = clock.lock() {
        c.sync(server_now);
    }
}
