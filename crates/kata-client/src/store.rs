//! Local session store.
//!
//! A best-effort mirror of the most recently known session record. It
//! exists to render instantly and to avoid redundant queries - never to
//! decide anything conflict-sensitive. The authority is consulted before
//! every state-mutating call; this cache is refreshed from whatever the
//! authority answers.

use std::time::Instant;

use kata_core::{Session, SessionId};
use tokio::sync::watch;

/// Read-mostly, disposable mirror of the current session.
///
/// Observers subscribe through a `watch` channel: views render from it
/// rather than running their own queries or timers.
pub struct SessionStore {
    tx: watch::Sender<Option<Session>>,
    refreshed_at: std::sync::Mutex<Option<Instant>>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            refreshed_at: std::sync::Mutex::new(None),
        }
    }

    /// Replaces the mirror with a fresh authority answer.
    pub fn update(&self, session: Option<Session>) {
        if let Ok(mut at) = self.refreshed_at.lock() {
            *at = Some(Instant::now());
        }
        // Ignore send errors - no receivers just means no observers yet
        let _ = self.tx.send(session);
    }

    /// Clears the mirror (the current session is gone).
    pub fn clear(&self) {
        self.update(None);
    }

    /// Instant read of the last known session. A hint, not the truth.
    pub fn hint(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    /// The id of the last known session, if any.
    pub fn current_id(&self) -> Option<SessionId> {
        self.tx.borrow().as_ref().map(|s| s.id.clone())
    }

    /// How long ago the mirror was refreshed from the authority.
    pub fn age(&self) -> Option<std::time::Duration> {
        self.refreshed_at
            .lock()
            .ok()
            .and_then(|at| at.map(|i| i.elapsed()))
    }

    /// Subscribe to mirror updates.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
