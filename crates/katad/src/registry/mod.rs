//! Session registry using the actor pattern.
//!
//! The registry is the single shared, authoritative state of the system:
//! every live session, keyed by owner, plus the append-only history of
//! finalized sessions. It receives commands via a tokio mpsc channel and
//! processes them strictly in order, so concurrent creates for the same
//! owner serialize here and exactly one can win.
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ Client contexts │────▶│  RegistryActor  │────▶│ Broadcast Channel │
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   RegistryCommand     │   SessionEvent        │
//!         │   (mpsc channel)      │   (broadcast)         │
//!         ▼                       ▼                       ▼
//!    create/heartbeat/      HashMap<OwnerId,        Observer clients
//!    pause/terminate        Session> + history      receive events
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::time::Duration;

use kata_core::StalenessPolicy;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::debug;

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, MAX_LIVE_SESSIONS};
pub use commands::{RegistryCommand, RegistryError, RegistryStats, SessionEvent};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and event channels
/// 2. Spawns the RegistryActor on a tokio task
/// 3. Spawns the background staleness sweep task
/// 4. Returns a RegistryHandle for client use
///
/// # Example
///
/// ```no_run
/// use katad::registry::spawn_registry;
/// use kata_core::StalenessPolicy;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(StalenessPolicy::default());
///
///     let session = handle.query_active("learner-1".into()).await;
/// }
/// ```
pub fn spawn_registry(policy: StalenessPolicy) -> RegistryHandle {
    // Create channels
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    // Create and spawn actor
    let actor = RegistryActor::new(cmd_rx, event_tx.clone(), policy);
    tokio::spawn(actor.run());

    // Create handle
    let handle = RegistryHandle::new(cmd_tx.clone(), event_tx);

    // Spawn the staleness sweep
    spawn_sweep_task(cmd_tx, policy.sweep_interval());

    handle
}

/// Spawn a background task that triggers periodic staleness sweeps.
///
/// Only the sweep may expire a session; disconnected clients never
/// decide staleness on their own.
fn spawn_sweep_task(sender: mpsc::Sender<RegistryCommand>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(every);

        loop {
            ticker.tick().await;

            // Fire-and-forget sweep command
            if sender.send(RegistryCommand::SweepStale).await.is_err() {
                // Channel closed, actor stopped - exit sweep task
                debug!("Sweep task stopping: registry channel closed");
                break;
            }

            debug!("Triggered staleness sweep");
        }
    });
}
