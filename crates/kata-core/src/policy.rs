//! Staleness and cadence policy.
//!
//! Every threshold here is deployment policy, not a protocol constant:
//! the daemon loads them from its config file and clients receive the
//! cadence values they need at connection time or via their own config.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configurable thresholds governing staleness, sweeps, and client cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessPolicy {
    /// An `Active` session whose last activity is older than this is
    /// expired by the sweep. Heartbeats normally refresh well inside it.
    pub idle_timeout_secs: u64,

    /// A `Paused` session is exempt from the idle timeout (its heartbeat
    /// is deliberately suspended) but expires after this long paused.
    pub pause_timeout_secs: u64,

    /// How often the authority runs the staleness sweep.
    pub sweep_interval_secs: u64,

    /// Client presence heartbeat cadence.
    pub heartbeat_interval_secs: u64,

    /// Client analytics flush cadence; a crash loses at most one interval.
    pub flush_interval_secs: u64,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 180,
            pause_timeout_secs: 86_400,
            sweep_interval_secs: 30,
            heartbeat_interval_secs: 25,
            flush_interval_secs: 20,
        }
    }
}

impl StalenessPolicy {
    pub fn idle_timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.idle_timeout_secs as i64)
    }

    pub fn pause_timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.pause_timeout_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}
