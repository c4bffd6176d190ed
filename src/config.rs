//! Daemon configuration.
//!
//! Assembled from CLI flags in the binary; serde derives keep it dumpable
//! for diagnostics and reusable from tests.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default TCP listen port.
pub const DEFAULT_PORT: u16 = 1752;
/// Default seconds between ping passes.
pub const DEFAULT_PING_DELAY: u64 = 60;
/// Default seconds of probe silence before a host is marked dead.
pub const DEFAULT_DEAD_TIME: u64 = 120;
/// Default seconds between expiry notifications for one host (6 hours).
pub const DEFAULT_NOTIFY_INTERVAL: u64 = 6 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port the daemon listens on.
    pub port: u16,
    /// Path of the durable state snapshot.
    pub state_file: PathBuf,
    /// Seconds between liveness passes; also the idle tick of the server.
    pub ping_delay: u64,
    /// Seconds of probe silence before an idle host is marked dead.
    pub dead_time: u64,
    /// Whether the expiry-notification pass runs at all.
    pub notify_expired: bool,
    /// Seconds between repeat notifications for one expired reservation.
    pub notify_interval: u64,
    /// tracing EnvFilter directive; `RSVPD_LOG` overrides.
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            state_file: PathBuf::from("hosts.state"),
            ping_delay: DEFAULT_PING_DELAY,
            dead_time: DEFAULT_DEAD_TIME,
            notify_expired: true,
            notify_interval: DEFAULT_NOTIFY_INTERVAL,
            log_filter: None,
        }
    }
}
