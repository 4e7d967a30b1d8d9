//! Server configuration, loaded from environment variables with defaults.

use std::time::Duration;

/// Defaults advertised in the open header when the environment does not
/// override them.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Outbound queue slots per channel before enqueue blocks (or, for control
/// frames, before the channel is closed as saturated).
pub const DEFAULT_OUTBOUND_QUEUE: usize = 500;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP mount point for the WebSocket endpoint.
    pub path: String,
    /// Address the demo binary binds to.
    pub addr: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Per-channel outbound queue capacity.
    pub outbound_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: "/socket.io/".to_string(),
            addr: "0.0.0.0:4100".to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl Config {
    /// Load configuration from `WAVELINK_*` environment variables, falling
    /// back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            path: std::env::var("WAVELINK_PATH").unwrap_or(defaults.path),
            addr: std::env::var("WAVELINK_ADDR").unwrap_or(defaults.addr),
            ping_interval: env_millis("WAVELINK_PING_INTERVAL_MS")
                .unwrap_or(defaults.ping_interval),
            ping_timeout: env_millis("WAVELINK_PING_TIMEOUT_MS").unwrap_or(defaults.ping_timeout),
            outbound_queue: std::env::var("WAVELINK_OUTBOUND_QUEUE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|&v| v > 0)
                .unwrap_or(defaults.outbound_queue),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
