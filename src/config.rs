//! Server configuration
//!
//! Command-line flags with environment fallbacks. The defaults are the
//! reference timings: ping every 30s, evict after 60s of silence, typing
//! indicators expire after 3s, 50 messages of history on join.

use std::time::Duration;

use clap::Parser;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TYPING_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const DEFAULT_COMMAND_BUFFER: usize = 256;
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Real-time chat and call-signaling relay
#[derive(Parser, Debug, Clone)]
#[command(name = "chat_relay", version, about = "Real-time chat and call-signaling relay")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CHAT_RELAY_BIND", default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Seconds between heartbeat pings
    #[arg(long, env = "CHAT_RELAY_HEARTBEAT_INTERVAL_SECS", default_value_t = DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    pub heartbeat_interval_secs: u64,

    /// Seconds of silence before a connection is closed
    #[arg(long, env = "CHAT_RELAY_HEARTBEAT_TIMEOUT_SECS", default_value_t = DEFAULT_HEARTBEAT_TIMEOUT_SECS)]
    pub heartbeat_timeout_secs: u64,

    /// Milliseconds before an unrefreshed typing indicator clears itself
    #[arg(long, env = "CHAT_RELAY_TYPING_TIMEOUT_MS", default_value_t = DEFAULT_TYPING_TIMEOUT_MS)]
    pub typing_timeout_ms: u64,

    /// Messages replayed to a connection when it joins a room
    #[arg(long, env = "CHAT_RELAY_HISTORY_LIMIT", default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub history_limit: usize,

    /// Capacity of the server actor's command channel
    #[arg(long, env = "CHAT_RELAY_COMMAND_BUFFER", default_value_t = DEFAULT_COMMAND_BUFFER)]
    pub command_buffer: usize,

    /// Per-connection outbound queue capacity
    #[arg(long, env = "CHAT_RELAY_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            typing_timeout_ms: DEFAULT_TYPING_TIMEOUT_MS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}
