//! Server configuration.
//!
//! Built from command-line arguments in `main.rs`; tests use `Default`.

use shared::{DEFAULT_MAX_CARS, DEFAULT_PING_TIMEOUT_SECS, DEFAULT_PORT, DEFAULT_TICK_RATE};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// IP address / interface to bind to.
    pub host: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Position broadcasts per second.
    pub tick_rate: u32,

    /// Cars a player may own at once, not counting the unicycle.
    pub max_cars: usize,

    /// Seconds without a ping before a client is disconnected.
    pub ping_timeout_secs: u64,

    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,
}

impl ServerConfig {
    /// `host:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            tick_rate: DEFAULT_TICK_RATE,
            max_cars: DEFAULT_MAX_CARS,
            ping_timeout_secs: DEFAULT_PING_TIMEOUT_SECS,
            max_clients: 32,
        }
    }
}
