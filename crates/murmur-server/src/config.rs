//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the chat server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    pub heartbeat_interval_secs: u64,
    /// Connections silent for longer than this are reaped.
    pub client_timeout_secs: u64,
    /// How often a process tails the shared bus table.
    pub bus_poll_interval_ms: u64,
    /// How long published events stay in the shared bus table.
    pub bus_retention_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_send_queue: 256,
            max_message_size: 1024 * 1024,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            bus_poll_interval_ms: 100,
            bus_retention_secs: 300,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn bus_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bus_poll_interval_ms)
    }

    pub fn bus_retention(&self) -> Duration {
        Duration::from_secs(self.bus_retention_secs)
    }
}
