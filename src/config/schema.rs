//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the real-time server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration for plain HTTP routes.
    pub timeouts: TimeoutConfig,

    /// WebSocket endpoint definitions.
    pub endpoints: Vec<EndpointConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeouts for ordinary request/response traffic.
///
/// Upgraded connections are governed by their endpoint's ping and write
/// settings instead.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Built-in behaviour attached to an endpoint.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Reply to each message on the same connection.
    #[default]
    Echo,
    /// Broadcast each message to every connection on the endpoint.
    Relay,
}

/// One WebSocket endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Upgrade path (e.g., "/ws/chat").
    pub path: String,

    /// Behaviour for incoming messages.
    pub handler: HandlerKind,

    /// Largest accepted frame payload in bytes.
    pub max_message_size: usize,

    /// Seconds between server pings.
    pub ping_interval_secs: u64,

    /// Extra seconds a peer gets past the ping interval before it is dropped.
    pub read_grace_secs: u64,

    /// Upper bound for a single socket write in seconds.
    pub write_timeout_secs: u64,

    /// Outbound queue slots per connection.
    pub outbound_capacity: usize,

    /// Accepted Origin values; "*" allows any. Empty disables the check.
    pub allowed_origins: Vec<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            handler: HandlerKind::default(),
            max_message_size: 1024 * 1024, // 1 MiB
            ping_interval_secs: 30,
            read_grace_secs: 10,
            write_timeout_secs: 10,
            outbound_capacity: 256,
            allowed_origins: Vec::new(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

/// Placeholder key; validation refuses it when the admin API is enabled.
pub const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: PLACEHOLDER_API_KEY.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [[endpoints]]
            path = "/ws/chat"
            handler = "relay"
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.endpoints.len(), 1);
        let chat = &config.endpoints[0];
        assert_eq!(chat.handler, HandlerKind::Relay);
        assert_eq!(chat.outbound_capacity, 256);
        assert_eq!(chat.ping_interval_secs, 30);
        assert!(chat.allowed_origins.is_empty());
    }
}
