//! Endpoint registry: upgrade path → Hub.
//!
//! # Responsibilities
//! - Hold endpoint declarations made at start-up
//! - Create each endpoint's Hub on first request, exactly once
//! - Run the full upgrade procedure for the HTTP layer
//!
//! # Design Decisions
//! - Constructed once by the server and passed by reference; no global, so
//!   several registries can coexist in one test binary
//! - Endpoints cannot be removed; a Hub lives as long as its registry

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::config::{EndpointConfig, HandlerKind};
use crate::observability::metrics;
use crate::ws::connection::Connection;
use crate::ws::handler::{Echo, EndpointHandler, Relay};
use crate::ws::handshake::{self, HandshakeError, SocketTakeover};
use crate::ws::hub::{Hub, HubHandle};

/// Runtime limits for one endpoint. Immutable once the Hub exists.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// Largest accepted frame payload in bytes.
    pub max_message_size: usize,
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Slack added to `ping_interval` to form the read deadline.
    pub read_grace: Duration,
    /// Bound on a single socket write.
    pub write_timeout: Duration,
    /// Slots in each connection's outbound queue.
    pub outbound_capacity: usize,
    /// Accepted `Origin` values; empty disables the check.
    pub allowed_origins: Vec<String>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            ping_interval: Duration::from_secs(30),
            read_grace: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
            allowed_origins: Vec::new(),
        }
    }
}

impl EndpointSettings {
    /// How long the reader waits for the next frame.
    pub fn read_deadline(&self) -> Duration {
        self.ping_interval + self.read_grace
    }

    /// Name of the first limit that must be non-zero but is zero.
    fn zero_field(&self) -> Option<&'static str> {
        if self.max_message_size == 0 {
            Some("max_message_size")
        } else if self.ping_interval.is_zero() {
            Some("ping_interval")
        } else if self.write_timeout.is_zero() {
            Some("write_timeout")
        } else if self.outbound_capacity == 0 {
            Some("outbound_capacity")
        } else {
            None
        }
    }
}

impl From<&EndpointConfig> for EndpointSettings {
    fn from(config: &EndpointConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            read_grace: Duration::from_secs(config.read_grace_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            outbound_capacity: config.outbound_capacity,
            allowed_origins: config.allowed_origins.clone(),
        }
    }
}

/// An endpoint declaration: path, limits and callbacks.
pub struct Endpoint {
    pub path: String,
    pub settings: EndpointSettings,
    pub handler: Arc<dyn EndpointHandler>,
}

impl Endpoint {
    pub fn new(
        path: impl Into<String>,
        settings: EndpointSettings,
        handler: Arc<dyn EndpointHandler>,
    ) -> Self {
        Self {
            path: path.into(),
            settings,
            handler,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("path", &self.path)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("endpoint {0} is already registered")]
    Duplicate(String),

    #[error("endpoint path {0:?} must start with '/'")]
    InvalidPath(String),

    #[error("endpoint {path}: {field} must be greater than zero")]
    InvalidSettings { path: String, field: &'static str },
}

/// Snapshot of one endpoint for the admin API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EndpointStatus {
    pub path: String,
    pub hub_running: bool,
    pub live_connections: usize,
    pub max_message_size: usize,
    pub ping_interval_secs: u64,
}

/// Maps upgrade paths to their endpoint and lazily created Hub.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<String, Arc<Endpoint>>,
    hubs: DashMap<String, HubHandle>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every configured endpoint with its built-in handler.
    pub fn from_config(endpoints: &[EndpointConfig]) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for endpoint in endpoints {
            let handler: Arc<dyn EndpointHandler> = match endpoint.handler {
                HandlerKind::Echo => Arc::new(Echo),
                HandlerKind::Relay => Arc::new(Relay),
            };
            registry.register_endpoint(endpoint.path.clone(), endpoint.into(), handler)?;
        }
        Ok(registry)
    }

    /// Declare an endpoint. Meant for start-up, before traffic arrives.
    pub fn register_endpoint(
        &self,
        path: impl Into<String>,
        settings: EndpointSettings,
        handler: Arc<dyn EndpointHandler>,
    ) -> Result<(), RegistryError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(RegistryError::InvalidPath(path));
        }
        if let Some(field) = settings.zero_field() {
            return Err(RegistryError::InvalidSettings { path, field });
        }

        match self.endpoints.entry(path.clone()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(path)),
            Entry::Vacant(slot) => {
                tracing::info!(
                    path = %path,
                    max_message_size = settings.max_message_size,
                    ping_interval = ?settings.ping_interval,
                    "Endpoint registered"
                );
                slot.insert(Arc::new(Endpoint::new(path, settings, handler)));
                Ok(())
            }
        }
    }

    /// Registered endpoint paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn endpoint(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(path).map(|e| Arc::clone(e.value()))
    }

    /// The Hub for `path`, started on first use. `None` for unknown paths.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn hub(&self, path: &str) -> Option<HubHandle> {
        if let Some(hub) = self.hubs.get(path) {
            return Some(hub.clone());
        }

        let endpoint = self.endpoint(path)?;
        // The entry guard holds the shard lock, so only one caller spawns.
        let hub = self
            .hubs
            .entry(path.to_string())
            .or_insert_with(|| Hub::spawn(endpoint))
            .clone();
        Some(hub)
    }

    /// Run the upgrade procedure for a request on `path`.
    ///
    /// Every check happens before the socket is taken. On success the
    /// takeover and the connection tasks continue in the background and the
    /// accept token is returned, so an HTTP handler can build its 101.
    pub fn upgrade<T>(
        &self,
        path: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        takeover: Option<T>,
    ) -> Result<String, HandshakeError>
    where
        T: SocketTakeover,
    {
        let result = self.try_upgrade(path, headers, peer, takeover);
        if let Err(e) = &result {
            tracing::warn!(path = %path, peer = ?peer, error = %e, "Upgrade rejected");
            metrics::handshake_failed(e.reason());
        }
        result
    }

    fn try_upgrade<T>(
        &self,
        path: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        takeover: Option<T>,
    ) -> Result<String, HandshakeError>
    where
        T: SocketTakeover,
    {
        let hub = self
            .hub(path)
            .ok_or_else(|| HandshakeError::UnknownEndpoint(path.to_string()))?;
        let accept = handshake::validate(headers, &hub.endpoint().settings.allowed_origins)?;
        let takeover = takeover.ok_or(HandshakeError::UpgradeUnsupported)?;

        let token = accept.clone();
        tokio::spawn(async move {
            match takeover.take_over(token).await {
                Ok(io) => {
                    Connection::start(io, peer, hub).await;
                }
                Err(e) => {
                    tracing::warn!(path = %hub.path(), peer = ?peer, error = %e, "Socket takeover failed");
                }
            }
        });

        Ok(accept)
    }

    /// Status of every endpoint, sorted by path.
    pub fn status(&self) -> Vec<EndpointStatus> {
        self.paths()
            .into_iter()
            .filter_map(|path| {
                let endpoint = self.endpoint(&path)?;
                let hub = self.hubs.get(&path).map(|h| h.clone());
                Some(EndpointStatus {
                    hub_running: hub.is_some(),
                    live_connections: hub.map(|h| h.live_count()).unwrap_or(0),
                    max_message_size: endpoint.settings.max_message_size,
                    ping_interval_secs: endpoint.settings.ping_interval.as_secs(),
                    path,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, HeaderValue};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::ws::frame::{self, Opcode};
    use crate::ws::handler::{Echo, Message};
    use crate::ws::handshake::RawSocket;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers
    }

    fn registry() -> EndpointRegistry {
        let registry = EndpointRegistry::new();
        registry
            .register_endpoint("/echo", EndpointSettings::default(), Arc::new(Echo))
            .unwrap();
        registry
    }

    #[test]
    fn rejects_duplicates_and_bad_paths() {
        let registry = registry();
        assert_eq!(
            registry.register_endpoint("/echo", EndpointSettings::default(), Arc::new(Echo)),
            Err(RegistryError::Duplicate("/echo".into()))
        );
        assert_eq!(
            registry.register_endpoint("echo", EndpointSettings::default(), Arc::new(Echo)),
            Err(RegistryError::InvalidPath("echo".into()))
        );
        assert_eq!(registry.paths(), vec!["/echo".to_string()]);
    }

    #[test]
    fn rejects_zero_limits() {
        let registry = EndpointRegistry::new();
        let cases = [
            (
                EndpointSettings { outbound_capacity: 0, ..EndpointSettings::default() },
                "outbound_capacity",
            ),
            (
                EndpointSettings { ping_interval: Duration::ZERO, ..EndpointSettings::default() },
                "ping_interval",
            ),
            (
                EndpointSettings { write_timeout: Duration::ZERO, ..EndpointSettings::default() },
                "write_timeout",
            ),
            (
                EndpointSettings { max_message_size: 0, ..EndpointSettings::default() },
                "max_message_size",
            ),
        ];
        for (settings, field) in cases {
            assert_eq!(
                registry.register_endpoint("/zero", settings, Arc::new(Echo)),
                Err(RegistryError::InvalidSettings { path: "/zero".into(), field })
            );
        }
        assert!(registry.paths().is_empty());

        // Zero grace is allowed: the deadline is then the ping interval.
        let no_grace = EndpointSettings { read_grace: Duration::ZERO, ..EndpointSettings::default() };
        assert!(registry.register_endpoint("/zero", no_grace, Arc::new(Echo)).is_ok());
    }

    #[tokio::test]
    async fn hub_is_created_once_per_path() {
        let registry = registry();
        assert!(!registry.status()[0].hub_running);

        let first = registry.hub("/echo").unwrap();
        let second = registry.hub("/echo").unwrap();
        assert_eq!(registry.hubs.len(), 1);
        assert_eq!(first.path(), second.path());
        assert!(registry.status()[0].hub_running);
        assert!(registry.hub("/missing").is_none());
    }

    #[test]
    fn builds_from_config() {
        let endpoints = vec![
            EndpointConfig {
                path: "/ws/chat".into(),
                handler: HandlerKind::Relay,
                max_message_size: 2048,
                ..EndpointConfig::default()
            },
            EndpointConfig::default(),
        ];
        let registry = EndpointRegistry::from_config(&endpoints).unwrap();
        assert_eq!(registry.paths(), vec!["/ws".to_string(), "/ws/chat".to_string()]);
        assert_eq!(
            registry.endpoint("/ws/chat").unwrap().settings.max_message_size,
            2048
        );

        let duplicated = vec![EndpointConfig::default(), EndpointConfig::default()];
        assert!(matches!(
            EndpointRegistry::from_config(&duplicated),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn registries_are_independent() {
        let a = registry();
        let b = EndpointRegistry::new();
        a.hub("/echo").unwrap();
        assert!(b.hub("/echo").is_none());
    }

    #[tokio::test]
    async fn unsupported_takeover_is_checked_after_validation() {
        let registry = registry();

        let err = registry
            .upgrade::<RawSocket<tokio::io::DuplexStream>>("/echo", &upgrade_headers(), None, None)
            .unwrap_err();
        assert_eq!(err, HandshakeError::UpgradeUnsupported);

        // Header problems win over the missing capability.
        let err = registry
            .upgrade::<RawSocket<tokio::io::DuplexStream>>("/echo", &HeaderMap::new(), None, None)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UpgradeRequired(_)));
    }

    #[tokio::test]
    async fn unknown_endpoint() {
        let registry = registry();
        let (server, _client) = tokio::io::duplex(1024);
        let err = registry
            .upgrade("/nope", &upgrade_headers(), None, Some(RawSocket(server)))
            .unwrap_err();
        assert_eq!(err, HandshakeError::UnknownEndpoint("/nope".into()));
    }

    #[tokio::test]
    async fn raw_upgrade_serves_frames() {
        let registry = registry();
        let (server, mut client) = tokio::io::duplex(64 * 1024);

        let accept = registry
            .upgrade("/echo", &upgrade_headers(), None, Some(RawSocket(server)))
            .unwrap();
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");

        // Read the 101 head up to the blank line.
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(client.read_u8().await.unwrap());
        }
        assert!(head.starts_with(b"HTTP/1.1 101"));

        let key = [9u8, 8, 7, 6];
        let mut wire = vec![0x81, 0x80 | 4];
        wire.extend_from_slice(&key);
        wire.extend(b"ping".iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        client.write_all(&wire).await.unwrap();

        let echoed = frame::decode(&mut client, 1024).await.unwrap();
        assert_eq!(echoed.opcode, Opcode::Text);
        assert_eq!(&echoed.payload[..], b"ping");

        // Registration was queued before the reader started, so this pass
        // already sees the connection.
        let hub = registry.hub("/echo").unwrap();
        let delivery = hub.broadcast(Message::text("all")).await.unwrap();
        assert_eq!(delivery.delivered, 1);
        let pushed = frame::decode(&mut client, 1024).await.unwrap();
        assert_eq!(&pushed.payload[..], b"all");
    }
}
