//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use realtime_hub::config::{EndpointConfig, HandlerKind, ServerConfig};
use realtime_hub::{EndpointRegistry, HttpServer, Shutdown};
use tokio::net::TcpListener;

/// A server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<EndpointRegistry>,
    pub shutdown: Shutdown,
}

impl TestServer {
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Poll until the endpoint's Hub reports `expected` live connections.
    pub async fn wait_for_live(&self, path: &str, expected: usize) {
        let hub = self.registry.hub(path).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.live_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{path} never reached {expected} live connections"));
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub fn endpoint(path: &str, handler: HandlerKind) -> EndpointConfig {
    EndpointConfig {
        path: path.to_string(),
        handler,
        ..EndpointConfig::default()
    }
}

/// The config used by `start_server`, exposed for router-level tests.
pub fn test_config(endpoints: Vec<EndpointConfig>) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.observability.metrics_enabled = false;
    config.endpoints = endpoints;
    config
}

/// Start a server with the given endpoints on 127.0.0.1:0.
pub async fn start_server(endpoints: Vec<EndpointConfig>) -> TestServer {
    let config = test_config(endpoints);
    let registry = Arc::new(EndpointRegistry::from_config(&config.endpoints).unwrap());
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server = HttpServer::new(&config, registry.clone());
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    TestServer {
        addr,
        registry,
        shutdown,
    }
}
