//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with one upgrade route per endpoint
//! - Wire up middleware (tracing, request ID, timeout)
//! - Bind server to listener with connect info for peer addresses
//! - Stop accepting on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderName, Request};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::http::upgrade::upgrade_handler;
use crate::lifecycle::Shutdown;
use crate::ws::EndpointRegistry;

pub const X_REQUEST_ID: &str = "x-request-id";

/// HTTP server exposing the registry's endpoints.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server for every endpoint in `registry`.
    pub fn new(config: &ServerConfig, registry: Arc<EndpointRegistry>) -> Self {
        let router = Self::build_router(config, registry);
        Self { router }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ServerConfig, registry: Arc<EndpointRegistry>) -> Router {
        let mut router = Router::new();
        for path in registry.paths() {
            router = router.route(&path, get(upgrade_handler));
        }

        let request_id = HeaderName::from_static(X_REQUEST_ID);
        router
            .fallback(upgrade_handler)
            .with_state(registry)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id,
                )
            }))
            .layer(PropagateRequestIdLayer::new(request_id.clone()))
            .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
    }

    /// The fully layered router, for driving requests without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server until `shutdown` is triggered.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.signalled())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
