//! Upgrade route handler.
//!
//! Bridges axum requests into `EndpointRegistry::upgrade`. The registry
//! does every check; this handler only gathers what it needs from the
//! request and turns the outcome into a response.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::response::{IntoResponse, Response};

use crate::ws::handshake::{switching_protocols, HyperUpgrade};
use crate::ws::EndpointRegistry;

/// Handles every request on an upgrade path, plus the fallback for unknown
/// paths so they are reported like any other refused upgrade.
pub async fn upgrade_handler(
    State(registry): State<Arc<EndpointRegistry>>,
    mut request: Request<Body>,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let path = request.uri().path().to_string();
    let takeover = HyperUpgrade::from_extensions(request.extensions_mut());

    match registry.upgrade(&path, request.headers(), peer, takeover) {
        Ok(accept) => {
            tracing::debug!(path = %path, peer = ?peer, "Switching protocols");
            switching_protocols(&accept)
        }
        Err(e) => e.into_response(),
    }
}
