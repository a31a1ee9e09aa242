//! Admin API.
//!
//! Read-only views over the endpoint registry, served on their own listener
//! behind a bearer token.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};

use crate::ws::EndpointRegistry;

use self::auth::admin_auth_middleware;
use self::handlers::{get_endpoints, get_status};

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<EndpointRegistry>,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/endpoints", get(get_endpoints))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    use crate::ws::{Echo, EndpointSettings};

    fn state() -> AdminState {
        let registry = Arc::new(EndpointRegistry::new());
        registry
            .register_endpoint("/ws/echo", EndpointSettings::default(), Arc::new(Echo))
            .unwrap();
        AdminState {
            registry,
            api_key: Arc::from("secret"),
        }
    }

    #[tokio::test]
    async fn requires_bearer_token() {
        let app = setup_admin_router(state());

        let missing = Request::get("/admin/status").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let wrong = Request::get("/admin/status")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(wrong).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn lists_endpoints() {
        let app = setup_admin_router(state());
        let request = Request::get("/admin/endpoints")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let endpoints: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0]["path"], "/ws/echo");
        assert_eq!(endpoints[0]["hub_running"], false);
    }
}
