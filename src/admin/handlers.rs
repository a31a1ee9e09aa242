use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::ws::EndpointStatus;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub endpoints: usize,
    pub live_connections: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let endpoints = state.registry.status();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        endpoints: endpoints.len(),
        live_connections: endpoints.iter().map(|e| e.live_connections).sum(),
    })
}

pub async fn get_endpoints(State(state): State<AdminState>) -> Json<Vec<EndpointStatus>> {
    Json(state.registry.status())
}
