//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ws_connections_active` (gauge): live connections by path
//! - `ws_connections_total` (counter): accepted upgrades by path
//! - `ws_connections_closed_total` (counter): finished connections by path
//! - `ws_handshake_failures_total` (counter): rejected upgrades by reason
//! - `ws_frames_received_total` (counter): inbound frames by opcode
//! - `ws_protocol_errors_total` (counter): connections torn down by kind
//! - `ws_broadcasts_total` (counter): fan-outs by path
//! - `ws_evictions_total` (counter): connections dropped for a full queue
//!
//! # Design Decisions
//! - Labels are the endpoint path, never the peer address
//! - The exporter runs its own listener, separate from the upgrade port

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::ws::Opcode;

/// Start the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn connection_opened(path: &str) {
    counter!("ws_connections_total", "path" => path.to_string()).increment(1);
}

pub fn connection_closed(path: &str) {
    counter!("ws_connections_closed_total", "path" => path.to_string()).increment(1);
}

pub fn set_live_connections(path: &str, live: usize) {
    gauge!("ws_connections_active", "path" => path.to_string()).set(live as f64);
}

pub fn handshake_failed(reason: &'static str) {
    counter!("ws_handshake_failures_total", "reason" => reason).increment(1);
}

pub fn frame_received(opcode: Opcode) {
    counter!("ws_frames_received_total", "opcode" => opcode.as_str()).increment(1);
}

pub fn protocol_error(kind: &'static str) {
    counter!("ws_protocol_errors_total", "kind" => kind).increment(1);
}

pub fn broadcast_sent(path: &str) {
    counter!("ws_broadcasts_total", "path" => path.to_string()).increment(1);
}

pub fn connection_evicted(path: &str) {
    counter!("ws_evictions_total", "path" => path.to_string()).increment(1);
}
