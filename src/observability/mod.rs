//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! ws, http and admin subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters and gauges labelled by endpoint path)
//!
//! Consumers:
//!     → stdout (tracing-subscriber fmt layer)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through HTTP spans
//! - Connection ID is a field on every per-connection log line
//! - Metrics are cheap (atomic increments); without an installed
//!   recorder they are no-ops, so tests need no setup

pub mod logging;
pub mod metrics;
