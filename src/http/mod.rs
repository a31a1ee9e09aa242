//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing, timeout)
//!     → upgrade.rs (hand the request to the endpoint registry)
//!     → 101 Switching Protocols, or a plain 4xx/5xx
//!     → hyper releases the socket → ws::Connection
//! ```

pub mod server;
pub mod upgrade;

pub use server::HttpServer;
