//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → listeners stop accepting → axum drains in-flight requests → exit
//! ```
//!
//! # Design Decisions
//! - Upgraded connections are detached from axum and end with the runtime
//! - A second signal is not special; the first one already started shutdown

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_on_signal;
