//! Real-time connection subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP upgrade request
//!     → registry.rs (endpoint lookup, Hub created on first use)
//!     → handshake.rs (validate headers/origin, take the socket, 101)
//!     → connection.rs (reader / writer / ping tasks)
//!         ↔ frame.rs (RFC 6455 codec)
//!     → hub.rs (registration, broadcast fan-out)
//!     → handler.rs (application callbacks)
//! ```
//!
//! # Design Decisions
//! - Errors after the upgrade stay local to one connection: logged, never
//!   retried, never propagated to the Hub or other connections
//! - Fragmented messages are passed through frame by frame, unassembled
//! - No extensions or subprotocols are negotiated

pub mod connection;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod hub;
pub mod registry;

pub use connection::{Connection, ConnectionId, ConnectionState, SendError};
pub use frame::{Frame, FrameError, Opcode, ProtocolViolation};
pub use handler::{Echo, EndpointHandler, Message, Relay};
pub use handshake::{HandshakeError, HyperUpgrade, RawSocket, SocketTakeover};
pub use hub::{Delivery, Hub, HubError, HubHandle};
pub use registry::{Endpoint, EndpointRegistry, EndpointSettings, EndpointStatus, RegistryError};
