//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → endpoints registered once at start-up
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; endpoints are static for the process
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, EndpointConfig, HandlerKind, ListenerConfig, ObservabilityConfig, ServerConfig,
    TimeoutConfig,
};
pub use validation::ValidationError;
