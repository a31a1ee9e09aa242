//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes and intervals > 0, addresses parse)
//! - Detect duplicate endpoint paths
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{ServerConfig, PLACEHOLDER_API_KEY};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("endpoint path {0:?} must start with '/'")]
    InvalidPath(String),

    #[error("endpoint path {0} is declared more than once")]
    DuplicatePath(String),

    #[error("endpoint {path}: {field} must be greater than zero")]
    Zero { path: String, field: &'static str },

    #[error("timeouts.request_secs must be greater than zero")]
    ZeroRequestTimeout,

    #[error("admin.api_key must be changed before enabling the admin API")]
    PlaceholderApiKey,
}

/// Check a configuration, collecting every error.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }
    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key == PLACEHOLDER_API_KEY || config.admin.api_key.is_empty() {
            errors.push(ValidationError::PlaceholderApiKey);
        }
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::ZeroRequestTimeout);
    }

    let mut seen = HashSet::new();
    for endpoint in &config.endpoints {
        if !endpoint.path.starts_with('/') {
            errors.push(ValidationError::InvalidPath(endpoint.path.clone()));
        }
        if !seen.insert(endpoint.path.as_str()) {
            errors.push(ValidationError::DuplicatePath(endpoint.path.clone()));
        }

        let zero_checks = [
            ("max_message_size", endpoint.max_message_size as u64),
            ("ping_interval_secs", endpoint.ping_interval_secs),
            ("write_timeout_secs", endpoint.write_timeout_secs),
            ("outbound_capacity", endpoint.outbound_capacity as u64),
        ];
        for (field, value) in zero_checks {
            if value == 0 {
                errors.push(ValidationError::Zero {
                    path: endpoint.path.clone(),
                    field,
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
