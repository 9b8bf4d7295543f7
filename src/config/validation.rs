//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (status bounds, timeouts > 0, limits > 0)
//! - Check addresses and header names are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::HeaderName;
use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    if config.upstream.address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "upstream.address",
            format!("'{}' is not a socket address", config.upstream.address),
        ));
    }

    let (min, max) = config.redirect.buffer_status_range;
    if !(100..=599).contains(&min) || !(100..=599).contains(&max) {
        errors.push(ValidationError::new(
            "redirect.buffer_status_range",
            format!("[{min}, {max}] must lie within 100..=599"),
        ));
    }
    if min > max {
        errors.push(ValidationError::new(
            "redirect.buffer_status_range",
            format!("min {min} is greater than max {max}"),
        ));
    }
    if HeaderName::from_bytes(config.redirect.header_name.as_bytes()).is_err() {
        errors.push(ValidationError::new(
            "redirect.header_name",
            format!("'{}' is not a valid header name", config.redirect.header_name),
        ));
    }
    if config.redirect.max_body_bytes == 0 {
        errors.push(ValidationError::new("redirect.max_body_bytes", "must be > 0"));
    }
    if config.redirect.replay_timeout_secs == 0 {
        errors.push(ValidationError::new("redirect.replay_timeout_secs", "must be > 0"));
    }

    if config.pool.initial_capacity > config.pool.max_retained_capacity {
        errors.push(ValidationError::new(
            "pool.initial_capacity",
            "must not exceed pool.max_retained_capacity",
        ));
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be > 0"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
