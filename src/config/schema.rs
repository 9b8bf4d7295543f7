//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the edge proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the residency proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// The downstream service every request is forwarded to first.
    pub upstream: UpstreamConfig,

    /// Redirect buffering and replay settings.
    pub redirect: RedirectConfig,

    /// Buffer pool sizing.
    pub pool: PoolConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Downstream service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream address (e.g., "127.0.0.1:3000").
    pub address: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3000".to_string(),
        }
    }
}

/// Settings that drive the buffer-or-stream decision and the replay.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RedirectConfig {
    /// Inclusive status range whose responses may carry a redirect signal.
    pub buffer_status_range: (u16, u16),

    /// Response header carrying the replay target.
    pub header_name: String,

    /// Never let the replayed request gain a User-Agent the client did not send.
    pub strip_user_agent_on_replay: bool,

    /// Maximum request body size captured for replay, in bytes.
    pub max_body_bytes: usize,

    /// Deadline for the replayed round trip in seconds.
    pub replay_timeout_secs: u64,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            buffer_status_range: (400, 500),
            header_name: "X-Accel-Redirect".to_string(),
            strip_user_agent_on_replay: true,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
            replay_timeout_secs: 30,
        }
    }
}

/// Buffer pool sizing.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of idle buffers kept for reuse.
    pub max_buffers: usize,

    /// Capacity of freshly allocated buffers in bytes.
    pub initial_capacity: usize,

    /// Buffers that grew beyond this are dropped instead of returned.
    pub max_retained_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_buffers: 256,
            initial_capacity: 4096,
            max_retained_capacity: 1024 * 1024,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 60,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config.redirect.buffer_status_range, (400, 500));
        assert_eq!(config.redirect.header_name, "X-Accel-Redirect");
        assert!(config.redirect.strip_user_agent_on_replay);
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_redirect_section_parses() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [redirect]
            buffer_status_range = [404, 451]
            header_name = "X-Residency-Target"
            strip_user_agent_on_replay = false

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.redirect.buffer_status_range, (404, 451));
        assert_eq!(config.redirect.header_name, "X-Residency-Target");
        assert!(!config.redirect.strip_user_agent_on_replay);
        assert_eq!(config.redirect.replay_timeout_secs, 30);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }
}
