//! Gateway error taxonomy
//!
//! Every failure surfaced by a connector or a route invocation is a
//! [`GatewayError`]. [`GatewayError::kind`] maps it onto the stable,
//! externally visible kind strings (`circuit_open`, `rate_limited`, ...).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Stable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircuitOpen,
    RateLimited,
    Timeout,
    TransportError,
    TransformError,
    AggregationFailure,
    ConfigurationError,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::TransformError => "transform_error",
            ErrorKind::AggregationFailure => "aggregation_failure",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mapping's failure inside a route invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingFailure {
    pub connector_id: String,
    pub priority: i32,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl MappingFailure {
    pub fn new(connector_id: &str, priority: i32, error: &GatewayError) -> Self {
        Self {
            connector_id: connector_id.to_string(),
            priority,
            kind: error.kind(),
            message: error.to_string(),
            retry_after_secs: error.retry_after_secs(),
        }
    }
}

/// Gateway errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Circuit breaker is open for connector: {connector}")]
    CircuitOpen { connector: String },

    #[error("Connector {connector} is not accepting requests (state: {phase})")]
    Unavailable { connector: String, phase: String },

    #[error("Rate limit exceeded for connector {connector}, retry in {retry_after_secs}s")]
    RateLimited {
        connector: String,
        retry_after_secs: u64,
    },

    #[error("Request to connector {connector} timed out after {timeout_ms}ms")]
    Timeout { connector: String, timeout_ms: u64 },

    #[error("Transport error from connector {connector}: {message}")]
    Transport {
        connector: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Route {route} failed: {}", summarize(.failures))]
    Aggregation {
        route: String,
        failures: Vec<MappingFailure>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

fn summarize(failures: &[MappingFailure]) -> String {
    match failures.last() {
        None => "no enabled mappings".to_string(),
        Some(last) => format!(
            "{} mapping(s) failed, last: [{}] {}",
            failures.len(),
            last.kind,
            last.message
        ),
    }
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::CircuitOpen { .. } | GatewayError::Unavailable { .. } => {
                ErrorKind::CircuitOpen
            }
            GatewayError::RateLimited { .. } => ErrorKind::RateLimited,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::Transport { .. } => ErrorKind::TransportError,
            GatewayError::Transform(_) => ErrorKind::TransformError,
            GatewayError::Aggregation { .. } => ErrorKind::AggregationFailure,
            GatewayError::Configuration(_) => ErrorKind::ConfigurationError,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Whether the connector's retry policy applies to this error
    ///
    /// Breaker and limiter denials are terminal for the attempt. Client errors
    /// (4xx) are the caller's fault and will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout { .. } => true,
            GatewayError::Transport { status, .. } => {
                !matches!(status, Some(s) if (400..500).contains(s))
            }
            _ => false,
        }
    }

    /// Whether this error should count against the circuit breaker
    pub fn is_upstream_failure(&self) -> bool {
        self.is_retryable()
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
