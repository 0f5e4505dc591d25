//! Connector request, response and snapshot types

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::cache::{generate_key, CacheStats};
use crate::resilience::{CircuitStats, RateLimitMetrics};
use crate::routing::CachePolicy;

/// Connector lifecycle phases
///
/// `disconnected → connecting → connected`, `connected ↔ degraded` while the
/// circuit breaker is not closed, and any phase `→ disconnected` on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorPhase {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl ConnectorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorPhase::Disconnected => "disconnected",
            ConnectorPhase::Connecting => "connecting",
            ConnectorPhase::Connected => "connected",
            ConnectorPhase::Degraded => "degraded",
        }
    }

    pub fn accepts_requests(&self) -> bool {
        matches!(self, ConnectorPhase::Connected | ConnectorPhase::Degraded)
    }
}

impl fmt::Display for ConnectorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call issued through [`super::Connector::execute`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorRequest {
    pub method: String,
    /// Path relative to the connector's base URL
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Merged over the connector's configured headers
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub cache: Option<CachePolicy>,
    /// Overrides the generated cache key
    pub cache_key: Option<String>,
}

impl ConnectorRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            path: path.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
            cache: None,
            cache_key: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new("POST", path).with_body(body)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Only GETs with caching enabled are served from or stored in the cache
    pub fn is_cacheable(&self) -> bool {
        self.method == "GET" && self.cache.as_ref().is_some_and(|c| c.enabled)
    }

    pub fn cache_key(&self) -> String {
        match &self.cache_key {
            Some(key) => key.clone(),
            None => generate_key(
                &self.method,
                &self.path,
                self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            ),
        }
    }
}

/// Result of a successful call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorResponse {
    pub data: Value,
    pub status: u16,
    /// Served from the response cache
    pub cached: bool,
    /// Served from the cache past its TTL; a refresh has been scheduled
    pub stale: bool,
    /// Transport attempts made; zero for cache hits
    pub attempts: u32,
    pub latency_ms: u64,
}

/// Cumulative counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectorMetrics {
    pub connector_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Denied by lifecycle, circuit breaker or rate limiter
    pub rejected_requests: u64,
    pub cache_hits: u64,
    pub stale_hits: u64,
    pub retries: u64,
    pub avg_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
}

/// Point-in-time view of a connector
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorState {
    pub connector_id: String,
    pub phase: ConnectorPhase,
    pub enabled: bool,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub circuit: CircuitStats,
    pub rate_limit: RateLimitMetrics,
    pub cache: CacheStats,
    pub metrics: ConnectorMetrics,
}
