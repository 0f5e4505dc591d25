use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::cache::CacheConfig;
use crate::error::GatewayError;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};
use crate::routing::RouteConfig;

pub mod store;

pub use store::{ConfigStore, StaticConfigStore};

/// Retry policy for transport failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff, doubled after every failed attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Upper bound for a single backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// No retries, a single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn backoff_for(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms)
    }
}

/// One third-party integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Filled from the map key when loading from YAML
    #[serde(default)]
    pub id: String,

    /// Base URL every mapping path is appended to
    pub base_url: String,

    /// Headers sent with every request (API keys, accept types)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Path probed by `connect`; no probe when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_enabled() -> bool {
    true
}

impl ConnectorConfig {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            headers: BTreeMap::new(),
            timeout_ms: default_timeout_ms(),
            health_path: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            enabled: true,
        }
    }
}

/// HTTP admin/invocation server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: 127.0.0.1:8080)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Interval for writing metrics snapshots to the sink
    #[serde(default = "default_metrics_flush_secs")]
    pub metrics_flush_secs: u64,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_flush_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            metrics_flush_secs: default_metrics_flush_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Connectors by id
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorConfig>,

    /// Routes by name
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
}

impl GatewayConfig {
    /// Parse a YAML document and fill connector ids from their keys
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut config: GatewayConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        for (id, connector) in self.connectors.iter_mut() {
            connector.id = id.clone();
        }
    }

    pub fn with_connector(mut self, connector: ConnectorConfig) -> Self {
        self.connectors.insert(connector.id.clone(), connector);
        self
    }

    pub fn with_route(mut self, name: impl Into<String>, route: RouteConfig) -> Self {
        self.routes.insert(name.into(), route);
        self
    }

    /// Route names, sorted
    pub fn route_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check cross references and values serde cannot
    pub fn validate(&self) -> std::result::Result<(), GatewayError> {
        for (id, connector) in &self.connectors {
            if connector.base_url.trim().is_empty() {
                return Err(GatewayError::Configuration(format!(
                    "connector {} has an empty base_url",
                    id
                )));
            }
            if connector.timeout_ms == 0 {
                return Err(GatewayError::Configuration(format!(
                    "connector {} has a zero timeout",
                    id
                )));
            }
            if connector.retry.max_attempts == 0 {
                return Err(GatewayError::Configuration(format!(
                    "connector {} must allow at least one attempt",
                    id
                )));
            }
            if connector.circuit_breaker.failure_threshold == 0 {
                return Err(GatewayError::Configuration(format!(
                    "connector {} has a zero failure threshold",
                    id
                )));
            }
        }

        for (name, route) in &self.routes {
            for mapping in &route.mappings {
                if !self.connectors.contains_key(&mapping.connector) {
                    return Err(GatewayError::Configuration(format!(
                        "route {} references unknown connector {}",
                        name, mapping.connector
                    )));
                }
                if !mapping.path.starts_with('/') {
                    return Err(GatewayError::Configuration(format!(
                        "route {} mapping path {} must start with '/'",
                        name, mapping.path
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<GatewayConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    GatewayConfig::from_yaml_str(&content)
}

/// Apply environment overrides
///
/// - GATEWAY_LISTEN
/// - GATEWAY_CACHE_MAX_ENTRIES
/// - GATEWAY_CACHE_DEFAULT_TTL_MS
/// - GATEWAY_STALE_WHILE_REVALIDATE (true/false)
pub fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(listen) = std::env::var("GATEWAY_LISTEN") {
        config.server.listen = listen;
    }

    if let Ok(max_entries) = std::env::var("GATEWAY_CACHE_MAX_ENTRIES") {
        if let Ok(val) = max_entries.parse() {
            config.cache.max_entries = val;
        }
    }

    if let Ok(ttl) = std::env::var("GATEWAY_CACHE_DEFAULT_TTL_MS") {
        if let Ok(val) = ttl.parse() {
            config.cache.default_ttl_ms = val;
        }
    }

    if let Ok(swr) = std::env::var("GATEWAY_STALE_WHILE_REVALIDATE") {
        if let Ok(val) = swr.parse() {
            config.cache.stale_while_revalidate = val;
        }
    }
}

/// Load, override and validate the configuration
///
/// Uses `config_path` if given, otherwise `GATEWAY_CONFIG` (a `.env` file is
/// honoured). Without either an empty configuration is returned, which is
/// still valid but serves no routes.
pub fn load_config(config_path: Option<&str>) -> Result<GatewayConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let path = config_path
        .map(str::to_string)
        .or_else(|| std::env::var("GATEWAY_CONFIG").ok());

    let mut config = match path {
        Some(path) => load_from_yaml(&path)?,
        None => GatewayConfig::default(),
    };

    apply_env_overrides(&mut config);
    config.validate().context("Invalid gateway configuration")?;
    Ok(config)
}
