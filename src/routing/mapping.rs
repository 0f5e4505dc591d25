//! Route mappings and aggregation strategies

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::transform::Transform;

/// How the engine consumes a route's ordered mappings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Try mappings in order, return the first success
    #[default]
    PriorityOrder,
    /// Same termination rule as priority order, for interchangeable mappings
    FirstSuccess,
    /// Call every mapping concurrently and deep-merge the successes
    MergeResults,
    /// Call every mapping concurrently and return the successes as a list
    AllParallel,
    /// Feed each mapping's response into the next mapping's request
    Chain,
}

impl AggregationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationStrategy::PriorityOrder => "priority_order",
            AggregationStrategy::FirstSuccess => "first_success",
            AggregationStrategy::MergeResults => "merge_results",
            AggregationStrategy::AllParallel => "all_parallel",
            AggregationStrategy::Chain => "chain",
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(
            self,
            AggregationStrategy::MergeResults | AggregationStrategy::AllParallel
        )
    }
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority_order" => Ok(AggregationStrategy::PriorityOrder),
            "first_success" => Ok(AggregationStrategy::FirstSuccess),
            "merge_results" => Ok(AggregationStrategy::MergeResults),
            "all_parallel" => Ok(AggregationStrategy::AllParallel),
            "chain" => Ok(AggregationStrategy::Chain),
            other => Err(format!("unknown aggregation strategy: {}", other)),
        }
    }
}

/// Per-mapping response caching
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub enabled: bool,

    /// Overrides the cache-wide default TTL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,

    /// Template for the cache key, e.g. `hospitals:{zip}`; placeholders are
    /// filled from the request payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_template: Option<String>,

    /// Tags attached to cached entries for bulk invalidation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Binding of a route to one connector endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMapping {
    /// Connector serving this mapping
    pub connector: String,

    /// Path inside the connector; `{name}` segments are filled from the payload
    pub path: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Lower is tried first
    #[serde(default)]
    pub priority: i32,

    /// Ordered after non-fallback mappings of equal priority
    #[serde(default)]
    pub fallback: bool,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_transform: Option<Transform>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_transform: Option<Transform>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePolicy>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_enabled() -> bool {
    true
}

impl RouteMapping {
    pub fn new(connector: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            path: path.into(),
            method: default_method(),
            priority: 0,
            fallback: false,
            enabled: true,
            request_transform: None,
            response_transform: None,
            cache: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn as_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_request_transform(mut self, transform: Transform) -> Self {
        self.request_transform = Some(transform);
        self
    }

    pub fn with_response_transform(mut self, transform: Transform) -> Self {
        self.response_transform = Some(transform);
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// A route: strategy plus its mappings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub strategy: AggregationStrategy,

    /// Fail the invocation if any mapping fails, even with partial successes
    #[serde(default)]
    pub fail_on_any_error: bool,

    #[serde(default)]
    pub mappings: Vec<RouteMapping>,
}

impl RouteConfig {
    pub fn new(strategy: AggregationStrategy, mappings: Vec<RouteMapping>) -> Self {
        Self {
            strategy,
            fail_on_any_error: false,
            mappings,
        }
    }

    /// Enabled mappings ordered by priority, non-fallback first on ties,
    /// insertion order otherwise
    pub fn ordered_mappings(&self) -> Vec<&RouteMapping> {
        let mut mappings: Vec<&RouteMapping> = self.mappings.iter().filter(|m| m.enabled).collect();
        mappings.sort_by_key(|m| (m.priority, m.fallback));
        mappings
    }
}

/// A successful mapping result inside a route outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingSuccess {
    pub connector_id: String,
    pub priority: i32,
    pub data: Value,
    pub cached: bool,
    pub stale: bool,
}
