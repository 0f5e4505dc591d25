//! Request routing and error mapping for the HTTP surface

use hyper::{Method, StatusCode};
use serde_json::{json, Value};

use crate::error::{ErrorKind, GatewayError};

/// Endpoints served by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Health,
    ListRoutes,
    InvokeRoute(String),
    ListConnectors,
    ConnectorState(String),
    Connect(String),
    Disconnect(String),
    Reset(String),
    ClearCache(String),
    CacheStats,
    Metrics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    Found(Endpoint),
    MethodNotAllowed,
    NotFound,
}

/// Match a method and path against the endpoint table
pub fn match_route(method: &Method, path: &str) -> RouteMatch {
    let parts: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|p| !p.is_empty())
        .collect();

    let (endpoint, allowed) = match parts.as_slice() {
        ["health"] => (Endpoint::Health, Method::GET),
        ["metrics"] => (Endpoint::Metrics, Method::GET),
        ["routes"] => (Endpoint::ListRoutes, Method::GET),
        ["routes", route] => (Endpoint::InvokeRoute(route.to_string()), Method::POST),
        ["connectors"] => (Endpoint::ListConnectors, Method::GET),
        ["connectors", id] => (Endpoint::ConnectorState(id.to_string()), Method::GET),
        ["connectors", id, "connect"] => (Endpoint::Connect(id.to_string()), Method::POST),
        ["connectors", id, "disconnect"] => (Endpoint::Disconnect(id.to_string()), Method::POST),
        ["connectors", id, "reset"] => (Endpoint::Reset(id.to_string()), Method::POST),
        ["connectors", id, "clear-cache"] => (Endpoint::ClearCache(id.to_string()), Method::POST),
        ["cache", "stats"] => (Endpoint::CacheStats, Method::GET),
        _ => return RouteMatch::NotFound,
    };

    if *method == allowed {
        RouteMatch::Found(endpoint)
    } else {
        RouteMatch::MethodNotAllowed
    }
}

/// HTTP status for a gateway error
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err.kind() {
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::TransformError | ErrorKind::ConfigurationError => StatusCode::BAD_REQUEST,
        ErrorKind::TransportError | ErrorKind::AggregationFailure => StatusCode::BAD_GATEWAY,
    }
}

/// JSON error document
pub fn error_body(err: &GatewayError) -> Value {
    let mut body = json!({
        "error": {
            "kind": err.kind(),
            "message": err.to_string(),
        }
    });
    if let Some(retry_after) = err.retry_after_secs() {
        body["error"]["retry_after_secs"] = json!(retry_after);
    }
    if let GatewayError::Aggregation { failures, .. } = err {
        body["error"]["failures"] = json!(failures);
    }
    body
}
