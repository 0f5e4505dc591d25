//! Route aggregation engine
//!
//! Stateless per invocation: it loads the route, orders its enabled
//! mappings and dispatches once on the route's [`AggregationStrategy`].
//! Transforms run strictly at the mapping boundary, so connectors never see
//! strategy details. Retries belong to the connector, never to the engine.

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::mapping::{AggregationStrategy, MappingSuccess, RouteConfig, RouteMapping};
use super::merge::deep_merge;
use super::transform::{apply_request, apply_response, fill_path, render_key};
use crate::cache::query_value;
use crate::config::ConfigStore;
use crate::connector::{ConnectorRegistry, ConnectorRequest};
use crate::error::{GatewayError, MappingFailure, Result};

/// Result of a route invocation
#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub route: String,
    pub strategy: AggregationStrategy,
    /// Strategy result: a single response, a list, or a merged object
    pub data: Value,
    /// Successful mappings in priority order
    pub responses: Vec<MappingSuccess>,
    /// Failed mappings in priority order; partial failures are never dropped
    pub failures: Vec<MappingFailure>,
}

/// Build the connector request for a mapping from its transformed payload
///
/// `{name}` path segments consume payload fields. For GET the remaining
/// scalar fields become query parameters, otherwise the payload is sent as
/// the JSON body.
pub fn build_request(mapping: &RouteMapping, payload: &Value) -> Result<ConnectorRequest> {
    let (path, used) = fill_path(&mapping.path, payload)?;
    let mut request = ConnectorRequest::new(mapping.method.as_str(), path);

    if request.method == "GET" {
        if let Value::Object(fields) = payload {
            for (key, value) in fields {
                if used.iter().any(|u| u == key) {
                    continue;
                }
                match value {
                    Value::Null | Value::Object(_) => {}
                    Value::Array(items) => {
                        let joined: Vec<String> = items.iter().map(query_value).collect();
                        request.query.push((key.clone(), joined.join(",")));
                    }
                    scalar => request.query.push((key.clone(), query_value(scalar))),
                }
            }
        }
    } else if !payload.is_null() {
        request.body = Some(payload.clone());
    }

    if let Some(policy) = &mapping.cache {
        if let Some(template) = &policy.key_template {
            request.cache_key = Some(render_key(template, payload)?);
        }
        request.cache = Some(policy.clone());
    }

    Ok(request)
}

/// Dispatches route invocations over the connector registry
pub struct AggregationEngine {
    connectors: Arc<ConnectorRegistry>,
    store: Arc<dyn ConfigStore>,
}

impl AggregationEngine {
    pub fn new(connectors: Arc<ConnectorRegistry>, store: Arc<dyn ConfigStore>) -> Self {
        Self { connectors, store }
    }

    pub fn connectors(&self) -> &Arc<ConnectorRegistry> {
        &self.connectors
    }

    /// Invoke a configured route
    pub async fn invoke(&self, route: &str, input: Value) -> Result<RouteOutcome> {
        let config = self.store.route(route).await?;
        self.invoke_route(route, &config, input).await
    }

    /// Invoke an explicit route definition
    pub async fn invoke_route(
        &self,
        route: &str,
        config: &RouteConfig,
        input: Value,
    ) -> Result<RouteOutcome> {
        let mappings = config.ordered_mappings();
        if mappings.is_empty() {
            warn!(route = %route, "Route has no enabled mappings");
            return Err(GatewayError::Aggregation {
                route: route.to_string(),
                failures: Vec::new(),
            });
        }

        debug!(
            route = %route,
            strategy = %config.strategy,
            mappings = mappings.len(),
            "Invoking route"
        );

        let result = match config.strategy {
            AggregationStrategy::PriorityOrder | AggregationStrategy::FirstSuccess => {
                self.run_in_order(route, config, &mappings, &input).await
            }
            AggregationStrategy::AllParallel | AggregationStrategy::MergeResults => {
                self.run_parallel(route, config, &mappings, &input).await
            }
            AggregationStrategy::Chain => self.run_chain(route, &mappings, &input).await,
        };

        match &result {
            Ok(outcome) => info!(
                route = %route,
                strategy = %config.strategy,
                succeeded = outcome.responses.len(),
                failed = outcome.failures.len(),
                "Route completed"
            ),
            Err(err) => warn!(
                route = %route,
                strategy = %config.strategy,
                kind = %err.kind(),
                error = %err,
                "Route failed"
            ),
        }
        result
    }

    /// Transform, call and transform back one mapping
    async fn call_mapping(
        &self,
        mapping: &RouteMapping,
        input: &Value,
        previous: Option<&Value>,
    ) -> Result<MappingSuccess> {
        let payload = apply_request(mapping.request_transform.as_ref(), input, previous)?;
        let request = build_request(mapping, &payload)?;
        let connector = self.connectors.get_or_create(&mapping.connector).await?;

        let deadline = connector.deadline();
        let response = tokio::time::timeout(deadline, connector.execute(request))
            .await
            .map_err(|_| GatewayError::Timeout {
                connector: mapping.connector.clone(),
                timeout_ms: deadline.as_millis() as u64,
            })??;

        let data = apply_response(mapping.response_transform.as_ref(), &response.data)?;
        debug!(
            connector_id = %mapping.connector,
            priority = mapping.priority,
            cached = response.cached,
            "Mapping succeeded"
        );

        Ok(MappingSuccess {
            connector_id: mapping.connector.clone(),
            priority: mapping.priority,
            data,
            cached: response.cached,
            stale: response.stale,
        })
    }

    /// `priority_order` and `first_success`: stop at the first success
    async fn run_in_order(
        &self,
        route: &str,
        config: &RouteConfig,
        mappings: &[&RouteMapping],
        input: &Value,
    ) -> Result<RouteOutcome> {
        let mut failures = Vec::new();

        for mapping in mappings {
            match self.call_mapping(mapping, input, None).await {
                Ok(success) => {
                    return Ok(RouteOutcome {
                        route: route.to_string(),
                        strategy: config.strategy,
                        data: success.data.clone(),
                        responses: vec![success],
                        failures,
                    });
                }
                Err(err) => {
                    debug!(
                        route = %route,
                        connector_id = %mapping.connector,
                        error = %err,
                        "Mapping failed, trying next"
                    );
                    failures.push(MappingFailure::new(&mapping.connector, mapping.priority, &err));
                    if config.fail_on_any_error {
                        break;
                    }
                }
            }
        }

        Err(GatewayError::Aggregation {
            route: route.to_string(),
            failures,
        })
    }

    /// `all_parallel` and `merge_results`: every mapping at once, then settle
    async fn run_parallel(
        &self,
        route: &str,
        config: &RouteConfig,
        mappings: &[&RouteMapping],
        input: &Value,
    ) -> Result<RouteOutcome> {
        let results = join_all(
            mappings
                .iter()
                .map(|mapping| self.call_mapping(mapping, input, None)),
        )
        .await;

        let mut responses = Vec::new();
        let mut failures = Vec::new();
        for (mapping, result) in mappings.iter().zip(results) {
            match result {
                Ok(success) => responses.push(success),
                Err(err) => {
                    failures.push(MappingFailure::new(&mapping.connector, mapping.priority, &err))
                }
            }
        }

        if responses.is_empty() || (config.fail_on_any_error && !failures.is_empty()) {
            return Err(GatewayError::Aggregation {
                route: route.to_string(),
                failures,
            });
        }

        let data = match config.strategy {
            AggregationStrategy::MergeResults => merge_responses(&responses),
            _ => Value::Array(responses.iter().map(|r| r.data.clone()).collect()),
        };

        Ok(RouteOutcome {
            route: route.to_string(),
            strategy: config.strategy,
            data,
            responses,
            failures,
        })
    }

    /// `chain`: each response feeds the next request; the first failure ends it
    async fn run_chain(
        &self,
        route: &str,
        mappings: &[&RouteMapping],
        input: &Value,
    ) -> Result<RouteOutcome> {
        let mut responses: Vec<MappingSuccess> = Vec::with_capacity(mappings.len());

        for (step, mapping) in mappings.iter().enumerate() {
            let previous = responses.last().map(|r| &r.data);
            match self.call_mapping(mapping, input, previous).await {
                Ok(success) => responses.push(success),
                Err(err) => {
                    warn!(
                        route = %route,
                        step,
                        connector_id = %mapping.connector,
                        error = %err,
                        "Chain stopped"
                    );
                    return Err(err);
                }
            }
        }

        Ok(RouteOutcome {
            route: route.to_string(),
            strategy: AggregationStrategy::Chain,
            data: responses.last().map(|r| r.data.clone()).unwrap_or(Value::Null),
            responses,
            failures: Vec::new(),
        })
    }
}

/// Deep-merge responses in priority order; earlier responses win collisions
///
/// If the highest-priority response is not an object it is returned as is.
fn merge_responses(responses: &[MappingSuccess]) -> Value {
    let mut iter = responses.iter();
    let mut merged = match iter.next() {
        Some(first) => first.data.clone(),
        None => return Value::Null,
    };
    if !merged.is_object() {
        return merged;
    }
    for response in iter {
        deep_merge(&mut merged, &response.data);
    }
    merged
}
