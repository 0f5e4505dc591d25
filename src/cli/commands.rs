use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::fmt::Write as FmtWrite;
use tracing::debug;

use super::OutputFormat;
use crate::cache::generate_key;
use crate::config::GatewayConfig;
use crate::gateway::Gateway;
use crate::routing::RouteOutcome;

/// Parse `name=value` arguments; the value may itself contain `=`
pub fn parse_params(params: &[String]) -> Result<Vec<(String, String)>> {
    params
        .iter()
        .map(|param| match param.split_once('=') {
            Some((name, _)) if name.is_empty() => bail!("Empty parameter name in '{}'", param),
            Some((name, value)) => Ok((name.to_string(), value.to_string())),
            None => bail!("Invalid parameter '{}', expected name=value", param),
        })
        .collect()
}

/// Invoke a route once and print the outcome
pub async fn cmd_invoke(
    gateway: &Gateway,
    route: &str,
    input: &str,
    format: OutputFormat,
) -> Result<()> {
    let input: Value = serde_json::from_str(input).context("Route input is not valid JSON")?;
    debug!(route = %route, "Invoking route");

    let outcome = gateway
        .invoke(route, input)
        .await
        .with_context(|| format!("Route {} failed", route))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        OutputFormat::Text => {
            print!("{}", summarize_outcome(&outcome));
            println!("{}", serde_json::to_string_pretty(&outcome.data)?);
        }
    }
    Ok(())
}

fn summarize_outcome(outcome: &RouteOutcome) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "route:    {} ({})", outcome.route, outcome.strategy);
    for response in &outcome.responses {
        let mut flags = Vec::new();
        if response.cached {
            flags.push("cached");
        }
        if response.stale {
            flags.push("stale");
        }
        let _ = writeln!(
            out,
            "  ok      {} [priority {}] {}",
            response.connector_id,
            response.priority,
            flags.join(",")
        );
    }
    for failure in &outcome.failures {
        let _ = writeln!(
            out,
            "  failed  {} [priority {}] {}: {}",
            failure.connector_id, failure.priority, failure.kind, failure.message
        );
    }
    out
}

/// Print the cache key for a request signature
pub fn cmd_key(method: &str, path: &str, params: &[String]) -> Result<()> {
    let params = parse_params(params)?;
    println!("{}", generate_key(method, path, params));
    Ok(())
}

/// Validate configuration and list what it defines
pub fn cmd_check(config: &GatewayConfig, format: OutputFormat) -> Result<()> {
    config.validate().context("Configuration is invalid")?;

    match format {
        OutputFormat::Json => {
            let mut connectors: Vec<_> = config.connectors.values().collect();
            connectors.sort_by(|a, b| a.id.cmp(&b.id));
            let routes: Vec<Value> = config
                .route_names()
                .iter()
                .filter_map(|name| config.routes.get(name).map(|route| (name, route)))
                .map(|(name, route)| {
                    json!({
                        "name": name,
                        "strategy": route.strategy,
                        "fail_on_any_error": route.fail_on_any_error,
                        "mappings": route.mappings,
                    })
                })
                .collect();
            let doc = json!({ "connectors": connectors, "routes": routes });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Text => {
            print!("{}", describe_config(config));
            println!("Configuration OK");
        }
    }
    Ok(())
}

/// Human-readable listing of connectors and routes
pub fn describe_config(config: &GatewayConfig) -> String {
    let mut out = String::new();

    let mut ids: Vec<&String> = config.connectors.keys().collect();
    ids.sort();
    let _ = writeln!(out, "Connectors ({}):", ids.len());
    for id in ids {
        if let Some(connector) = config.connectors.get(id) {
            let state = if connector.enabled { "" } else { " (disabled)" };
            let _ = writeln!(
                out,
                "  {:<20} {} timeout={}ms retries={}{}",
                id,
                connector.base_url,
                connector.timeout_ms,
                connector.retry.max_attempts.saturating_sub(1),
                state
            );
        }
    }

    let names = config.route_names();
    let _ = writeln!(out, "Routes ({}):", names.len());
    for name in &names {
        let Some(route) = config.routes.get(name) else {
            continue;
        };
        let _ = writeln!(out, "  {} [{}]", name, route.strategy);
        let mut mappings: Vec<_> = route.mappings.iter().collect();
        mappings.sort_by_key(|m| (m.priority, m.fallback));
        for mapping in mappings {
            let mut notes = Vec::new();
            if mapping.fallback {
                notes.push("fallback");
            }
            if !mapping.enabled {
                notes.push("disabled");
            }
            if mapping.cache.as_ref().is_some_and(|c| c.enabled) {
                notes.push("cached");
            }
            let _ = writeln!(
                out,
                "    {:>3}  {} {} {}{}",
                mapping.priority,
                mapping.method.to_ascii_uppercase(),
                mapping.connector,
                mapping.path,
                if notes.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", notes.join(", "))
                }
            );
        }
    }
    out
}
