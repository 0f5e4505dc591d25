//! Request and response transforms applied at the mapping boundary
//!
//! A [`Transform`] optionally narrows its scope with a JSON pointer
//! (`select`) and optionally re-shapes it with a JSON template whose string
//! leaves may contain `{{dotted.path}}` placeholders. A string that is a
//! single placeholder is replaced by the referenced value itself; embedded
//! placeholders are interpolated as text. A trailing `?` (`{{input.zip?}}`)
//! makes a placeholder optional.
//!
//! Request transforms see `{ "input": ..., "previous": ... }`, response
//! transforms see `{ "response": ... }`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::cache::query_value;
use crate::connector::encode_component;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// JSON pointer into the transform context, e.g. `/response/data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,

    /// Template rendered against the selected scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
}

impl Transform {
    pub fn select(pointer: impl Into<String>) -> Self {
        Self {
            select: Some(pointer.into()),
            template: None,
        }
    }

    pub fn template(template: Value) -> Self {
        Self {
            select: None,
            template: Some(template),
        }
    }

    pub fn apply(&self, context: &Value) -> Result<Value> {
        let scope = match &self.select {
            Some(pointer) => context.pointer(pointer).ok_or_else(|| {
                GatewayError::Transform(format!("select pointer {} matched nothing", pointer))
            })?,
            None => context,
        };

        match &self.template {
            Some(template) => render(template, scope),
            None => Ok(scope.clone()),
        }
    }
}

/// Build the payload for a mapping's connector request
///
/// Without a transform the payload is the previous chain step's response if
/// there is one, otherwise the route input.
pub fn apply_request(
    transform: Option<&Transform>,
    input: &Value,
    previous: Option<&Value>,
) -> Result<Value> {
    match transform {
        Some(transform) => {
            let context = json!({
                "input": input,
                "previous": previous.cloned().unwrap_or(Value::Null),
            });
            transform.apply(&context)
        }
        None => Ok(previous.unwrap_or(input).clone()),
    }
}

/// Shape a connector response for the route
pub fn apply_response(transform: Option<&Transform>, response: &Value) -> Result<Value> {
    match transform {
        Some(transform) => transform.apply(&json!({ "response": response })),
        None => Ok(response.clone()),
    }
}

/// Render a template against a scope
pub fn render(template: &Value, scope: &Value) -> Result<Value> {
    match template {
        Value::String(s) => render_string(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, scope))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, value) in fields {
                out.insert(key.clone(), render(value, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, scope: &Value) -> Result<Value> {
    let trimmed = s.trim();
    if let Some(inner) = whole_placeholder(trimmed) {
        return resolve(inner, scope);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            GatewayError::Transform(format!("unterminated placeholder in {:?}", s))
        })?;
        let value = resolve(&after[..end], scope)?;
        out.push_str(&query_value(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then_some(inner)
}

fn resolve(expr: &str, scope: &Value) -> Result<Value> {
    let expr = expr.trim();
    let (path, optional) = match expr.strip_suffix('?') {
        Some(path) => (path.trim(), true),
        None => (expr, false),
    };

    match lookup(scope, path) {
        Some(value) => Ok(value.clone()),
        None if optional => Ok(Value::Null),
        None => Err(GatewayError::Transform(format!(
            "placeholder {{{{{}}}}} did not resolve",
            path
        ))),
    }
}

/// Dotted-path lookup; numeric segments index arrays
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(scope);
    }
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Fill `{name}` segments of a mapping path from the payload
///
/// Returns the filled path and the payload fields consumed by it.
pub fn fill_path(path: &str, payload: &Value) -> Result<(String, Vec<String>)> {
    substitute(path, payload, true)
}

/// Render a cache key template such as `hospitals:{zip}`
pub fn render_key(template: &str, payload: &Value) -> Result<String> {
    substitute(template, payload, false).map(|(key, _)| key)
}

fn substitute(template: &str, payload: &Value, encode: bool) -> Result<(String, Vec<String>)> {
    let mut out = String::with_capacity(template.len());
    let mut used = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            GatewayError::Transform(format!("unterminated parameter in {}", template))
        })?;
        let name = &after[..end];
        let value = lookup(payload, name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                GatewayError::Transform(format!("parameter {{{}}} missing from payload", name))
            })?;
        let text = query_value(value);
        if encode {
            out.push_str(&encode_component(&text));
        } else {
            out.push_str(&text);
        }
        used.push(name.to_string());
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok((out, used))
}
