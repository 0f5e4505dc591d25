//! Canonical request signatures used as cache keys

use serde_json::{Map, Value};
use std::fmt::Display;

use crate::connector::encode_component;

/// Build the cache key for a request
///
/// Produces `METHOD:PATH` when there are no parameters and
/// `METHOD:PATH?a=1&b=2` otherwise, with parameter names sorted
/// lexicographically so insertion order never matters. Names and values are
/// percent-encoded, so reserved characters inside a value cannot collide
/// with the separators.
pub fn generate_key<I, K, V>(method: &str, path: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Display,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (encode_component(k.as_ref()), encode_component(&v.to_string())))
        .collect();

    let method = method.to_ascii_uppercase();
    if pairs.is_empty() {
        return format!("{}:{}", method, path);
    }

    pairs.sort();
    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}:{}?{}", method, path, query)
}

/// Render a JSON scalar the way it appears in a query string
pub fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// [`generate_key`] over a JSON object of parameters
pub fn generate_key_from_json(method: &str, path: &str, params: &Map<String, Value>) -> String {
    generate_key(
        method,
        path,
        params.iter().map(|(k, v)| (k.as_str(), query_value(v))),
    )
}
