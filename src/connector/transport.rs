//! Outbound transport
//!
//! The connector is protocol-agnostic beyond request/response semantics: it
//! hands a [`TransportRequest`] to a [`Transport`] and gets back a status and
//! a JSON body. [`HttpTransport`] is the production implementation:
//! - hyper-util legacy client with a shared connection pool
//! - native-tls (OpenSSL) via hyper-tls
//! - TCP_NODELAY and keepalive on the underlying connector
//! - JSON request bodies, JSON (or text) response bodies

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Hex lookup table for URI encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Transport-level failures
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<hyper_util::client::legacy::Error> for TransportError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        TransportError::Connection(err.to_string())
    }
}

impl From<hyper::Error> for TransportError {
    fn from(err: hyper::Error) -> Self {
        TransportError::InvalidResponse(err.to_string())
    }
}

/// A fully resolved outbound call
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl TransportResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_status(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs outbound calls for connectors
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Percent-encode a URL component, keeping RFC 3986 unreserved characters
pub fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX_UPPER[(b >> 4) as usize] as char);
            out.push(HEX_UPPER[(b & 0xF) as usize] as char);
        }
    }
    out
}

/// Join a base URL, a path and query pairs
pub fn build_url(base_url: &str, path: &str, query: &[(String, String)]) -> String {
    let mut url = String::with_capacity(base_url.len() + path.len() + 16);
    url.push_str(base_url.trim_end_matches('/'));
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);

    for (i, (key, value)) in query.iter().enumerate() {
        url.push(if i == 0 { '?' } else { '&' });
        url.push_str(&encode_component(key));
        url.push('=');
        url.push_str(&encode_component(value));
    }
    url
}

fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// HTTP(S) transport
///
/// Clone is cheap - the underlying HTTP client uses Arc internally.
#[derive(Clone)]
pub struct HttpTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpTransport {
    /// Create a transport with a tuned connection pool
    ///
    /// Set `GATEWAY_INSECURE_TLS=true` to skip certificate verification.
    pub fn new() -> Result<Self, TransportError> {
        let insecure_tls = std::env::var("GATEWAY_INSECURE_TLS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .map_err(|e| TransportError::Connection(format!("Failed to build TLS connector: {}", e)))?;

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .set_host(true)
            .build(https);

        Ok(Self { client })
    }

    async fn send_inner(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(format!("bad method: {}", e)))?;

        let mut builder = Request::builder().method(method).uri(&request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }

        let body = match &request.body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                let bytes = serde_json::to_vec(body)
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                Bytes::from(bytes)
            }
            None => Bytes::new(),
        };
        builder = builder.header("accept", "application/json");

        let http_request = builder
            .body(Full::new(body))
            .map_err(|e| TransportError::InvalidRequest(format!("Request build error: {}", e)))?;

        let response = self.client.request(http_request).await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let bytes = response.into_body().collect().await?.to_bytes();

        Ok(TransportResponse {
            status,
            headers,
            body: parse_body(&bytes),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let timeout = request.timeout;
        tokio::time::timeout(timeout, self.send_inner(request))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}
