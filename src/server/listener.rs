use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::routes::{error_body, match_route, status_for, Endpoint, RouteMatch};
use crate::config::ConfigStore;
use crate::error::GatewayError;
use crate::gateway::Gateway;

/// HTTP body type for responses
type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Gateway HTTP server state
pub struct GatewayServer {
    gateway: Gateway,
    listen: String,
}

impl GatewayServer {
    pub fn new(gateway: Gateway, listen: String) -> Self {
        Self { gateway, listen }
    }

    /// Bind and serve until the process exits
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .context(format!("Invalid listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        info!("Integration gateway listening on {}", addr);
        for route in self.gateway.store.route_names().await {
            info!(route = %route, "Serving route");
        }

        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    // Filter out benign connection reset errors
                    let err_str = format!("{}", e);
                    if !err_str.contains("connection reset") && !err_str.contains("broken pipe") {
                        error!("Error serving connection from {}: {}", remote_addr, e);
                    }
                }
            });
        }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<Response<BoxBody>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("{} {}", method, path);

        let endpoint = match match_route(&method, &path) {
            RouteMatch::Found(endpoint) => endpoint,
            RouteMatch::MethodNotAllowed => {
                return self.message_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            }
            RouteMatch::NotFound => {
                return self.message_response(StatusCode::NOT_FOUND, "no such endpoint")
            }
        };

        let body = match req.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return self.message_response(
                    StatusCode::BAD_REQUEST,
                    &format!("Failed to read request body: {}", e),
                );
            }
        };

        match self.dispatch(endpoint, body).await {
            Ok(value) => self.json_response(StatusCode::OK, &value),
            Err(err) => self.error_response(&err),
        }
    }

    async fn dispatch(&self, endpoint: Endpoint, body: Bytes) -> Result<Value, GatewayError> {
        let gateway = &self.gateway;
        match endpoint {
            Endpoint::Health => Ok(json!({ "status": "ok" })),
            Endpoint::Metrics => to_value(&gateway.metrics_snapshot().await),
            Endpoint::ListRoutes => to_value(&gateway.store.route_names().await),
            Endpoint::InvokeRoute(route) => {
                let input = parse_input(&body)?;
                to_value(&gateway.invoke(&route, input).await?)
            }
            Endpoint::ListConnectors => to_value(&gateway.connector_states().await),
            Endpoint::ConnectorState(id) => to_value(&gateway.connector_state(&id).await?),
            Endpoint::Connect(id) => to_value(&gateway.connect(&id).await?),
            Endpoint::Disconnect(id) => {
                gateway.disconnect(&id).await?;
                Ok(json!({ "connector_id": id, "phase": "disconnected" }))
            }
            Endpoint::Reset(id) => {
                gateway.reset(&id).await?;
                Ok(json!({ "connector_id": id, "reset": true }))
            }
            Endpoint::ClearCache(id) => {
                let removed = gateway.clear_cache(&id).await?;
                Ok(json!({ "connector_id": id, "removed": removed }))
            }
            Endpoint::CacheStats => to_value(&gateway.cache_stats()),
        }
    }

    fn json_response(&self, status: StatusCode, value: &Value) -> Result<Response<BoxBody>> {
        let bytes = serde_json::to_vec(value).context("Failed to serialize response")?;
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Connection", "keep-alive")
            .body(self.bytes_body(Bytes::from(bytes)))
            .context("Failed to build response")
    }

    fn error_response(&self, err: &GatewayError) -> Result<Response<BoxBody>> {
        let status = status_for(err);
        if status.is_server_error() {
            warn!(kind = %err.kind(), error = %err, "Request failed");
        } else {
            debug!(kind = %err.kind(), error = %err, "Request rejected");
        }

        let mut response = self.json_response(status, &error_body(err))?;
        if let Some(retry_after) = err.retry_after_secs() {
            let value = hyper::header::HeaderValue::from(retry_after);
            response.headers_mut().insert(hyper::header::RETRY_AFTER, value);
        }
        Ok(response)
    }

    fn message_response(&self, status: StatusCode, message: &str) -> Result<Response<BoxBody>> {
        self.json_response(status, &json!({ "error": { "message": message } }))
    }

    /// Convert Bytes into a BoxBody
    fn bytes_body(&self, b: Bytes) -> BoxBody {
        Full::new(b).map_err(|never| match never {}).boxed()
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(value)
        .map_err(|e| GatewayError::Transform(format!("failed to serialize response: {}", e)))
}

/// Request body as route input; an empty body is an empty object
fn parse_input(body: &[u8]) -> Result<Value, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::Transform(format!("request body is not valid JSON: {}", e)))
}
