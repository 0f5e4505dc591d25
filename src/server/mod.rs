//! Gateway HTTP server
//!
//! Exposes route invocation and the administrative control surface over
//! HTTP/1.1 with JSON bodies.

mod listener;
pub mod routes;

pub use listener::GatewayServer;
pub use routes::{match_route, status_for, Endpoint, RouteMatch};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::{Gateway, TracingMetricsSink};

/// Run the server with background cache pruning and metrics flushing
pub async fn run_server(gateway: &Gateway, listen: &str) -> Result<()> {
    let config = gateway.store.snapshot().await;
    gateway.start_cache_pruning(Duration::from_secs(config.cache.prune_interval_secs.max(1)));
    gateway.start_metrics_flush(
        Arc::new(TracingMetricsSink),
        Duration::from_secs(config.server.metrics_flush_secs.max(1)),
    );

    let server = GatewayServer::new(gateway.clone(), listen.to_string());
    server.run().await
}
