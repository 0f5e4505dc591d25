//! Gateway: registries, engine and the administrative control surface
//!
//! Shared by the HTTP server and the CLI. Clone is cheap - every field is an
//! `Arc`, so clones operate on the same connectors and caches.

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{AggregateCacheStats, CacheRegistry, CacheStats};
use crate::clock::{self, SharedClock};
use crate::config::{ConfigStore, GatewayConfig, StaticConfigStore};
use crate::connector::{ConnectorRegistry, ConnectorState, HttpTransport, Transport};
use crate::error::{GatewayError, Result};
use crate::routing::{AggregationEngine, RouteOutcome};

pub mod metrics;

pub use metrics::{MetricsSink, MetricsSnapshot, TracingMetricsSink};

/// Per-cache stats plus totals
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub caches: Vec<CacheStats>,
    pub total: AggregateCacheStats,
}

#[derive(Clone)]
pub struct Gateway {
    pub store: Arc<StaticConfigStore>,
    pub caches: Arc<CacheRegistry>,
    pub connectors: Arc<ConnectorRegistry>,
    pub engine: Arc<AggregationEngine>,
    clock: SharedClock,
}

impl Gateway {
    /// Gateway over the real network and wall clock
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new().context("Failed to create HTTP transport")?;
        Ok(Self::with_transport(config, Arc::new(transport), clock::system()))
    }

    /// Gateway over an explicit transport and clock
    pub fn with_transport(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Self {
        let caches = Arc::new(CacheRegistry::new(config.cache.clone(), Arc::clone(&clock)));
        let store = Arc::new(StaticConfigStore::new(config));
        let store_dyn: Arc<dyn ConfigStore> = store.clone();
        let connectors = Arc::new(ConnectorRegistry::new(
            Arc::clone(&store_dyn),
            Arc::clone(&caches),
            transport,
            Arc::clone(&clock),
        ));
        let engine = Arc::new(AggregationEngine::new(Arc::clone(&connectors), store_dyn));

        Self {
            store,
            caches,
            connectors,
            engine,
            clock,
        }
    }

    pub async fn invoke(&self, route: &str, input: Value) -> Result<RouteOutcome> {
        self.engine.invoke(route, input).await
    }

    async fn ensure_known(&self, connector_id: &str) -> Result<()> {
        self.store.connector_config(connector_id).await.map(|_| ())
    }

    /// Connect a connector, creating it if needed
    pub async fn connect(&self, connector_id: &str) -> Result<ConnectorState> {
        let connector = self.connectors.get_or_create(connector_id).await?;
        connector.connect().await?;
        Ok(connector.state())
    }

    /// Stop a connector from accepting new calls
    pub async fn disconnect(&self, connector_id: &str) -> Result<()> {
        self.ensure_known(connector_id).await?;
        if let Some(connector) = self.connectors.get(connector_id).await {
            connector.disconnect();
        }
        Ok(())
    }

    /// Clear the rate limiter and cache, and drop the connector so it is
    /// recreated from configuration on next use
    pub async fn reset(&self, connector_id: &str) -> Result<()> {
        self.ensure_known(connector_id).await?;
        if let Some(connector) = self.connectors.remove(connector_id).await {
            connector.rate_limiter().reset();
        }
        if let Some(cache) = self.caches.remove(connector_id) {
            cache.clear();
        }
        info!(connector_id = %connector_id, "Connector reset");
        Ok(())
    }

    /// Drop every cached response for a connector; returns the count removed
    pub async fn clear_cache(&self, connector_id: &str) -> Result<usize> {
        self.ensure_known(connector_id).await?;
        let removed = match self.caches.get(connector_id) {
            Some(cache) => {
                let entries = cache.len();
                cache.clear();
                entries
            }
            None => 0,
        };
        info!(connector_id = %connector_id, removed, "Connector cache cleared");
        Ok(removed)
    }

    pub async fn connector_state(&self, connector_id: &str) -> Result<ConnectorState> {
        self.connectors
            .get(connector_id)
            .await
            .map(|c| c.state())
            .ok_or_else(|| GatewayError::NotFound(format!("connector {} is not active", connector_id)))
    }

    pub async fn connector_states(&self) -> Vec<ConnectorState> {
        self.connectors
            .list()
            .await
            .iter()
            .map(|c| c.state())
            .collect()
    }

    pub fn cache_stats(&self) -> CacheReport {
        CacheReport {
            caches: self.caches.stats_all(),
            total: self.caches.aggregate_stats(),
        }
    }

    /// Swap in a new configuration and drop every connector
    ///
    /// Cached responses survive; connectors are recreated lazily with the
    /// new settings.
    pub async fn reload(&self, config: GatewayConfig) -> Result<()> {
        config.validate()?;
        self.store.replace(config).await;
        self.connectors.clear().await;
        info!("Gateway configuration reloaded");
        Ok(())
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let connectors = self.connectors.list().await;
        MetricsSnapshot {
            timestamp_ms: self.clock.now_ms(),
            connectors: connectors.iter().map(|c| c.metrics()).collect(),
            rate_limits: connectors.iter().map(|c| c.rate_limiter().metrics()).collect(),
            caches: self.caches.stats_all(),
        }
    }

    /// Start background cache pruning
    pub fn start_cache_pruning(&self, interval: Duration) -> JoinHandle<()> {
        Arc::clone(&self.caches).start_pruning(interval)
    }

    /// Periodically write metrics snapshots to `sink`
    ///
    /// Sink failures are logged and otherwise ignored.
    pub fn start_metrics_flush(
        &self,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = gateway.metrics_snapshot().await;
                if let Err(e) = sink.write(&snapshot).await {
                    warn!(error = %e, "Failed to write metrics snapshot");
                }
            }
        })
    }
}
