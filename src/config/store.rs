//! Configuration store consumed by the connector registry and the engine

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::{ConnectorConfig, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::routing::RouteConfig;

/// Read-mostly source of connector and route records
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn connector_config(&self, connector_id: &str) -> Result<ConnectorConfig>;

    async fn route(&self, route: &str) -> Result<RouteConfig>;

    async fn connector_ids(&self) -> Vec<String>;

    async fn route_names(&self) -> Vec<String>;
}

/// Store backed by an in-memory [`GatewayConfig`]
pub struct StaticConfigStore {
    config: RwLock<Arc<GatewayConfig>>,
}

impl StaticConfigStore {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
        }
    }

    pub async fn snapshot(&self) -> Arc<GatewayConfig> {
        Arc::clone(&*self.config.read().await)
    }

    /// Swap in a new configuration; existing connectors keep their old
    /// settings until they are reset
    pub async fn replace(&self, config: GatewayConfig) {
        info!(
            connectors = config.connectors.len(),
            routes = config.routes.len(),
            "Replacing gateway configuration"
        );
        *self.config.write().await = Arc::new(config);
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn connector_config(&self, connector_id: &str) -> Result<ConnectorConfig> {
        let config = self.config.read().await;
        let mut connector = config
            .connectors
            .get(connector_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("connector {}", connector_id)))?;
        if connector.id.is_empty() {
            connector.id = connector_id.to_string();
        }
        Ok(connector)
    }

    async fn route(&self, route: &str) -> Result<RouteConfig> {
        self.config
            .read()
            .await
            .routes
            .get(route)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("route {}", route)))
    }

    async fn connector_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.config.read().await.connectors.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn route_names(&self) -> Vec<String> {
        self.config.read().await.route_names()
    }
}
