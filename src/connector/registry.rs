//! Process-wide connector id → [`Connector`] map

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use super::client::Connector;
use super::transport::Transport;
use crate::cache::CacheRegistry;
use crate::clock::SharedClock;
use crate::config::ConfigStore;
use crate::error::Result;

type Slot = Arc<OnceCell<Connector>>;

/// Lazily creates and connects connectors from the configuration store
///
/// Each id owns a slot that is initialised at most once, so concurrent first
/// access for the same id yields exactly one instance. The map lock is never
/// held while a connector connects. A connector is only visible once its
/// first `connect` succeeds.
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, Slot>>,
    store: Arc<dyn ConfigStore>,
    caches: Arc<CacheRegistry>,
    transport: Arc<dyn Transport>,
    clock: SharedClock,
}

impl ConnectorRegistry {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        caches: Arc<CacheRegistry>,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
            store,
            caches,
            transport,
            clock,
        }
    }

    pub fn caches(&self) -> &Arc<CacheRegistry> {
        &self.caches
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Get the connector for `connector_id`, creating and connecting it on
    /// first use
    pub async fn get_or_create(&self, connector_id: &str) -> Result<Connector> {
        let slot = self.slot(connector_id).await;
        match slot.get_or_try_init(|| self.create(connector_id)).await {
            Ok(connector) => Ok(connector.clone()),
            Err(err) => {
                self.discard_empty(connector_id, &slot).await;
                Err(err)
            }
        }
    }

    async fn slot(&self, connector_id: &str) -> Slot {
        if let Some(slot) = self.connectors.read().await.get(connector_id) {
            return Arc::clone(slot);
        }
        let mut connectors = self.connectors.write().await;
        Arc::clone(connectors.entry(connector_id.to_string()).or_default())
    }

    async fn create(&self, connector_id: &str) -> Result<Connector> {
        let mut config = self.store.connector_config(connector_id).await?;
        if config.id.is_empty() {
            config.id = connector_id.to_string();
        }

        let connector = Connector::new(
            config,
            Arc::clone(&self.transport),
            self.caches.get_or_create(connector_id),
            Arc::clone(&self.clock),
        );

        if let Err(err) = connector.connect().await {
            warn!(connector_id = %connector_id, error = %err, "Failed to connect new connector");
            return Err(err);
        }

        info!(connector_id = %connector_id, "Registered connector");
        Ok(connector)
    }

    /// Forget a slot whose initialisation failed, unless it was replaced
    async fn discard_empty(&self, connector_id: &str, slot: &Slot) {
        let mut connectors = self.connectors.write().await;
        let stale = connectors
            .get(connector_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if stale {
            connectors.remove(connector_id);
        }
    }

    pub async fn get(&self, connector_id: &str) -> Option<Connector> {
        self.connectors
            .read()
            .await
            .get(connector_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Drop a connector so the next access recreates it from configuration
    pub async fn remove(&self, connector_id: &str) -> Option<Connector> {
        let removed = self
            .connectors
            .write()
            .await
            .remove(connector_id)
            .and_then(|slot| slot.get().cloned());
        if let Some(connector) = &removed {
            connector.disconnect();
            info!(connector_id = %connector_id, "Removed connector");
        }
        removed
    }

    /// Registered connectors, sorted by id
    pub async fn list(&self) -> Vec<Connector> {
        let mut connectors: Vec<Connector> = self
            .connectors
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        connectors.sort_by(|a, b| a.id().cmp(b.id()));
        connectors
    }

    /// Disconnect and drop every connector
    pub async fn clear(&self) {
        let mut connectors = self.connectors.write().await;
        for connector in connectors.values().filter_map(|slot| slot.get()) {
            connector.disconnect();
        }
        connectors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::config::{ConnectorConfig, GatewayConfig, StaticConfigStore};
    use crate::connector::{TransportError, TransportRequest, TransportResponse};
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            if request.url.ends_with("/health") {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
            Ok(TransportResponse::ok(json!({ "url": request.url })))
        }
    }

    fn registry() -> Arc<ConnectorRegistry> {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let mut disabled = ConnectorConfig::new("off", "https://off.example.com");
        disabled.enabled = false;
        let mut slow = ConnectorConfig::new("slow", "https://slow.example.com");
        slow.health_path = Some("/health".to_string());
        let store = StaticConfigStore::new(
            GatewayConfig::default()
                .with_connector(ConnectorConfig::new("a", "https://a.example.com"))
                .with_connector(ConnectorConfig::new("b", "https://b.example.com"))
                .with_connector(slow)
                .with_connector(disabled),
        );
        Arc::new(ConnectorRegistry::new(
            Arc::new(store),
            Arc::new(CacheRegistry::new(CacheConfig::default(), Arc::clone(&clock))),
            Arc::new(Echo),
            clock,
        ))
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_instance() {
        let registry = registry();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create("a").await.unwrap() })
            })
            .collect();

        let mut connectors = Vec::new();
        for handle in handles {
            connectors.push(handle.await.unwrap());
        }
        assert!(connectors.windows(2).all(|w| w[0].ptr_eq(&w[1])));
        assert_eq!(registry.list().await.len(), 1);
        assert!(connectors[0].phase().accepts_requests());
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_connectors_are_not_registered() {
        let registry = registry();
        let err = registry.get_or_create("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = registry.get_or_create("off").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_recreates_fresh_instance() {
        let registry = registry();
        let first = registry.get_or_create("a").await.unwrap();
        let removed = registry.remove("a").await.unwrap();
        assert!(removed.ptr_eq(&first));
        assert!(!first.phase().accepts_requests());

        let second = registry.get_or_create("a").await.unwrap();
        assert!(!second.ptr_eq(&first));
    }

    #[tokio::test]
    async fn test_slow_connect_does_not_block_other_connectors() {
        let registry = registry();
        let a = registry.get_or_create("a").await.unwrap();

        let pending = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_or_create("slow").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        let quick = std::time::Duration::from_millis(100);
        let served = tokio::time::timeout(quick, registry.get_or_create("a"))
            .await
            .unwrap()
            .unwrap();
        assert!(served.ptr_eq(&a));
        let fresh = tokio::time::timeout(quick, registry.get_or_create("b"))
            .await
            .unwrap()
            .unwrap();
        assert!(fresh.phase().accepts_requests());
        assert_eq!(
            tokio::time::timeout(quick, registry.list()).await.unwrap().len(),
            2
        );

        let slow = pending.await.unwrap().unwrap();
        assert!(slow.phase().accepts_requests());
        assert_eq!(registry.list().await.len(), 3);
    }
}
