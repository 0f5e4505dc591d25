//! Registry of per-connector response caches

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use super::store::{CacheConfig, CacheStats, ResponseCache};
use crate::clock::SharedClock;

/// Totals across every registered cache
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AggregateCacheStats {
    pub caches: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// Connector id → cache instance
///
/// `get_or_create` is idempotent: concurrent first access for the same id
/// yields exactly one cache.
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, Arc<ResponseCache>>>,
    config: CacheConfig,
    clock: SharedClock,
}

impl CacheRegistry {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get_or_create(&self, connector_id: &str) -> Arc<ResponseCache> {
        if let Some(cache) = self.get(connector_id) {
            return cache;
        }

        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(caches.entry(connector_id.to_string()).or_insert_with(|| {
            info!(connector_id = %connector_id, "Creating response cache");
            Arc::new(ResponseCache::new(
                connector_id,
                self.config.clone(),
                Arc::clone(&self.clock),
            ))
        }))
    }

    pub fn get(&self, connector_id: &str) -> Option<Arc<ResponseCache>> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connector_id)
            .cloned()
    }

    pub fn remove(&self, connector_id: &str) -> Option<Arc<ResponseCache>> {
        let removed = self
            .caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connector_id);
        if removed.is_some() {
            info!(connector_id = %connector_id, "Removed response cache");
        }
        removed
    }

    fn snapshot(&self) -> Vec<Arc<ResponseCache>> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Per-cache statistics, sorted by connector id
    pub fn stats_all(&self) -> Vec<CacheStats> {
        let mut stats: Vec<CacheStats> = self.snapshot().iter().map(|c| c.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn aggregate_stats(&self) -> AggregateCacheStats {
        let mut total = AggregateCacheStats::default();
        for stats in self.stats_all() {
            total.caches += 1;
            total.entries += stats.entries;
            total.hits += stats.hits;
            total.misses += stats.misses;
            total.evictions += stats.evictions;
        }
        let lookups = total.hits + total.misses;
        if lookups > 0 {
            total.hit_rate = total.hits as f64 / lookups as f64;
        }
        total
    }

    /// Prune expired entries in every cache
    pub fn prune_all(&self) -> usize {
        self.snapshot().iter().map(|c| c.prune()).sum()
    }

    pub fn clear_all(&self) {
        for cache in self.snapshot() {
            cache.clear();
        }
    }

    /// Start background pruning
    pub fn start_pruning(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.prune_all();
                debug!(removed, "Cache prune cycle completed");
            }
        })
    }
}
