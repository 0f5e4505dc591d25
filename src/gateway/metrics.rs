//! Metrics snapshots and sinks

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::cache::CacheStats;
use crate::connector::ConnectorMetrics;
use crate::resilience::RateLimitMetrics;

/// Point-in-time counters for every registered connector and cache
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp_ms: u64,
    pub connectors: Vec<ConnectorMetrics>,
    pub rate_limits: Vec<RateLimitMetrics>,
    pub caches: Vec<CacheStats>,
}

/// Destination for periodic metrics snapshots
///
/// Failures are logged by the flush task and never reach request handling.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write(&self, snapshot: &MetricsSnapshot) -> anyhow::Result<()>;
}

/// Writes snapshots as structured log events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn write(&self, snapshot: &MetricsSnapshot) -> anyhow::Result<()> {
        for connector in &snapshot.connectors {
            info!(
                connector_id = %connector.connector_id,
                total = connector.total_requests,
                succeeded = connector.successful_requests,
                failed = connector.failed_requests,
                rejected = connector.rejected_requests,
                cache_hits = connector.cache_hits,
                avg_latency_ms = connector.avg_latency_ms,
                "connector_metrics"
            );
        }
        for cache in &snapshot.caches {
            info!(
                cache = %cache.name,
                entries = cache.entries,
                hits = cache.hits,
                misses = cache.misses,
                evictions = cache.evictions,
                hit_rate = cache.hit_rate,
                "cache_metrics"
            );
        }
        Ok(())
    }
}
