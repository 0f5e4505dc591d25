//! Connector: lifecycle plus the guarded call path for one integration
//!
//! `execute` runs, in order:
//! 1. lifecycle check (`connected` or `degraded`)
//! 2. response cache lookup for cacheable requests
//! 3. circuit breaker admission
//! 4. rate limiter admission
//! 5. transport call under the configured timeout, retried with backoff on
//!    timeouts and transport failures
//!
//! Breaker and limiter denials are terminal and never retried.

use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::transport::{build_url, Transport, TransportError, TransportRequest, TransportResponse};
use super::types::{
    ConnectorMetrics, ConnectorPhase, ConnectorRequest, ConnectorResponse, ConnectorState,
};
use crate::cache::{CacheEntryOptions, ResponseCache};
use crate::clock::SharedClock;
use crate::config::ConnectorConfig;
use crate::error::{GatewayError, Result};
use crate::resilience::{CircuitBreaker, CircuitPhase, RateDecision, RateLimiter};

/// Margin added to [`Connector::deadline`] for timer granularity
pub const DEADLINE_SLACK_MS: u64 = 100;

struct Lifecycle {
    phase: ConnectorPhase,
    connected_at_ms: Option<u64>,
    last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    cache_hits: u64,
    stale_hits: u64,
    retries: u64,
    transport_calls: u64,
    total_latency_ms: u64,
    last_activity_ms: Option<u64>,
}

struct ConnectorInner {
    config: ConnectorConfig,
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    cache: Arc<ResponseCache>,
    clock: SharedClock,
    lifecycle: Mutex<Lifecycle>,
    counters: Mutex<Counters>,
    refreshing: Mutex<HashSet<String>>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Handle to one integration
///
/// Clone is cheap - all clones share the same breaker, limiter, cache and
/// counters.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connector {
    /// Create a disconnected connector
    pub fn new(
        config: ConnectorConfig,
        transport: Arc<dyn Transport>,
        cache: Arc<ResponseCache>,
        clock: SharedClock,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            config.id.clone(),
            config.circuit_breaker.clone(),
            Arc::clone(&clock),
        );
        let limiter = RateLimiter::new(
            config.id.clone(),
            config.rate_limit.clone(),
            Arc::clone(&clock),
        );

        Self {
            inner: Arc::new(ConnectorInner {
                config,
                transport,
                breaker,
                limiter,
                cache,
                clock,
                lifecycle: Mutex::new(Lifecycle {
                    phase: ConnectorPhase::Disconnected,
                    connected_at_ms: None,
                    last_error: None,
                }),
                counters: Mutex::new(Counters::default()),
                refreshing: Mutex::new(HashSet::new()),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    pub fn phase(&self) -> ConnectorPhase {
        lock(&self.inner.lifecycle).phase
    }

    /// Whether two handles refer to the same connector instance
    pub fn ptr_eq(&self, other: &Connector) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Establish readiness
    ///
    /// Idempotent: a connected or degraded connector is left alone.
    /// Concurrent calls are serialized. When `health_path` is configured it
    /// is probed once; a failed probe leaves the connector disconnected.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;

        if self.phase().accepts_requests() {
            debug!(connector_id = %self.id(), "Connector already connected");
            return Ok(());
        }

        if !self.inner.config.enabled {
            let err = GatewayError::Configuration(format!("connector {} is disabled", self.id()));
            self.mark_disconnected(Some(err.to_string()));
            return Err(err);
        }

        self.set_phase(ConnectorPhase::Connecting);
        info!(connector_id = %self.id(), base_url = %self.inner.config.base_url, "Connecting");

        if let Some(path) = &self.inner.config.health_path {
            let probe = ConnectorRequest::get(path.clone());
            if let Err(err) = self.send_once(&probe).await {
                warn!(connector_id = %self.id(), error = %err, "Health probe failed");
                self.mark_disconnected(Some(err.to_string()));
                return Err(err);
            }
        }

        let now = self.inner.clock.now_ms();
        {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.phase = if matches!(self.inner.breaker.phase(), CircuitPhase::Closed) {
                ConnectorPhase::Connected
            } else {
                ConnectorPhase::Degraded
            };
            lifecycle.connected_at_ms = Some(now);
            lifecycle.last_error = None;
        }
        info!(connector_id = %self.id(), "Connector connected");
        Ok(())
    }

    /// Stop accepting new calls; in-flight calls finish naturally
    pub fn disconnect(&self) {
        self.mark_disconnected(None);
        info!(connector_id = %self.id(), "Connector disconnected");
    }

    fn mark_disconnected(&self, error: Option<String>) {
        let mut lifecycle = lock(&self.inner.lifecycle);
        lifecycle.phase = ConnectorPhase::Disconnected;
        lifecycle.connected_at_ms = None;
        if error.is_some() {
            lifecycle.last_error = error;
        }
    }

    fn set_phase(&self, phase: ConnectorPhase) {
        lock(&self.inner.lifecycle).phase = phase;
    }

    /// Move between connected and degraded to follow the breaker
    fn sync_with_breaker(&self) {
        let breaker_closed = matches!(self.inner.breaker.phase(), CircuitPhase::Closed);
        let mut lifecycle = lock(&self.inner.lifecycle);
        match (lifecycle.phase, breaker_closed) {
            (ConnectorPhase::Connected, false) => {
                warn!(connector_id = %self.id(), "Connector degraded: circuit breaker opened");
                lifecycle.phase = ConnectorPhase::Degraded;
            }
            (ConnectorPhase::Degraded, true) => {
                info!(connector_id = %self.id(), "Connector recovered: circuit breaker closed");
                lifecycle.phase = ConnectorPhase::Connected;
            }
            _ => {}
        }
    }

    /// Force the circuit breaker closed
    pub fn reset_circuit(&self) {
        self.inner.breaker.reset();
        self.sync_with_breaker();
    }

    /// Worst-case duration of one `execute`, including retries and backoff
    ///
    /// Carries [`DEADLINE_SLACK_MS`] on top so the per-attempt timeouts
    /// normally fire first.
    pub fn deadline(&self) -> Duration {
        let config = &self.inner.config;
        let attempts = config.retry.max_attempts.max(1);
        let mut total_ms = config
            .timeout_ms
            .saturating_mul(attempts as u64)
            .saturating_add(DEADLINE_SLACK_MS);
        for attempt in 0..attempts - 1 {
            let backoff = config.retry.backoff_for(attempt);
            total_ms = total_ms.saturating_add(backoff + backoff / 5);
        }
        Duration::from_millis(total_ms)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.inner.config.retry.backoff_for(attempt);
        let jitter = if base >= 5 {
            rand::thread_rng().gen_range(0..=base / 5)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Issue a call through this connector
    pub async fn execute(&self, request: ConnectorRequest) -> Result<ConnectorResponse> {
        let now = self.inner.clock.now_ms();
        {
            let mut counters = lock(&self.inner.counters);
            counters.total_requests += 1;
            counters.last_activity_ms = Some(now);
        }

        let phase = self.phase();
        if !phase.accepts_requests() {
            let err = GatewayError::Unavailable {
                connector: self.id().to_string(),
                phase: phase.to_string(),
            };
            self.record_outcome(Some(&err));
            return Err(err);
        }

        let cache_key = request.is_cacheable().then(|| request.cache_key());
        if let Some(key) = &cache_key {
            if let Some(hit) = self.inner.cache.get(key) {
                {
                    let mut counters = lock(&self.inner.counters);
                    counters.cache_hits += 1;
                    counters.successful_requests += 1;
                    if hit.stale {
                        counters.stale_hits += 1;
                    }
                }
                debug!(connector_id = %self.id(), key = %key, stale = hit.stale, "Cache hit");
                if hit.stale {
                    self.spawn_refresh(key.clone(), request.clone());
                }
                return Ok(ConnectorResponse {
                    data: hit.data,
                    status: 200,
                    cached: true,
                    stale: hit.stale,
                    attempts: 0,
                    latency_ms: 0,
                });
            }
        }

        let result = self.fetch(&request).await;
        if let (Ok(response), Some(key)) = (&result, &cache_key) {
            self.store(key, &request, response);
        }
        self.record_outcome(result.as_ref().err());
        result.map(|(response, _)| response)
    }

    fn record_outcome(&self, error: Option<&GatewayError>) {
        let mut counters = lock(&self.inner.counters);
        match error {
            None => counters.successful_requests += 1,
            Some(err) => {
                counters.failed_requests += 1;
                if matches!(
                    err,
                    GatewayError::CircuitOpen { .. }
                        | GatewayError::RateLimited { .. }
                        | GatewayError::Unavailable { .. }
                ) {
                    counters.rejected_requests += 1;
                }
            }
        }
    }

    fn store(
        &self,
        key: &str,
        request: &ConnectorRequest,
        fetched: &(ConnectorResponse, Option<String>),
    ) {
        let (response, etag) = fetched;
        let policy = request.cache.clone().unwrap_or_default();
        let options = CacheEntryOptions {
            ttl_ms: policy.ttl_ms,
            stale_ttl_ms: None,
            tags: policy.tags,
            etag: etag.clone(),
        };
        self.inner.cache.set(key, response.data.clone(), options);
    }

    /// Schedule one background refresh per key
    fn spawn_refresh(&self, key: String, request: ConnectorRequest) {
        if !lock(&self.inner.refreshing).insert(key.clone()) {
            debug!(connector_id = %self.id(), key = %key, "Refresh already in flight");
            return;
        }

        let connector = self.clone();
        tokio::spawn(async move {
            match connector.fetch(&request).await {
                Ok(fetched) => {
                    connector.store(&key, &request, &fetched);
                    debug!(connector_id = %connector.id(), key = %key, "Background refresh stored");
                }
                Err(err) => {
                    debug!(connector_id = %connector.id(), key = %key, error = %err, "Background refresh failed");
                }
            }
            lock(&connector.inner.refreshing).remove(&key);
        });
    }

    /// Keys with a background refresh in flight
    pub fn pending_refreshes(&self) -> usize {
        lock(&self.inner.refreshing).len()
    }

    fn admit(&self) -> Result<()> {
        if !self.inner.breaker.should_allow() {
            return Err(GatewayError::CircuitOpen {
                connector: self.id().to_string(),
            });
        }

        if let RateDecision::Denied {
            retry_after_secs, ..
        } = self.inner.limiter.try_acquire()
        {
            self.inner.breaker.release_probe();
            return Err(GatewayError::RateLimited {
                connector: self.id().to_string(),
                retry_after_secs,
            });
        }
        Ok(())
    }

    /// Guarded transport call with retries; bypasses the cache
    async fn fetch(&self, request: &ConnectorRequest) -> Result<(ConnectorResponse, Option<String>)> {
        self.admit()?;

        let max_attempts = self.inner.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let mut pending = PendingOutcome::new(self);
            let outcome = self.send_once(request).await;
            pending.settle();
            let latency_ms = started.elapsed().as_millis() as u64;
            {
                let mut counters = lock(&self.inner.counters);
                counters.transport_calls += 1;
                counters.total_latency_ms += latency_ms;
            }

            let err = match outcome {
                Ok(response) => {
                    self.inner.breaker.record_success();
                    self.sync_with_breaker();
                    let etag = response.headers.get("etag").cloned();
                    return Ok((
                        ConnectorResponse {
                            data: response.body,
                            status: response.status,
                            cached: false,
                            stale: false,
                            attempts: attempt,
                            latency_ms,
                        },
                        etag,
                    ));
                }
                Err(err) => err,
            };

            if err.is_upstream_failure() {
                self.inner.breaker.record_failure();
            } else if matches!(err, GatewayError::Configuration(_)) {
                // Never left the process
                self.inner.breaker.release_probe();
            } else {
                // A client error still proves the integration is reachable
                self.inner.breaker.record_success();
            }
            self.sync_with_breaker();
            lock(&self.inner.lifecycle).last_error = Some(err.to_string());

            if !err.is_retryable() || attempt >= max_attempts {
                warn!(connector_id = %self.id(), attempt, error = %err, "Request failed");
                return Err(err);
            }

            let delay = self.jittered_backoff(attempt - 1);
            warn!(
                connector_id = %self.id(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Request failed, retrying"
            );
            tokio::time::sleep(delay).await;

            // The breaker may have opened or the budget run out while waiting
            if self.admit().is_err() {
                return Err(err);
            }
            lock(&self.inner.counters).retries += 1;
        }
    }

    /// One transport attempt under the configured timeout
    async fn send_once(&self, request: &ConnectorRequest) -> Result<TransportResponse> {
        let config = &self.inner.config;
        let mut headers = config.headers.clone();
        headers.extend(request.headers.clone());
        let timeout = Duration::from_millis(config.timeout_ms);

        let call = self.inner.transport.send(TransportRequest {
            method: request.method.clone(),
            url: build_url(&config.base_url, &request.path, &request.query),
            headers,
            body: request.body.clone(),
            timeout,
        });

        let timed_out = || GatewayError::Timeout {
            connector: self.id().to_string(),
            timeout_ms: config.timeout_ms,
        };

        match tokio::time::timeout(timeout, call).await {
            Err(_) | Ok(Err(TransportError::Timeout)) => Err(timed_out()),
            Ok(Err(TransportError::InvalidRequest(message))) => Err(GatewayError::Configuration(
                format!("invalid request for connector {}: {message}", self.id()),
            )),
            Ok(Err(err)) => Err(GatewayError::Transport {
                connector: self.id().to_string(),
                status: None,
                message: err.to_string(),
            }),
            Ok(Ok(response)) if response.is_success() => Ok(response),
            Ok(Ok(response)) => Err(GatewayError::Transport {
                connector: self.id().to_string(),
                status: Some(response.status),
                message: format!("upstream returned status {}", response.status),
            }),
        }
    }

    /// Counter snapshot; never waits on in-flight calls
    pub fn metrics(&self) -> ConnectorMetrics {
        let now = self.inner.clock.now_ms();
        let connected_at_ms = lock(&self.inner.lifecycle).connected_at_ms;
        let counters = lock(&self.inner.counters);
        let avg_latency_ms = if counters.transport_calls == 0 {
            0.0
        } else {
            counters.total_latency_ms as f64 / counters.transport_calls as f64
        };

        ConnectorMetrics {
            connector_id: self.id().to_string(),
            total_requests: counters.total_requests,
            successful_requests: counters.successful_requests,
            failed_requests: counters.failed_requests,
            rejected_requests: counters.rejected_requests,
            cache_hits: counters.cache_hits,
            stale_hits: counters.stale_hits,
            retries: counters.retries,
            avg_latency_ms,
            last_activity_ms: counters.last_activity_ms,
            uptime_ms: connected_at_ms.map(|at| now.saturating_sub(at)),
        }
    }

    pub fn state(&self) -> ConnectorState {
        let (phase, connected_at_ms, last_error) = {
            let lifecycle = lock(&self.inner.lifecycle);
            (
                lifecycle.phase,
                lifecycle.connected_at_ms,
                lifecycle.last_error.clone(),
            )
        };

        ConnectorState {
            connector_id: self.id().to_string(),
            phase,
            enabled: self.inner.config.enabled,
            base_url: self.inner.config.base_url.clone(),
            connected_at_ms,
            last_error,
            circuit: self.inner.breaker.stats(),
            rate_limit: self.inner.limiter.metrics(),
            cache: self.inner.cache.stats(),
            metrics: self.metrics(),
        }
    }
}

/// Breaker bookkeeping for an admitted attempt whose future may be dropped
///
/// An attempt cancelled before it reports counts as a failure, so a half-open
/// trial call never stays in flight.
struct PendingOutcome<'a> {
    connector: &'a Connector,
    settled: bool,
}

impl<'a> PendingOutcome<'a> {
    fn new(connector: &'a Connector) -> Self {
        Self {
            connector,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let connector = self.connector;
        connector.inner.breaker.record_failure();
        connector.sync_with_breaker();
        lock(&connector.inner.lifecycle).last_error =
            Some("call cancelled before completion".to_string());
        warn!(connector_id = %connector.id(), "Request cancelled in flight, counted as failure");
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::config::RetryPolicy;
    use crate::error::ErrorKind;
    use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};
    use crate::routing::CachePolicy;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Replies from a script, repeating the last reply when exhausted
    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<TransportResponse, TransportError>>>,
        last: Mutex<Option<std::result::Result<TransportResponse, TransportError>>>,
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
        stalled: AtomicBool,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
                stalled: AtomicBool::new(false),
            })
        }

        fn ok(body: Value) -> Arc<Self> {
            Self::new(vec![Ok(TransportResponse::ok(body))])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Hold every following call open until released
        fn stall(&self, stalled: bool) {
            self.stalled.store(stalled, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.urls).push(request.url);
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let next = lock(&self.replies).pop_front();
            match next {
                Some(reply) => {
                    *lock(&self.last) = Some(reply.clone());
                    reply
                }
                None => lock(&self.last)
                    .clone()
                    .unwrap_or_else(|| Err(TransportError::Connection("no script".into()))),
            }
        }
    }

    fn config(id: &str) -> ConnectorConfig {
        let mut config = ConnectorConfig::new(id, "https://api.example.com");
        config.retry = RetryPolicy {
            max_attempts: 1,
            backoff_ms: 0,
            max_backoff_ms: 0,
        };
        config
    }

    fn connector_with(
        config: ConnectorConfig,
        transport: Arc<Scripted>,
        cache_config: CacheConfig,
    ) -> (Connector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_704_067_200_000));
        let cache = Arc::new(ResponseCache::new(config.id.clone(), cache_config, clock.clone()));
        (Connector::new(config, transport, cache, clock.clone()), clock)
    }

    fn cached_get(path: &str) -> ConnectorRequest {
        ConnectorRequest::get(path).with_cache(CachePolicy {
            enabled: true,
            ttl_ms: Some(1_000),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_rejects_until_connected() {
        let transport = Scripted::ok(json!({"ok": true}));
        let (connector, _clock) = connector_with(config("a"), transport.clone(), CacheConfig::default());

        let err = connector.execute(ConnectorRequest::get("/x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(transport.calls(), 0);

        connector.connect().await.unwrap();
        connector.connect().await.unwrap();
        assert_eq!(connector.phase(), ConnectorPhase::Connected);

        let response = connector.execute(ConnectorRequest::get("/x")).await.unwrap();
        assert_eq!(response.data, json!({"ok": true}));
        assert_eq!(response.attempts, 1);

        connector.disconnect();
        assert!(connector.execute(ConnectorRequest::get("/x")).await.is_err());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_disabled_connector_refuses_to_connect() {
        let mut cfg = config("off");
        cfg.enabled = false;
        let (connector, _clock) = connector_with(cfg, Scripted::ok(json!(1)), CacheConfig::default());
        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert_eq!(connector.phase(), ConnectorPhase::Disconnected);
        assert!(connector.state().last_error.is_some());
    }

    #[tokio::test]
    async fn test_health_probe_failure_leaves_disconnected() {
        let mut cfg = config("a");
        cfg.health_path = Some("/health".to_string());
        let transport = Scripted::new(vec![Err(TransportError::Connection("refused".into()))]);
        let (connector, _clock) = connector_with(cfg, transport, CacheConfig::default());

        assert!(connector.connect().await.is_err());
        assert_eq!(connector.phase(), ConnectorPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_retries_transport_errors_up_to_cap() {
        let mut cfg = config("a");
        cfg.retry.max_attempts = 3;
        let transport = Scripted::new(vec![
            Ok(TransportResponse::with_status(503, json!(null))),
            Err(TransportError::Connection("reset".into())),
            Ok(TransportResponse::ok(json!({"n": 3}))),
        ]);
        let (connector, _clock) = connector_with(cfg, transport.clone(), CacheConfig::default());
        connector.connect().await.unwrap();

        let response = connector.execute(ConnectorRequest::get("/x")).await.unwrap();
        assert_eq!(response.data, json!({"n": 3}));
        assert_eq!(response.attempts, 3);
        assert_eq!(connector.metrics().retries, 2);
        assert_eq!(connector.circuit_breaker().stats().total_failures, 2);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut cfg = config("a");
        cfg.retry.max_attempts = 3;
        let transport = Scripted::new(vec![Ok(TransportResponse::with_status(404, json!(null)))]);
        let (connector, _clock) = connector_with(cfg, transport.clone(), CacheConfig::default());
        connector.connect().await.unwrap();

        let err = connector.execute(ConnectorRequest::get("/x")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport { status: Some(404), .. }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(connector.circuit_breaker().stats().total_failures, 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_degrades() {
        let mut cfg = config("a");
        cfg.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown_ms: 1_000,
            ..Default::default()
        };
        let transport = Scripted::new(vec![
            Err(TransportError::Connection("down".into())),
            Err(TransportError::Connection("down".into())),
            Ok(TransportResponse::ok(json!("back"))),
        ]);
        let (connector, clock) = connector_with(cfg, transport.clone(), CacheConfig::default());
        connector.connect().await.unwrap();

        for _ in 0..2 {
            connector.execute(ConnectorRequest::get("/x")).await.unwrap_err();
        }
        assert_eq!(connector.phase(), ConnectorPhase::Degraded);

        let err = connector.execute(ConnectorRequest::get("/x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(transport.calls(), 2);

        clock.advance_ms(1_000);
        let response = connector.execute(ConnectorRequest::get("/x")).await.unwrap();
        assert_eq!(response.data, json!("back"));
        assert_eq!(connector.phase(), ConnectorPhase::Connected);
        assert_eq!(connector.metrics().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_with_retry_after() {
        let mut cfg = config("a");
        cfg.rate_limit = RateLimitConfig {
            per_minute: Some(2),
            ..Default::default()
        };
        let transport = Scripted::ok(json!(1));
        let (connector, clock) = connector_with(cfg, transport.clone(), CacheConfig::default());
        connector.connect().await.unwrap();
        clock.advance_ms(15_000);

        connector.execute(ConnectorRequest::get("/x")).await.unwrap();
        connector.execute(ConnectorRequest::get("/x")).await.unwrap();
        let err = connector.execute(ConnectorRequest::get("/x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after_secs(), Some(45));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_fresh_cache_hit_skips_transport() {
        let transport = Scripted::ok(json!({"hospital": "General"}));
        let (connector, _clock) = connector_with(config("a"), transport.clone(), CacheConfig::default());
        connector.connect().await.unwrap();

        let first = connector.execute(cached_get("/h")).await.unwrap();
        let second = connector.execute(cached_get("/h")).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.data, first.data);
        assert_eq!(transport.calls(), 1);
        assert_eq!(connector.metrics().cache_hits, 1);
        assert!(connector.cache().has("GET:/h"));
    }

    #[tokio::test]
    async fn test_stale_hit_served_and_refreshed_once() {
        let transport = Scripted::new(vec![
            Ok(TransportResponse::ok(json!("v1"))),
            Ok(TransportResponse::ok(json!("v2"))),
        ]);
        let cache_config = CacheConfig {
            stale_while_revalidate: true,
            stale_ttl_ms: 5_000,
            ..Default::default()
        };
        let (connector, clock) = connector_with(config("a"), transport.clone(), cache_config);
        connector.connect().await.unwrap();

        connector.execute(cached_get("/h")).await.unwrap();
        clock.advance_ms(1_500);

        let stale = connector.execute(cached_get("/h")).await.unwrap();
        assert!(stale.stale);
        assert_eq!(stale.data, json!("v1"));

        for _ in 0..50 {
            if connector.pending_refreshes() == 0 && transport.calls() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.calls(), 2);

        let fresh = connector.execute(cached_get("/h")).await.unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.data, json!("v2"));
    }

    #[tokio::test]
    async fn test_urls_and_deadline() {
        let transport = Scripted::ok(json!(null));
        let mut cfg = config("a");
        cfg.timeout_ms = 1_000;
        cfg.retry = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        let (connector, _clock) = connector_with(cfg, transport.clone(), CacheConfig::default());
        connector.connect().await.unwrap();
        connector
            .execute(ConnectorRequest::get("/search").with_query("q", "jane doe"))
            .await
            .unwrap();
        assert_eq!(
            lock(&transport.urls).as_slice(),
            ["https://api.example.com/search?q=jane%20doe".to_string()]
        );

        // 3 x 1000ms timeouts + (100 + 20) + (200 + 40) backoff + slack
        assert_eq!(connector.deadline(), Duration::from_millis(3_460));
    }

    #[tokio::test]
    async fn test_cancelled_call_counts_as_breaker_failure() {
        let mut cfg = config("a");
        cfg.timeout_ms = 60_000;
        cfg.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 1_000,
            ..Default::default()
        };
        let transport = Scripted::ok(json!("up"));
        let (connector, clock) = connector_with(cfg, transport.clone(), CacheConfig::default());
        connector.connect().await.unwrap();

        transport.stall(true);
        let dropped = tokio::time::timeout(
            Duration::from_millis(20),
            connector.execute(ConnectorRequest::get("/x")),
        )
        .await;
        assert!(dropped.is_err());
        assert!(connector.circuit_breaker().is_open());
        assert_eq!(connector.phase(), ConnectorPhase::Degraded);

        // The half-open trial call is dropped too; the circuit reopens
        clock.advance_ms(1_000);
        let dropped = tokio::time::timeout(
            Duration::from_millis(20),
            connector.execute(ConnectorRequest::get("/x")),
        )
        .await;
        assert!(dropped.is_err());
        assert!(connector.circuit_breaker().is_open());
        assert_eq!(transport.calls(), 2);

        clock.advance_ms(1_000);
        transport.stall(false);
        let response = connector.execute(ConnectorRequest::get("/x")).await.unwrap();
        assert_eq!(response.data, json!("up"));
        assert_eq!(connector.phase(), ConnectorPhase::Connected);
        assert_eq!(connector.circuit_breaker().stats().total_failures, 2);
    }

    #[tokio::test]
    async fn test_invalid_request_is_a_configuration_error() {
        let mut cfg = config("a");
        cfg.retry.max_attempts = 3;
        cfg.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let transport = Scripted::new(vec![Err(TransportError::InvalidRequest(
            "bad method: GE T".into(),
        ))]);
        let (connector, _clock) = connector_with(cfg, transport.clone(), CacheConfig::default());
        connector.connect().await.unwrap();

        let err = connector.execute(ConnectorRequest::get("/x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert!(!err.is_retryable());
        assert_eq!(transport.calls(), 1);
        assert!(!connector.circuit_breaker().is_open());
        assert_eq!(connector.circuit_breaker().stats().total_failures, 0);
        assert_eq!(connector.phase(), ConnectorPhase::Connected);
    }
}
