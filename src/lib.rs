//! integration-gateway - resilient gateway in front of external HTTP APIs
//!
//! Connectors wrap each upstream with a circuit breaker, a multi-window rate
//! limiter, retries and a response cache. Routes combine connector calls
//! under an aggregation strategy.

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
pub mod gateway;
pub mod resilience;
pub mod routing;
pub mod server;

pub use cache::{generate_key, CacheRegistry, ResponseCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConnectorConfig, GatewayConfig};
pub use connector::{Connector, ConnectorRegistry, Transport};
pub use error::{ErrorKind, GatewayError, Result};
pub use gateway::Gateway;
pub use resilience::{CircuitBreaker, RateLimiter};
pub use routing::{AggregationEngine, AggregationStrategy, RouteConfig, RouteMapping, RouteOutcome};
