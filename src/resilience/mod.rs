//! Circuit breaking and rate limiting
//!
//! This module provides the two per-connector guards consulted before any
//! outbound call:
//! - Circuit breaker with closed / open / half-open phases and single-probe recovery
//! - Rate limiter with independent minute, hour and day budgets
//!
//! Both are synchronous and lock only for the duration of a bookkeeping
//! update, so they can be consulted from any task without awaiting.

pub mod circuit;
pub mod rate_limit;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitPhase, CircuitStats};
pub use rate_limit::{
    Granularity, GranularityUsage, RateDecision, RateLimitConfig, RateLimitMetrics, RateLimitWindow,
    RateLimiter,
};
