//! Multi-granularity rate limiter
//!
//! Each connector carries independent budgets per minute, hour and day. A
//! request is admitted only when every configured granularity still has
//! budget in its current window, and admission decrements all of them under
//! one lock so concurrent callers can never overdraw.
//!
//! Windows are fixed and aligned to epoch boundaries. A window's counter is
//! created on the first request that lands in it and dropped once a later
//! window for the same granularity is touched.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::clock::SharedClock;

/// Time granularity of a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Minute, Granularity::Hour, Granularity::Day];

    /// Window length in milliseconds
    pub fn window_ms(&self) -> u64 {
        match self {
            Granularity::Minute => 60_000,
            Granularity::Hour => 3_600_000,
            Granularity::Day => 86_400_000,
        }
    }

    /// Start of the window containing `now_ms`
    pub fn window_start(&self, now_ms: u64) -> u64 {
        now_ms - now_ms % self.window_ms()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Budgets per granularity; `None` means unlimited
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day: Option<u32>,
}

impl RateLimitConfig {
    pub fn limit(&self, granularity: Granularity) -> Option<u32> {
        match granularity {
            Granularity::Minute => self.per_minute,
            Granularity::Hour => self.per_hour,
            Granularity::Day => self.per_day,
        }
    }

    /// Configured granularities with their budgets
    pub fn budgets(&self) -> impl Iterator<Item = (Granularity, u32)> + '_ {
        Granularity::ALL
            .into_iter()
            .filter_map(|g| self.limit(g).map(|limit| (g, limit)))
    }

    pub fn is_unlimited(&self) -> bool {
        self.budgets().next().is_none()
    }
}

/// Outcome of an admission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied {
        /// Whole seconds until the request could be admitted, always >= 1
        retry_after_secs: u64,
        /// Granularity whose rollover the caller is waiting for
        granularity: Granularity,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// A counter bucket for one granularity window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitWindow {
    pub granularity: Granularity,
    pub window_start_ms: u64,
    pub used: u32,
}

/// Remaining budget for one granularity
#[derive(Debug, Clone, Serialize)]
pub struct GranularityUsage {
    pub granularity: Granularity,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub resets_in_secs: u64,
}

/// Read-only limiter snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitMetrics {
    pub connector_id: String,
    pub total_allowed: u64,
    pub total_denied: u64,
    pub granularities: Vec<GranularityUsage>,
}

impl RateLimitMetrics {
    pub fn remaining(&self, granularity: Granularity) -> Option<u32> {
        self.granularities
            .iter()
            .find(|u| u.granularity == granularity)
            .map(|u| u.remaining)
    }
}

#[derive(Default)]
struct LimiterState {
    windows: HashMap<(Granularity, u64), RateLimitWindow>,
    total_allowed: u64,
    total_denied: u64,
}

impl LimiterState {
    fn used(&self, granularity: Granularity, start: u64) -> u32 {
        self.windows
            .get(&(granularity, start))
            .map(|w| w.used)
            .unwrap_or(0)
    }
}

/// Per-connector rate limiter
pub struct RateLimiter {
    connector_id: String,
    config: RateLimitConfig,
    clock: SharedClock,
    state: Mutex<LimiterState>,
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1_000).max(1)
}

impl RateLimiter {
    pub fn new(connector_id: impl Into<String>, config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            connector_id: connector_id.into(),
            config,
            clock,
            state: Mutex::new(LimiterState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to consume one unit from every configured granularity
    pub fn try_acquire(&self) -> RateDecision {
        let now = self.clock.now_ms();
        let mut state = self.lock();

        // Windows from earlier periods are no longer referenced
        state
            .windows
            .retain(|(g, start), _| *start == g.window_start(now));

        let mut denied: Option<(Granularity, u64)> = None;
        for (granularity, limit) in self.config.budgets() {
            let start = granularity.window_start(now);
            if state.used(granularity, start) >= limit {
                let wait_ms = start + granularity.window_ms() - now;
                // Report the nearest rollover among the exhausted windows
                if denied.map_or(true, |(_, w)| wait_ms < w) {
                    denied = Some((granularity, wait_ms));
                }
            }
        }

        if let Some((granularity, wait_ms)) = denied {
            state.total_denied += 1;
            let retry_after_secs = ceil_secs(wait_ms);
            debug!(
                connector = %self.connector_id,
                granularity = %granularity,
                retry_after_secs,
                "Rate limit denied request"
            );
            return RateDecision::Denied {
                retry_after_secs,
                granularity,
            };
        }

        for (granularity, _) in self.config.budgets() {
            let start = granularity.window_start(now);
            state
                .windows
                .entry((granularity, start))
                .or_insert(RateLimitWindow {
                    granularity,
                    window_start_ms: start,
                    used: 0,
                })
                .used += 1;
        }
        state.total_allowed += 1;
        RateDecision::Allowed
    }

    /// Clear every window
    pub fn reset(&self) {
        let mut state = self.lock();
        state.windows.clear();
        info!(connector = %self.connector_id, "Rate limiter reset");
    }

    /// Remaining budget per granularity; never mutates windows
    pub fn metrics(&self) -> RateLimitMetrics {
        let now = self.clock.now_ms();
        let state = self.lock();
        let granularities = self
            .config
            .budgets()
            .map(|(granularity, limit)| {
                let start = granularity.window_start(now);
                let used = state.used(granularity, start);
                GranularityUsage {
                    granularity,
                    limit,
                    used,
                    remaining: limit.saturating_sub(used),
                    resets_in_secs: ceil_secs(start + granularity.window_ms() - now),
                }
            })
            .collect();

        RateLimitMetrics {
            connector_id: self.connector_id.clone(),
            total_allowed: state.total_allowed,
            total_denied: state.total_denied,
            granularities,
        }
    }

    /// Live windows, for diagnostics
    pub fn windows(&self) -> Vec<RateLimitWindow> {
        let mut windows: Vec<_> = self.lock().windows.values().copied().collect();
        windows.sort_by_key(|w| w.granularity);
        windows
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("connector_id", &self.connector_id)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    // 2024-01-01T00:00:00Z, aligned to every granularity
    const MIDNIGHT: u64 = 1_704_067_200_000;

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(MIDNIGHT));
        (RateLimiter::new("test", config, clock.clone()), clock)
    }

    #[test]
    fn test_exactly_n_allowed_per_minute() {
        let (limiter, _clock) = limiter(RateLimitConfig {
            per_minute: Some(5),
            ..Default::default()
        });

        for _ in 0..5 {
            assert!(limiter.try_acquire().is_allowed());
        }
        match limiter.try_acquire() {
            RateDecision::Denied {
                retry_after_secs,
                granularity,
            } => {
                assert_eq!(granularity, Granularity::Minute);
                assert_eq!(retry_after_secs, 60);
            }
            RateDecision::Allowed => panic!("sixth request should be denied"),
        }
        // Stays denied for the rest of the window
        assert!(!limiter.try_acquire().is_allowed());
    }

    #[test]
    fn test_window_rollover_restores_budget() {
        let (limiter, clock) = limiter(RateLimitConfig {
            per_minute: Some(2),
            ..Default::default()
        });
        assert!(limiter.try_acquire().is_allowed());
        assert!(limiter.try_acquire().is_allowed());

        clock.advance_ms(59_500);
        match limiter.try_acquire() {
            RateDecision::Denied {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 1),
            RateDecision::Allowed => panic!("should still be denied"),
        }

        clock.advance_ms(500);
        assert!(limiter.try_acquire().is_allowed());
        assert_eq!(limiter.windows().len(), 1);
    }

    #[test]
    fn test_all_granularities_must_allow() {
        let (limiter, clock) = limiter(RateLimitConfig {
            per_minute: Some(10),
            per_hour: Some(3),
            per_day: None,
        });
        for _ in 0..3 {
            assert!(limiter.try_acquire().is_allowed());
        }

        // Minute budget has room, hour budget does not
        clock.advance_ms(60_000);
        match limiter.try_acquire() {
            RateDecision::Denied {
                retry_after_secs,
                granularity,
            } => {
                assert_eq!(granularity, Granularity::Hour);
                assert_eq!(retry_after_secs, 3_540);
            }
            RateDecision::Allowed => panic!("hour budget exhausted"),
        }

        // A denied attempt consumes nothing
        let metrics = limiter.metrics();
        assert_eq!(metrics.remaining(Granularity::Minute), Some(10));
        assert_eq!(metrics.remaining(Granularity::Hour), Some(0));
    }

    #[test]
    fn test_nearest_rollover_when_several_budgets_exhausted() {
        let (limiter, clock) = limiter(RateLimitConfig {
            per_minute: Some(3),
            per_hour: Some(3),
            per_day: None,
        });
        clock.advance_ms(30_000);
        for _ in 0..3 {
            assert!(limiter.try_acquire().is_allowed());
        }

        match limiter.try_acquire() {
            RateDecision::Denied {
                retry_after_secs,
                granularity,
            } => {
                assert_eq!(granularity, Granularity::Minute);
                assert_eq!(retry_after_secs, 30);
            }
            RateDecision::Allowed => panic!("both budgets exhausted"),
        }

        // The minute rolled over but the hour is still spent
        clock.advance_ms(30_000);
        match limiter.try_acquire() {
            RateDecision::Denied {
                retry_after_secs,
                granularity,
            } => {
                assert_eq!(granularity, Granularity::Hour);
                assert_eq!(retry_after_secs, 3_540);
            }
            RateDecision::Allowed => panic!("hour budget exhausted"),
        }
    }

    #[test]
    fn test_metrics_do_not_mutate() {
        let (limiter, _clock) = limiter(RateLimitConfig {
            per_minute: Some(3),
            per_hour: Some(100),
            per_day: Some(1_000),
        });
        limiter.try_acquire();

        let first = limiter.metrics();
        let second = limiter.metrics();
        assert_eq!(first.remaining(Granularity::Minute), Some(2));
        assert_eq!(second.remaining(Granularity::Minute), Some(2));
        assert_eq!(second.remaining(Granularity::Hour), Some(99));
        assert_eq!(second.remaining(Granularity::Day), Some(999));
        assert_eq!(second.total_allowed, 1);
    }

    #[test]
    fn test_reset_clears_windows() {
        let (limiter, _clock) = limiter(RateLimitConfig {
            per_minute: Some(1),
            ..Default::default()
        });
        assert!(limiter.try_acquire().is_allowed());
        assert!(!limiter.try_acquire().is_allowed());

        limiter.reset();
        assert!(limiter.try_acquire().is_allowed());
    }

    #[test]
    fn test_unlimited_always_acquires() {
        let (limiter, _clock) = limiter(RateLimitConfig::default());
        assert!(limiter.config().is_unlimited());
        for _ in 0..1_000 {
            assert!(limiter.try_acquire().is_allowed());
        }
        assert!(limiter.metrics().granularities.is_empty());
    }

    #[test]
    fn test_concurrent_acquire_never_overdraws() {
        let clock = Arc::new(ManualClock::new(MIDNIGHT));
        let limiter = Arc::new(RateLimiter::new(
            "test",
            RateLimitConfig {
                per_minute: Some(50),
                per_hour: Some(60),
                per_day: None,
            },
            clock,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..25).filter(|_| limiter.try_acquire().is_allowed()).count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
        let metrics = limiter.metrics();
        assert_eq!(metrics.remaining(Granularity::Minute), Some(0));
        assert_eq!(metrics.remaining(Granularity::Hour), Some(10));
    }
}
