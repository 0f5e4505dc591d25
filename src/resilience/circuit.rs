//! Circuit breaker implementation for fault tolerance
//!
//! This module implements a per-connector circuit breaker with three phases:
//! - Closed: Normal operation, requests are allowed and failures are counted
//! - Open: The integration is failing, requests are rejected until the cooldown ends
//! - HalfOpen: A single probe request is let through to test recovery
//!
//! The breaker is agnostic to what a failure is; the connector decides and
//! reports outcomes through [`CircuitBreaker::record_success`] and
//! [`CircuitBreaker::record_failure`].

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;

/// Circuit breaker phases
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitPhase {
    /// Normal operation - requests are allowed
    Closed,

    /// Integration has failed - requests are rejected
    Open {
        /// When the circuit may transition to HalfOpen (epoch ms)
        retry_at_ms: u64,

        /// Number of failures that caused the circuit to open
        failure_count: u32,
    },

    /// Testing recovery - one probe at a time
    HalfOpen {
        /// Whether a probe has been admitted and has not reported back yet
        probe_in_flight: bool,

        /// Successful probes so far
        success_count: u32,
    },
}

impl CircuitPhase {
    /// Get a human-readable phase name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitPhase::Closed => "closed",
            CircuitPhase::Open { .. } => "open",
            CircuitPhase::HalfOpen { .. } => "half_open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Number of successful probes needed to close the circuit from half-open
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long the circuit stays open before admitting a probe
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Count failures inside this sliding window instead of consecutive failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_window_ms: Option<u64>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_ms: default_cooldown_ms(),
            failure_window_ms: None,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    /// Current phase name
    pub phase: &'static str,

    /// Failures counted toward the threshold
    pub consecutive_failures: u32,

    /// Total successes recorded
    pub total_successes: u64,

    /// Total failures recorded
    pub total_failures: u64,

    /// Calls rejected while open or while a probe was in flight
    pub total_rejections: u64,

    /// Number of times the circuit has opened
    pub open_count: u64,

    /// Time since last phase transition
    pub time_in_phase_ms: u64,

    /// When an open circuit will admit a probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at_ms: Option<u64>,
}

struct BreakerState {
    phase: CircuitPhase,
    consecutive_failures: u32,
    recent_failures: Vec<u64>,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    open_count: u64,
    last_transition_ms: u64,
}

/// Per-connector circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now_ms();
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(BreakerState {
                phase: CircuitPhase::Closed,
                consecutive_failures: 0,
                recent_failures: Vec::new(),
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
                open_count: 0,
                last_transition_ms: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a request may proceed
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and admits
    /// the caller as its single probe. Every admitted call must later report
    /// an outcome, or call [`CircuitBreaker::release_probe`] if it never
    /// reached the integration.
    pub fn should_allow(&self) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();

        let allowed = match state.phase {
            CircuitPhase::Closed => true,
            CircuitPhase::Open { retry_at_ms, .. } => {
                if now >= retry_at_ms {
                    info!(connector = %self.name, "Circuit transitioning from Open to HalfOpen");
                    state.phase = CircuitPhase::HalfOpen {
                        probe_in_flight: true,
                        success_count: 0,
                    };
                    state.last_transition_ms = now;
                    true
                } else {
                    false
                }
            }
            CircuitPhase::HalfOpen {
                probe_in_flight,
                success_count,
            } => {
                if probe_in_flight {
                    false
                } else {
                    state.phase = CircuitPhase::HalfOpen {
                        probe_in_flight: true,
                        success_count,
                    };
                    true
                }
            }
        };

        if !allowed {
            state.total_rejections += 1;
        }
        allowed
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.total_successes += 1;
        state.consecutive_failures = 0;

        match state.phase {
            CircuitPhase::Closed => {}

            CircuitPhase::Open { .. } => {
                // A call admitted before the circuit opened finished late
                debug!(connector = %self.name, "Recorded success in Open state");
            }

            CircuitPhase::HalfOpen { success_count, .. } => {
                let success_count = success_count + 1;
                if success_count >= self.config.success_threshold {
                    info!(
                        connector = %self.name,
                        success_count,
                        "Circuit transitioning from HalfOpen to Closed"
                    );
                    Self::transition_to_closed(&mut state, now);
                } else {
                    state.phase = CircuitPhase::HalfOpen {
                        probe_in_flight: false,
                        success_count,
                    };
                }
            }
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.total_failures += 1;
        state.consecutive_failures += 1;

        if let Some(window) = self.config.failure_window_ms {
            state.recent_failures.push(now);
            state
                .recent_failures
                .retain(|&t| now.saturating_sub(t) < window);
        }

        match state.phase {
            CircuitPhase::Closed => {
                let counted = match self.config.failure_window_ms {
                    Some(_) => state.recent_failures.len() as u32,
                    None => state.consecutive_failures,
                };
                debug!(
                    connector = %self.name,
                    failures = counted,
                    threshold = self.config.failure_threshold,
                    "Request failed in Closed state"
                );

                if counted >= self.config.failure_threshold {
                    warn!(
                        connector = %self.name,
                        failures = counted,
                        "Circuit transitioning from Closed to Open"
                    );
                    self.transition_to_open(&mut state, now, counted);
                }
            }

            CircuitPhase::Open { .. } => {
                debug!(connector = %self.name, "Request failed in Open state");
            }

            CircuitPhase::HalfOpen { .. } => {
                warn!(connector = %self.name, "Probe failed in HalfOpen state - reopening circuit");
                let failures = state.consecutive_failures;
                self.transition_to_open(&mut state, now, failures);
            }
        }
    }

    /// Give back a half-open probe slot that never reached the integration
    pub fn release_probe(&self) {
        let mut state = self.lock();
        if let CircuitPhase::HalfOpen { success_count, .. } = state.phase {
            state.phase = CircuitPhase::HalfOpen {
                probe_in_flight: false,
                success_count,
            };
        }
    }

    /// Manually reset the circuit to closed
    pub fn reset(&self) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        info!(connector = %self.name, "Manually resetting circuit to Closed");
        Self::transition_to_closed(&mut state, now);
    }

    /// Current phase
    ///
    /// An open circuit past its cooldown is still reported as open until the
    /// next call to [`CircuitBreaker::should_allow`] admits a probe.
    pub fn phase(&self) -> CircuitPhase {
        self.lock().phase.clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.lock().phase, CircuitPhase::Open { .. })
    }

    pub fn stats(&self) -> CircuitStats {
        let now = self.clock.now_ms();
        let state = self.lock();
        let retry_at_ms = match state.phase {
            CircuitPhase::Open { retry_at_ms, .. } => Some(retry_at_ms),
            _ => None,
        };
        CircuitStats {
            phase: state.phase.name(),
            consecutive_failures: state.consecutive_failures,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
            open_count: state.open_count,
            time_in_phase_ms: now.saturating_sub(state.last_transition_ms),
            retry_at_ms,
        }
    }

    fn transition_to_closed(state: &mut BreakerState, now: u64) {
        state.phase = CircuitPhase::Closed;
        state.consecutive_failures = 0;
        state.recent_failures.clear();
        state.last_transition_ms = now;
    }

    fn transition_to_open(&self, state: &mut BreakerState, now: u64, failure_count: u32) {
        state.phase = CircuitPhase::Open {
            retry_at_ms: now + self.config.cooldown_ms,
            failure_count,
        };
        state.open_count += 1;
        state.last_transition_ms = now;
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown_ms: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            success_threshold: 1,
            cooldown_ms,
            failure_window_ms: None,
        };
        (CircuitBreaker::new("test", config, clock.clone()), clock)
    }

    #[test]
    fn test_circuit_closed_to_open() {
        let (breaker, _clock) = breaker(3, 1_000);
        assert!(breaker.should_allow());

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();

        assert!(breaker.is_open());
        assert!(!breaker.should_allow());
        assert_eq!(breaker.stats().open_count, 1);
        assert_eq!(breaker.stats().total_rejections, 1);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let (breaker, _clock) = breaker(3, 1_000);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let (breaker, clock) = breaker(2, 100);
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.should_allow());

        clock.advance_ms(99);
        assert!(!breaker.should_allow());

        clock.advance_ms(1);
        assert!(breaker.should_allow());
        assert!(matches!(
            breaker.phase(),
            CircuitPhase::HalfOpen {
                probe_in_flight: true,
                ..
            }
        ));

        // Exactly one probe
        assert!(!breaker.should_allow());
        assert!(!breaker.should_allow());
    }

    #[test]
    fn test_circuit_half_open_to_closed() {
        let (breaker, clock) = breaker(2, 100);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance_ms(150);

        assert!(breaker.should_allow());
        breaker.record_success();

        assert_eq!(breaker.phase(), CircuitPhase::Closed);
        assert!(breaker.should_allow());
        assert!(breaker.should_allow());
    }

    #[test]
    fn test_circuit_half_open_to_open_restarts_cooldown() {
        let (breaker, clock) = breaker(2, 100);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance_ms(150);

        assert!(breaker.should_allow());
        breaker.record_failure();

        match breaker.phase() {
            CircuitPhase::Open { retry_at_ms, .. } => {
                assert_eq!(retry_at_ms, clock.now_ms() + 100);
            }
            other => panic!("expected open, got {:?}", other),
        }
        assert!(!breaker.should_allow());
        assert_eq!(breaker.stats().open_count, 2);
    }

    #[test]
    fn test_release_probe_readmits() {
        let (breaker, clock) = breaker(1, 10);
        breaker.record_failure();
        clock.advance_ms(10);

        assert!(breaker.should_allow());
        assert!(!breaker.should_allow());
        breaker.release_probe();
        assert!(breaker.should_allow());
    }

    #[test]
    fn test_success_threshold_requires_multiple_probes() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            cooldown_ms: 10,
            failure_window_ms: None,
        };
        let breaker = CircuitBreaker::new("test", config, clock.clone());
        breaker.record_failure();
        clock.advance_ms(10);

        assert!(breaker.should_allow());
        breaker.record_success();
        assert_eq!(breaker.phase().name(), "half_open");

        assert!(breaker.should_allow());
        breaker.record_success();
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
    }

    #[test]
    fn test_windowed_failures() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown_ms: 1_000,
            failure_window_ms: Some(100),
        };
        let breaker = CircuitBreaker::new("test", config, clock.clone());

        breaker.record_failure();
        breaker.record_failure();
        clock.advance_ms(150);
        // The first two aged out of the window
        breaker.record_failure();
        assert!(!breaker.is_open());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_manual_reset() {
        let (breaker, _clock) = breaker(1, 60_000);
        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.reset();
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
        assert!(breaker.should_allow());
    }

    #[test]
    fn test_circuit_phase_names() {
        assert_eq!(CircuitPhase::Closed.name(), "closed");
        assert_eq!(
            CircuitPhase::Open {
                retry_at_ms: 0,
                failure_count: 5
            }
            .name(),
            "open"
        );
        assert_eq!(
            CircuitPhase::HalfOpen {
                probe_in_flight: false,
                success_count: 0
            }
            .name(),
            "half_open"
        );
    }
}
