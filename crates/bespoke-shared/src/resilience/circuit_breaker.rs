//! # Generic Circuit Breaker
//!
//! A single `CircuitBreaker` implementation shared by every component that
//! needs fault isolation: the messaging client protecting Task Queue calls,
//! the Result Store client, and the Cache Manager's backend calls.
//!
//! ## States
//!
//! - **Closed**: normal operation, calls pass through.
//! - **Open**: failing fast; calls are rejected until the timeout elapses.
//! - **HalfOpen**: a limited number of calls are let through to probe
//!   recovery; enough successes close the circuit again, any failure
//!   reopens it.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::behavior::CircuitBreakerBehavior;
use super::metrics::CircuitBreakerMetrics;

/// Current state of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Configuration for a circuit breaker instance
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures needed to trip the circuit open
    pub failure_threshold: u32,
    /// How long to stay open before allowing a half-open probe
    pub timeout: Duration,
    /// Consecutive half-open successes needed to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU64,
    half_open_calls: AtomicU64,
    total_duration_nanos: AtomicU64,
}

/// Protects a downstream dependency from cascading failure.
///
/// `should_allow` gates calls; `record_success`/`record_failure` (or their
/// `_manual` variants, used when the operation's timing is measured by the
/// caller rather than by wrapping the future) update the state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    opened_at: Mutex<Option<Instant>>,
    counters: Counters,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            opened_at: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        self.state.store(new_state.as_u8(), Ordering::SeqCst);
        if new_state == CircuitState::Open {
            *self.opened_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        }
        if new_state == CircuitState::Closed {
            self.counters
                .consecutive_failures
                .store(0, Ordering::SeqCst);
        }
        if new_state == CircuitState::HalfOpen {
            self.counters.half_open_calls.store(0, Ordering::SeqCst);
        }
        tracing::info!(name = %self.name, state = ?new_state, "circuit breaker state transition");
    }

    fn record(&self, duration: Duration, success: bool) {
        self.counters.total_calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);

        let state = CircuitState::from_u8(self.state.load(Ordering::SeqCst));

        if success {
            self.counters.success_count.fetch_add(1, Ordering::Relaxed);
            self.counters
                .consecutive_failures
                .store(0, Ordering::SeqCst);

            if state == CircuitState::HalfOpen {
                let successes = self.counters.half_open_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if successes as u32 >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                }
            }
        } else {
            self.counters.failure_count.fetch_add(1, Ordering::Relaxed);
            let failures = self
                .counters
                .consecutive_failures
                .fetch_add(1, Ordering::SeqCst)
                + 1;

            match state {
                CircuitState::HalfOpen => self.transition_to(CircuitState::Open),
                CircuitState::Closed if failures as u32 >= self.config.failure_threshold => {
                    self.transition_to(CircuitState::Open);
                }
                _ => {}
            }
        }
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn should_allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .map(|at| at.elapsed());
                match elapsed {
                    Some(e) if e >= self.config.timeout => {
                        self.transition_to(CircuitState::HalfOpen);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    fn record_success(&self, duration: Duration) {
        self.record(duration, true);
    }

    fn record_failure(&self, duration: Duration) {
        self.record(duration, false);
    }

    fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }

    fn force_open(&self) {
        self.transition_to(CircuitState::Open);
    }

    fn force_closed(&self) {
        self.transition_to(CircuitState::Closed);
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let total_calls = self.counters.total_calls.load(Ordering::Relaxed);
        let success_count = self.counters.success_count.load(Ordering::Relaxed);
        let failure_count = self.counters.failure_count.load(Ordering::Relaxed);
        let total_duration =
            Duration::from_nanos(self.counters.total_duration_nanos.load(Ordering::Relaxed));

        let failure_rate = if total_calls == 0 {
            0.0
        } else {
            failure_count as f64 / total_calls as f64
        };
        let success_rate = if total_calls == 0 {
            0.0
        } else {
            success_count as f64 / total_calls as f64
        };
        let average_duration = if total_calls == 0 {
            Duration::ZERO
        } else {
            total_duration / total_calls as u32
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count,
            failure_count,
            consecutive_failures: self.counters.consecutive_failures.load(Ordering::Relaxed),
            half_open_calls: self.counters.half_open_calls.load(Ordering::Relaxed),
            total_duration,
            current_state: self.state(),
            failure_rate,
            success_rate,
            average_duration,
        }
    }
}

impl CircuitBreaker {
    /// Record success without going through the `CircuitBreakerBehavior` trait
    /// (used at call sites that already `impl Trait`-pattern match on the
    /// concrete type, matching the messaging client's call sites).
    pub fn record_success_manual(&self, duration: Duration) {
        self.record_success(duration);
    }

    /// Record failure without going through the trait object path
    pub fn record_failure_manual(&self, duration: Duration) {
        self.record_failure(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test".to_string(),
            CircuitBreakerConfig {
                failure_threshold,
                timeout: Duration::from_millis(50),
                success_threshold,
            },
        )
    }

    #[test]
    fn starts_closed_and_allows() {
        let cb = breaker(3, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(3, 2);
        for _ in 0..3 {
            cb.record_failure(Duration::ZERO);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = breaker(3, 2);
        cb.record_failure(Duration::ZERO);
        cb.record_failure(Duration::ZERO);
        cb.record_success(Duration::ZERO);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_opens_after_timeout_then_closes_on_success() {
        let cb = breaker(1, 1);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(1, 2);
        cb.force_open();
        // simulate the timeout having passed by forcing half-open via should_allow's
        // internal transition is time-based; exercise the explicit path instead
        cb.transition_to(CircuitState::HalfOpen);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn force_open_and_closed() {
        let cb = breaker(3, 2);
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.force_closed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
