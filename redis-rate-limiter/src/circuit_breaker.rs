//! Per-endpoint circuit breaker guarding Redis calls.
//!
//! One state machine per `host:port`, mutated under a short-held lock.
//! Mirrors the classic closed -> open -> half_open -> closed cycle; nothing
//! here is Redis-specific, `execute` just wraps an arbitrary fallible future.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub failure_window: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

struct EndpointState {
    circuit: CircuitState,
    failure_count: u32,
    success_count: u32,
    window_start: Option<Instant>,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            circuit: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            window_start: None,
            last_failure: None,
            half_open_in_flight: 0,
        }
    }
}

/// Result of asking the breaker to run an operation. `Blocked` means the
/// breaker never attempted `op`; the caller decides whether that is a
/// fail-open "proceed anyway" or a fail-closed rejection.
pub enum CircuitOutcome<T, E> {
    Allowed(Result<T, E>),
    Blocked,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    endpoints: DashMap<String, Mutex<EndpointState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            endpoints: DashMap::new(),
        }
    }

    fn allow_request(&self, endpoint: &str) -> bool {
        let guard = self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| Mutex::new(EndpointState::default()));
        let mut state = guard.lock();

        match state.circuit {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let expired = state
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if expired {
                    trace!(endpoint, "circuit half-opening");
                    state.circuit = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight >= self.config.half_open_max_calls {
                    false
                } else {
                    state.half_open_in_flight += 1;
                    true
                }
            }
        }
    }

    fn record_success(&self, endpoint: &str) {
        if let Some(guard) = self.endpoints.get(endpoint) {
            let mut state = guard.lock();
            match state.circuit {
                CircuitState::HalfOpen => {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        trace!(endpoint, "circuit closed");
                        state.circuit = CircuitState::Closed;
                        state.failure_count = 0;
                        state.success_count = 0;
                        state.window_start = None;
                    }
                }
                CircuitState::Closed => {
                    state.failure_count = 0;
                }
                CircuitState::Open => {}
            }
        }
    }

    fn record_failure(&self, endpoint: &str) {
        let guard = self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| Mutex::new(EndpointState::default()));
        let mut state = guard.lock();
        let now = Instant::now();

        match state.circuit {
            CircuitState::HalfOpen => {
                warn!(endpoint, "circuit reopened, half-open probe failed");
                state.circuit = CircuitState::Open;
                state.last_failure = Some(now);
                state.half_open_in_flight = 0;
                state.failure_count = 0;
                state.success_count = 0;
            }
            CircuitState::Closed => {
                let window_start = *state.window_start.get_or_insert(now);
                if now.duration_since(window_start) > self.config.failure_window {
                    state.failure_count = 0;
                    state.window_start = Some(now);
                }
                state.failure_count += 1;
                state.last_failure = Some(now);
                if state.failure_count >= self.config.failure_threshold {
                    warn!(endpoint, failures = state.failure_count, "circuit opened");
                    state.circuit = CircuitState::Open;
                }
            }
            CircuitState::Open => {
                state.last_failure = Some(now);
            }
        }
    }

    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.endpoints
            .get(endpoint)
            .map(|g| g.lock().circuit)
            .unwrap_or(CircuitState::Closed)
    }

    /// Run `op` if the breaker allows it, recording the outcome. Does not
    /// itself implement fail-open/fail-closed policy -- see spec.md 4.5.
    pub async fn execute<T, E, F, Fut>(&self, endpoint: &str, op: F) -> CircuitOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.allow_request(endpoint) {
            return CircuitOutcome::Blocked;
        }

        match op().await {
            Ok(v) => {
                self.record_success(endpoint);
                CircuitOutcome::Allowed(Ok(v))
            }
            Err(e) => {
                self.record_failure(endpoint);
                CircuitOutcome::Allowed(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        });

        for _ in 0..2 {
            let outcome = breaker
                .execute("redis:6379", || async { Err::<(), _>("boom") })
                .await;
            assert!(matches!(outcome, CircuitOutcome::Allowed(Err(_))));
        }

        assert_eq!(breaker.state("redis:6379"), CircuitState::Open);

        let outcome = breaker
            .execute("redis:6379", || async { Ok::<_, &str>(()) })
            .await;
        assert!(matches!(outcome, CircuitOutcome::Blocked));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout: Duration::from_millis(0),
            ..CircuitBreakerConfig::default()
        });

        let _ = breaker
            .execute("redis:6379", || async { Err::<(), _>("boom") })
            .await;
        assert_eq!(breaker.state("redis:6379"), CircuitState::Open);

        for _ in 0..2 {
            let outcome = breaker
                .execute("redis:6379", || async { Ok::<_, &str>(()) })
                .await;
            assert!(matches!(outcome, CircuitOutcome::Allowed(Ok(()))));
        }

        assert_eq!(breaker.state("redis:6379"), CircuitState::Closed);
    }
}
