//! Three-state circuit breaker, one instance per upstream service.
//!
//! Mirrors the reference implementation's admission-time accounting: the
//! HALF_OPEN probe counter is incremented inside `can_execute`, not when the
//! probe's result is later recorded. A probe that is admitted but never
//! completes (e.g. the caller crashes) still counts against the half-open
//! budget — this is the documented, intentional behavior, not a bug.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    last_state_change: Option<Instant>,
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_count: u32,
    opened_at: Option<Instant>,
    counters: Counters,
}

/// Per-service breaker configuration, copied out of `UpstreamServiceConfig`.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_requests: u32,
}

/// Cumulative request counts and timestamps for one breaker, surfaced via the
/// admin `/circuit-breakers` endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_failure_secs_ago: Option<f64>,
    pub last_success_secs_ago: Option<f64>,
    pub last_state_change_secs_ago: Option<f64>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_count: 0,
                opened_at: None,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker mutex poisoned").state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        let counters = &inner.counters;
        CircuitStats {
            total_requests: counters.total_requests,
            successful_requests: counters.successful_requests,
            failed_requests: counters.failed_requests,
            last_failure_secs_ago: counters.last_failure.map(|t| t.elapsed().as_secs_f64()),
            last_success_secs_ago: counters.last_success.map(|t| t.elapsed().as_secs_f64()),
            last_state_change_secs_ago: counters.last_state_change.map(|t| t.elapsed().as_secs_f64()),
        }
    }

    /// Admission check. Performs the OPEN → HALF_OPEN transition when the
    /// recovery timeout has elapsed, then — if HALF_OPEN — admits the request
    /// only while under `half_open_requests` and increments the probe counter
    /// as part of the same admission decision.
    ///
    /// Returns `(admitted, rejection_reason)`; the reason is `Some` only when
    /// admission is refused and always contains `"Circuit open"`.
    pub fn can_execute(&self) -> (bool, Option<String>) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_count = 1;
                    (true, None)
                } else {
                    let remaining = (self.config.recovery_timeout - elapsed).as_secs_f64();
                    (false, Some(format!("Circuit open, retry in {remaining:.1}s")))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_count < self.config.half_open_requests {
                    inner.half_open_count += 1;
                    (true, None)
                } else {
                    (false, Some("Circuit open (half-open probe budget exhausted)".to_string()))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.counters.total_requests += 1;
        inner.counters.successful_requests += 1;
        inner.counters.last_success = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.half_open_requests {
                    Self::transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.counters.total_requests += 1;
        inner.counters.failed_requests += 1;
        inner.counters.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                Self::transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to(inner: &mut CircuitInner, new_state: CircuitState) {
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_count = 0;
        inner.opened_at = if new_state == CircuitState::Open { Some(Instant::now()) } else { None };
        inner.state = new_state;
        inner.counters.last_state_change = Some(Instant::now());
    }
}

/// Registry of breakers keyed by upstream service name, created lazily and
/// idempotently on first access.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, std::sync::Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self { breakers: DashMap::new() }
    }

    pub fn get_or_create(
        &self,
        service: &str,
        config: BreakerConfig,
    ) -> std::sync::Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(config)))
            .value()
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<std::sync::Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<(String, std::sync::Arc<CircuitBreaker>)> {
        self.breakers.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect()
    }

    /// Force every registered breaker back to CLOSED — used by the admin
    /// `/circuit-breakers/reset` endpoint.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            let mut inner = entry.value().inner.lock().expect("circuit breaker mutex poisoned");
            CircuitBreaker::transition_to(&mut inner, CircuitState::Closed);
        }
    }

    pub fn reset_one(&self, service: &str) -> bool {
        match self.breakers.get(service) {
            Some(entry) => {
                let mut inner = entry.value().inner.lock().expect("circuit breaker mutex poisoned");
                CircuitBreaker::transition_to(&mut inner, CircuitState::Closed);
                true
            }
            None => false,
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            half_open_requests: 2,
        }
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new(config());
        assert!(cb.can_execute().0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        let (admit, reason) = cb.can_execute();
        assert!(!admit);
        assert!(reason.unwrap().contains("Circuit open"));
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let cb = CircuitBreaker::new(config());
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_recovery_timeout() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.can_execute().0);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_enough_successes() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.can_execute().0);
        cb.record_success();
        assert!(cb.can_execute().0);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_any_failure() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.can_execute().0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_admission_limit_counts_at_admission_time() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        // half_open_requests == 2: exactly two probes may be admitted.
        assert!(cb.can_execute().0);
        assert!(cb.can_execute().0);
        assert!(!cb.can_execute().0);
    }

    #[test]
    fn open_reason_reports_remaining_retry_interval() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        let (admit, reason) = cb.can_execute();
        assert!(!admit);
        let reason = reason.unwrap();
        assert!(reason.contains("Circuit open"));
        assert!(reason.contains("retry in"));
    }

    #[test]
    fn stats_track_cumulative_counts() {
        let cb = CircuitBreaker::new(config());
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        let stats = cb.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.failed_requests, 2);
        assert!(stats.last_success_secs_ago.is_some());
        assert!(stats.last_failure_secs_ago.is_some());
    }

    #[test]
    fn registry_get_or_create_is_idempotent() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("svc", config());
        let b = registry.get_or_create("svc", config());
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reset_all_closes_every_breaker() {
        let registry = CircuitBreakerRegistry::new();
        let cb = registry.get_or_create("svc", config());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        registry.reset_all();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
