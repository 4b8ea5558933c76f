/// Per-route circuit breakers guarding upstream services
use dashmap::DashMap;
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::BreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Upstream is failing, requests are rejected without contacting it
    Open,
    /// Cooldown elapsed, a limited number of probe requests are admitted
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Admission decision for a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker is closed, call proceeds normally
    Admit,
    /// Breaker is half-open, call proceeds as a recovery probe
    AdmitProbe,
    /// Breaker is open (or the probe budget is spent), call must not go upstream
    Reject,
}

/// Mutable breaker state, guarded by one mutex per route.
///
/// The critical section covers only the read-check-transition sequence; no
/// I/O happens while it is held.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Rolling window of recent outcomes, true = failure
    window: VecDeque<bool>,
    window_failures: usize,
    opened_at: Option<Instant>,
    half_open_remaining: u32,
}

/// Circuit breaker for a single route
pub struct CircuitBreaker {
    route_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new closed breaker
    pub fn new(route_id: &str, config: BreakerConfig) -> Self {
        Self {
            route_id: route_id.to_string(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                window_failures: 0,
                opened_at: None,
                half_open_remaining: 0,
            }),
        }
    }

    /// Decide whether a request may go upstream.
    ///
    /// An open breaker flips to half-open once `open_duration` has elapsed;
    /// each half-open admission consumes one probe from the trial budget.
    pub fn try_admit(&self) -> Admission {
        self.try_admit_at(Instant::now())
    }

    fn try_admit_at(&self, now: Instant) -> Admission {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == CircuitState::Open {
            let elapsed_open = inner
                .opened_at
                .map(|t| now.duration_since(t) >= self.config.open_duration)
                .unwrap_or(true);
            if elapsed_open {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_remaining = self.config.half_open_trials;
                info!("Breaker '{}' transitioning to half-open", self.route_id);
            }
        }

        match inner.state {
            CircuitState::Closed => Admission::Admit,
            CircuitState::Open => Admission::Reject,
            CircuitState::HalfOpen => {
                if inner.half_open_remaining > 0 {
                    inner.half_open_remaining -= 1;
                    Admission::AdmitProbe
                } else {
                    Admission::Reject
                }
            }
        }
    }

    /// Record a successful upstream outcome
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut inner, self.config.window_size, false);
            }
            CircuitState::HalfOpen => {
                // A recovered probe closes the breaker and wipes the window
                inner.state = CircuitState::Closed;
                inner.window.clear();
                inner.window_failures = 0;
                inner.opened_at = None;
                inner.half_open_remaining = 0;
                info!("Breaker '{}' closed after successful probe", self.route_id);
            }
            CircuitState::Open => {
                // Stale report from a call admitted before the breaker opened
            }
        }
    }

    /// Record a failed upstream outcome
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                Self::push_outcome(&mut inner, self.config.window_size, true);

                let samples = inner.window.len();
                if samples >= self.config.min_samples {
                    let rate = inner.window_failures as f64 / samples as f64;
                    if rate >= self.config.failure_rate_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(now);
                        inner.window.clear();
                        inner.window_failures = 0;
                        warn!(
                            "Breaker '{}' opened at {:.0}% failure rate over {} outcomes",
                            self.route_id,
                            rate * 100.0,
                            samples
                        );
                    }
                }
            }
            CircuitState::HalfOpen => {
                // A single failing probe re-opens immediately
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_remaining = 0;
                warn!("Breaker '{}' re-opened after failed probe", self.route_id);
            }
            CircuitState::Open => {}
        }
    }

    fn push_outcome(inner: &mut BreakerState, window_size: usize, failure: bool) {
        if inner.window.len() == window_size {
            if inner.window.pop_front() == Some(true) {
                inner.window_failures -= 1;
            }
        }
        inner.window.push_back(failure);
        if failure {
            inner.window_failures += 1;
        }
    }

    /// Current state (for health reporting and metrics)
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        // Surface the pending open->half-open transition without admitting
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|t| t.elapsed() >= self.config.open_duration)
                .unwrap_or(true);
            if elapsed {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_remaining = self.config.half_open_trials;
            }
        }
        inner.state
    }
}

/// Registry owning one breaker per route, created lazily on first use
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    /// Get the breaker for a route, creating it on first use
    pub fn get_or_create(&self, route_id: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(route_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(route_id, config.clone())))
            .clone()
    }

    /// Snapshot every known breaker's state, keyed by route id
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<(String, CircuitState)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Number of breakers currently not closed
    pub fn degraded_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| entry.value().state() != CircuitState::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(window: usize, min_samples: usize, open_duration: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "patient-service",
            BreakerConfig {
                window_size: window,
                failure_rate_threshold: 0.5,
                min_samples,
                open_duration,
                half_open_trials: 1,
            },
        )
    }

    #[test]
    fn test_closed_never_blocks() {
        let cb = breaker(4, 2, Duration::from_secs(30));
        for _ in 0..100 {
            assert_eq!(cb.try_admit(), Admission::Admit);
        }
    }

    #[test]
    fn test_opens_at_threshold_with_min_samples() {
        let cb = breaker(4, 2, Duration::from_secs(30));

        // One failure: below minimum sample size, stays closed
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        // Second failure: 2 samples, 100% failure rate >= 50%
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_admit(), Admission::Reject);
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let cb = breaker(20, 10, Duration::from_secs(30));

        // 4 failures in a window of 10 outcomes: 40% < 50%
        for _ in 0..6 {
            cb.record_success();
        }
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_rolling_window_evicts_old_outcomes() {
        let cb = breaker(4, 4, Duration::from_secs(30));

        // Window fills with 2 failures / 2 successes (50% -> would open),
        // but successes recorded later push the failures out first
        cb.record_failure();
        cb.record_success();
        cb.record_success();
        cb.record_success();
        // Window now [F S S S] = 25%
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_success();
        // Oldest failure evicted, window [S S S S]
        cb.record_failure();
        // [S S S F] = 25%, still closed
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_blocks_until_duration_elapses() {
        let cb = breaker(4, 2, Duration::from_secs(3600));
        cb.record_failure();
        cb.record_failure();

        // Far from the cooldown boundary: every admission is rejected
        for _ in 0..10 {
            assert_eq!(cb.try_admit(), Admission::Reject);
        }
    }

    #[test]
    fn test_open_transitions_to_half_open_after_duration() {
        let cb = breaker(4, 2, Duration::ZERO);
        cb.record_failure();
        cb.record_failure();

        // Zero cooldown: next admission is the probe
        assert_eq!(cb.try_admit(), Admission::AdmitProbe);
        // Probe budget of 1 is spent
        assert_eq!(cb.try_admit(), Admission::Reject);
    }

    #[test]
    fn test_probe_success_closes_and_resets() {
        let cb = breaker(4, 2, Duration::ZERO);
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.try_admit(), Admission::AdmitProbe);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);

        // Window was reset: two more failures are again needed to open.
        // With a zero cooldown the re-opened breaker admits a probe.
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.try_admit(), Admission::AdmitProbe);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let cb = breaker(4, 2, Duration::ZERO);
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.try_admit(), Admission::AdmitProbe);
        cb.record_failure();

        // Re-opened; a cooldown of zero means the breaker probes again,
        // one trial at a time
        assert_eq!(cb.try_admit(), Admission::AdmitProbe);
        assert_eq!(cb.try_admit(), Admission::Reject);
    }

    #[test]
    fn test_half_open_budget_bounds_concurrent_probes() {
        let cb = CircuitBreaker::new(
            "encounter-service",
            BreakerConfig {
                window_size: 4,
                failure_rate_threshold: 0.5,
                min_samples: 2,
                open_duration: Duration::ZERO,
                half_open_trials: 2,
            },
        );
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.try_admit(), Admission::AdmitProbe);
        assert_eq!(cb.try_admit(), Admission::AdmitProbe);
        assert_eq!(cb.try_admit(), Admission::Reject);
    }

    #[test]
    fn test_registry_creates_lazily_and_isolates_routes() {
        let registry = BreakerRegistry::new();
        let config = BreakerConfig {
            window_size: 4,
            failure_rate_threshold: 0.5,
            min_samples: 2,
            open_duration: Duration::from_secs(3600),
            half_open_trials: 1,
        };

        let patient = registry.get_or_create("patient-service", &config);
        let encounter = registry.get_or_create("encounter-service", &config);

        patient.record_failure();
        patient.record_failure();

        assert_eq!(patient.state(), CircuitState::Open);
        assert_eq!(encounter.state(), CircuitState::Closed);
        assert_eq!(registry.degraded_count(), 1);

        // Same instance is returned on subsequent lookups
        let again = registry.get_or_create("patient-service", &config);
        assert_eq!(again.state(), CircuitState::Open);
    }
}
