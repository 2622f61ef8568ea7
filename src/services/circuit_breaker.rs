//! Circuit breaker for external service calls.
//!
//! ## State machine
//! - **Closed**: normal operation, all attempts pass
//! - **Open**: attempts are rejected until `timeout` has elapsed
//! - **HalfOpen**: exactly one trial attempt is allowed; success closes the
//!   circuit, failure reopens it
//!
//! Transitions: `failure_threshold` consecutive failures trip Closed → Open;
//! Open → HalfOpen after `timeout`; HalfOpen → Closed on a successful trial.
//!
//! Named instances live in a process-wide registry so the status endpoint
//! can report every breaker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::CircuitBreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time to wait in open state before allowing a trial attempt
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            timeout: settings.timeout,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    /// A half-open trial is in flight; further attempts wait for its verdict
    trial_in_flight: bool,
}

/// Snapshot of a breaker for the status endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerReport {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub seconds_since_state_change: u64,
}

/// A single named circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_state_change: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("breaker lock poisoned").state
    }

    /// Whether a call may proceed right now. Transitions Open → HalfOpen
    /// once the timeout has elapsed and hands out the single trial slot.
    pub fn can_attempt(&self) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if state.last_state_change.elapsed() >= self.config.timeout {
                    info!(breaker = %self.name, "Circuit breaker half-open, allowing trial");
                    state.state = CircuitState::HalfOpen;
                    state.last_state_change = Instant::now();
                    state.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    false
                } else {
                    state.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if state.state != CircuitState::Closed {
            info!(breaker = %self.name, from = %state.state, "Circuit breaker closed");
            state.state = CircuitState::Closed;
            state.last_state_change = Instant::now();
        }
        state.consecutive_failures = 0;
        state.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        state.trial_in_flight = false;

        let should_open = match state.state {
            CircuitState::Closed => state.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            warn!(
                breaker = %self.name,
                failures = state.consecutive_failures,
                "Circuit breaker opened"
            );
            state.state = CircuitState::Open;
            state.last_state_change = Instant::now();
        }
    }

    pub fn report(&self) -> BreakerReport {
        let state = self.state.lock().expect("breaker lock poisoned");
        BreakerReport {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            seconds_since_state_change: state.last_state_change.elapsed().as_secs(),
        }
    }
}

/// Process-wide registry of named breakers
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch or create the breaker for `name`
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().expect("registry lock poisoned").get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().expect("registry lock poisoned");
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.defaults.clone()))),
        )
    }

    pub fn reports(&self) -> Vec<BreakerReport> {
        self.breakers
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|b| b.report())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout,
            },
        )
    }

    #[test]
    fn test_starts_closed() {
        let cb = breaker(5, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_attempt());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let cb = breaker(1, Duration::from_secs(0));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Timeout of zero: next attempt is the half-open trial
        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Second attempt while the trial is in flight is rejected
        assert!(!cb.can_attempt());
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = breaker(1, Duration::from_secs(0));
        cb.record_failure();
        assert!(cb.can_attempt());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_secs(0));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Zero timeout: the next attempt is the half-open trial
        assert!(cb.can_attempt());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_returns_same_instance() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get("slskd");
        let b = registry.get("slskd");
        a.record_failure();
        assert_eq!(b.report().consecutive_failures, 1);
        assert_eq!(registry.reports().len(), 1);
    }
}
