//! Circuit breaker for failure isolation around swarm operations.
//!
//! Tracks consecutive failures for one named scope. After the threshold
//! the circuit *opens* and callers receive [`CircuitOpen`] with the
//! remaining cooldown. Once the cooldown elapses the circuit is
//! *half-open*: the next call is allowed as a probe, success closes the
//! circuit and failure re-opens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy — calls allowed.
    Closed,
    /// Tripped — calls blocked until the cooldown expires.
    Open,
    /// Cooldown expired — one probe call allowed.
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

/// Returned while the circuit is open; callers wait `retry_after`
/// before probing again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit {name:?} is open; retry after {retry_after:?}")]
pub struct CircuitOpen {
    pub name: String,
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-scope circuit breaker. Each loop level owns one under its own
/// name; names surface in logs and telemetry.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Conventional breaker: opens after 3 consecutive failures, probes
    /// after a 60 s cooldown.
    pub fn new(name: &str) -> Self {
        Self::with_limits(name, 3, Duration::from_secs(60))
    }

    pub fn with_limits(name: &str, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() >= self.reset_timeout => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Gate a call. `Ok` in closed or half-open (probe) state,
    /// [`CircuitOpen`] with remaining cooldown otherwise.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.opened_at {
            None => Ok(()),
            Some(at) => {
                let elapsed = at.elapsed();
                if elapsed >= self.reset_timeout {
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        name: self.name.clone(),
                        retry_after: self.reset_timeout - elapsed,
                    })
                }
            }
        }
    }

    /// Record a success — closes the circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failure — may trip the circuit, and re-opens a
    /// half-open circuit immediately.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        if inner.opened_at.is_some() || inner.consecutive_failures >= self.failure_threshold {
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Consecutive failures recorded so far.
    pub fn failure_count(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_closed() {
        let breaker = CircuitBreaker::new("primary");
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.check().unwrap();
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::with_limits("primary", 3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.check().unwrap_err();
        assert_eq!(err.name, "primary");
        assert!(err.retry_after <= Duration::from_secs(60));
    }

    #[test]
    fn test_success_resets() {
        let breaker = CircuitBreaker::with_limits("consensus", 2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let breaker = CircuitBreaker::with_limits("primary", 1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.check().unwrap(); // probe allowed
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::with_limits("primary", 1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        // opened_at refreshed; with zero cooldown it is immediately
        // half-open again, but the failure count keeps growing.
        assert!(breaker.failure_count() >= 2);
    }

    #[test]
    fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::with_limits("primary", 1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
