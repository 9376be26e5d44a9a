use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Failing, requests are rejected immediately.
    Open,
    /// Testing recovery, one request is allowed through.
    HalfOpen,
}

/// Protects an external dependency from being hammered while it is down.
/// The circuit opens after `failure_threshold` consecutive failures and
/// allows a probe request once `reset_timeout` has elapsed.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Returned when the circuit is open and rejecting requests.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker '{name}' is open, rejecting request")]
pub struct CircuitOpen {
    pub name: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Checks whether a request may proceed, transitioning an expired open
    /// circuit to half-open. Callers must report the outcome through
    /// `record_success` or `record_failure`.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            CircuitState::Open => {
                let expired = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.reset_timeout);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    info!(
                        "Circuit breaker '{}' transitioning from OPEN to HALF_OPEN",
                        self.name
                    );
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            }
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker '{}' transitioning to CLOSED", self.name);
        }
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.last_failure = Some(Instant::now());
        inner.failure_count += 1;

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            warn!(
                "Circuit breaker '{}' transitioning from HALF_OPEN to OPEN",
                self.name
            );
        } else if inner.state == CircuitState::Closed
            && inner.failure_count >= self.failure_threshold
        {
            inner.state = CircuitState::Open;
            warn!(
                "Circuit breaker '{}' transitioning from CLOSED to OPEN after {} failures",
                self.name, inner.failure_count
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock poisoned")
            .state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner
            .lock()
            .expect("circuit breaker lock poisoned")
            .failure_count
    }
}
