//! Circuit breaker for the decision pipeline.
//!
//! The breaker tracks consecutive pipeline failures. When failures reach a
//! configurable threshold the circuit *opens* and the router stops invoking
//! the model, answering through its fallback policy instead. After the
//! recovery timeout the circuit reports *half-open*; the next recorded outcome
//! either closes it again or re-opens it.
//!
//! ```text
//! Closed ──(failure_threshold consecutive failures)──▶ Open
//! Open ──(recovery_timeout since last failure)──▶ HalfOpen
//! HalfOpen ──success──▶ Closed
//! HalfOpen ──failure──▶ Open
//! ```
//!
//! All state lives behind one mutex, so concurrent recorders are linearized:
//! racing failures cannot both trip the circuit or lose a count.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, pipeline runs normally.
    Closed,
    /// Tripped, pipeline bypassed until the recovery timeout expires.
    Open,
    /// Recovery timeout expired, next outcome decides.
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

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    total_successes: u64,
    total_failures: u64,
    trips: u64,
}

/// Process-wide breaker shared by every routing call.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker on the system clock.
    ///
    /// A threshold of zero is treated as one.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self::with_clock(failure_threshold, recovery_timeout, Arc::new(SystemClock))
    }

    /// Create a breaker on an injected clock.
    pub fn with_clock(
        failure_threshold: u32,
        recovery_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_state_change: now,
                total_successes: 0,
                total_failures: 0,
                trips: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            clock,
        }
    }

    /// Current state, applying a pending Open → HalfOpen transition.
    pub fn status(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    /// Whether the pipeline may run (Closed or HalfOpen).
    pub fn is_available(&self) -> bool {
        !matches!(self.status(), CircuitState::Open)
    }

    /// Record a pipeline success. Returns the state after recording.
    pub fn record_success(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.total_successes += 1;

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_failures = 0;
                Self::transition(&mut inner, CircuitState::Closed, now);
                info!("circuit breaker: closing (half-open trial call succeeded)");
            }
            // A late success while open does not close the circuit.
            CircuitState::Open => {}
        }
        debug!(
            state = %inner.state,
            total_successes = inner.total_successes,
            "circuit breaker: success recorded"
        );
        inner.state
    }

    /// Record a pipeline failure. Returns the state after recording.
    pub fn record_failure(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.total_failures += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                Self::transition(&mut inner, CircuitState::Open, now);
                inner.trips += 1;
                warn!(
                    failures = inner.consecutive_failures,
                    threshold = self.failure_threshold,
                    "circuit breaker: opening (threshold reached)"
                );
            }
            CircuitState::HalfOpen => {
                Self::transition(&mut inner, CircuitState::Open, now);
                inner.trips += 1;
                warn!("circuit breaker: reopening (half-open trial call failed)");
            }
            _ => {
                debug!(
                    state = %inner.state,
                    failures = inner.consecutive_failures,
                    threshold = self.failure_threshold,
                    "circuit breaker: failure recorded"
                );
            }
        }
        inner.state
    }

    /// Force the circuit open (maintenance, tests).
    pub fn trip(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            inner.trips += 1;
        }
        inner.consecutive_failures = inner.consecutive_failures.max(self.failure_threshold);
        inner.last_failure = Some(now);
        Self::transition(&mut inner, CircuitState::Open, now);
        warn!("circuit breaker: manually tripped to open");
    }

    /// Force the circuit closed and clear the failure streak.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        Self::transition(&mut inner, CircuitState::Closed, now);
        info!("circuit breaker: manually reset to closed");
    }

    /// Consecutive failures in the current streak.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Consecutive failures that open the circuit.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Time the circuit stays open after the last failure.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Snapshot of counters and state.
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            trips: inner.trips,
            time_in_state_ms: now.duration_since(inner.last_state_change).as_millis() as u64,
        }
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let since = inner.last_failure.unwrap_or(inner.last_state_change);
        if now.duration_since(since) >= self.recovery_timeout {
            Self::transition(inner, CircuitState::HalfOpen, now);
            info!("circuit breaker: transitioning to half-open");
        }
    }

    fn transition(inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        if inner.state != to {
            inner.state = to;
            inner.last_state_change = now;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures in the current streak
    pub consecutive_failures: u32,
    /// Successes recorded since construction
    pub total_successes: u64,
    /// Failures recorded since construction
    pub total_failures: u64,
    /// Transitions into Open
    pub trips: u64,
    /// Milliseconds since the last state change
    pub time_in_state_ms: u64,
}
