use super::ScanError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// State of the breaker guarding source scans.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Copy, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Stops hammering a source that keeps failing.
///
/// After `failure_threshold` consecutive scan failures the breaker opens and
/// refuses scans until `cooldown` has elapsed; then exactly one probe scan is
/// let through. A refused scan is reported as [`ScanError::CircuitOpen`],
/// which the scheduler treats like any other transient scan failure.
#[derive(Debug, Clone)]
pub struct SourceCircuitBreaker {
    inner: Arc<Mutex<BreakerInner>>,
    failure_threshold: usize,
    cooldown: Duration,
}

impl SourceCircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            })),
            failure_threshold: failure_threshold.max(1),
            cooldown: if cooldown.is_zero() {
                Duration::from_millis(1)
            } else {
                cooldown
            },
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let guard = self.inner.lock().expect("source breaker mutex poisoned");
        CircuitBreakerSnapshot {
            state: guard.state,
            consecutive_failures: guard.consecutive_failures,
            opened_at: guard.opened_at,
        }
    }

    /// Reserves permission for one scan.
    pub fn try_acquire(&self) -> Result<CircuitState, ScanError> {
        let mut inner = self.inner.lock().expect("source breaker mutex poisoned");

        if inner.state == CircuitState::Open {
            let cooled = inner
                .opened_at
                .map_or(false, |opened| opened.elapsed() >= self.cooldown);
            if !cooled {
                return Err(ScanError::CircuitOpen);
            }
            Self::transition(&mut inner, CircuitState::HalfOpen);
            inner.probe_in_flight = false;
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.probe_in_flight {
                return Err(ScanError::CircuitOpen);
            }
            inner.probe_in_flight = true;
        }

        Ok(inner.state)
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("source breaker mutex poisoned");
        inner.probe_in_flight = false;
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            inner.opened_at = None;
            Self::transition(&mut inner, CircuitState::Closed);
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("source breaker mutex poisoned");
        inner.probe_in_flight = false;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = inner.state == CircuitState::HalfOpen
            || (inner.state == CircuitState::Closed
                && inner.consecutive_failures >= self.failure_threshold);
        if trip {
            inner.opened_at = Some(Instant::now());
            Self::transition(&mut inner, CircuitState::Open);
        }
    }

    fn transition(inner: &mut BreakerInner, next: CircuitState) {
        if inner.state != next {
            tracing::warn!(
                previous = ?inner.state,
                next = ?next,
                consecutive_failures = inner.consecutive_failures,
                "source circuit breaker state changed"
            );
            inner.state = next;
        }
    }
}
