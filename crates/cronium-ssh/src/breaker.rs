//! Per-host circuit breaker for connection establishment.
//!
//! Repeated dial failures to one key open the circuit; further dials fail
//! fast until the cool-down passes, after which a few trial dials decide
//! whether to close it again. The breaker never retries anything itself.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Trial dials admitted while half-open.
const HALF_OPEN_TRIALS: u32 = 3;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Dials flow normally.
    Closed,
    /// Dials are refused.
    Open,
    /// A limited number of trial dials are admitted.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker for one connection key.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    cooldown: Duration,
    state: BreakerState,
    failures: u32,
    successes: u32,
    trials: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(failure_threshold: u32, success_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            cooldown,
            state: BreakerState::Closed,
            failures: 0,
            successes: 0,
            trials: 0,
            last_failure: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a dial may proceed. May move Open → HalfOpen.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = self
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.cooldown);
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    self.successes = 0;
                    self.trials = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.trials < HALF_OPEN_TRIALS {
                    self.trials += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful dial.
    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.failures = 0,
            BreakerState::HalfOpen => {
                self.successes += 1;
                if self.successes >= self.success_threshold {
                    self.reset();
                }
            }
            BreakerState::Open => self.reset(),
        }
    }

    /// Record a failed dial.
    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        match self.state {
            BreakerState::Closed => {
                self.failures += 1;
                if self.failures >= self.failure_threshold {
                    self.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.failures = self.failure_threshold;
            }
            BreakerState::Open => {}
        }
    }

    fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failures = 0;
        self.successes = 0;
        self.trials = 0;
    }
}
