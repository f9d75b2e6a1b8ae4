//! Circuit breaker
//!
//! ## States
//!
//! ```text
//!            failures >= threshold             timeout elapsed
//!  CLOSED ─────────────────────────▶ OPEN ─────────────────────▶ HALF_OPEN
//!    ▲                                 ▲                             │
//!    │                                 └──────── any failure ────────┤
//!    └───────────────── successes >= success threshold ─────────────┘
//! ```
//!
//! The state lives behind a mutex owned by this breaker alone. The mutex is
//! held to inspect and update counters, never while the guarded call runs:
//! a call first takes a [`CallPermit`], runs unlocked, then reports its
//! outcome through the permit.
//!
//! Each transition bumps a generation counter. Outcomes reported by permits
//! from an earlier generation are ignored, so a slow call that started
//! before the breaker opened cannot close it again.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Rejection issued without running the guarded call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit `{name}` is open, retry in {retry_after:?}")]
pub struct CircuitOpen {
    pub name: String,
    pub retry_after: Duration,
}

/// Result of [`CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpen),

    #[error("{0}")]
    Failed(E),
}

/// Point-in-time view of a breaker for logs and dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            opened_at: None,
            half_open_in_flight: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        match to {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
            }
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::HalfOpen => {}
        }
        Transition { from, to }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, moving an expired OPEN breaker to HALF_OPEN first
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.state.lock();
            let transition = self.expire_open(&mut inner);
            (inner.state, transition)
        };
        self.log(transition);
        state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.instant();
        let (snapshot, transition) = {
            let mut inner = self.state.lock();
            let transition = self.expire_open(&mut inner);
            let snapshot = BreakerSnapshot {
                name: self.name.clone(),
                state: inner.state,
                consecutive_failures: inner.consecutive_failures,
                consecutive_successes: inner.consecutive_successes,
                half_open_in_flight: inner.half_open_in_flight,
                since_last_failure: inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at)),
            };
            (snapshot, transition)
        };
        self.log(transition);
        snapshot
    }

    /// Force the breaker back to CLOSED
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.state.lock();
            inner.last_failure = None;
            Some(inner.transition(CircuitState::Closed, self.clock.instant()))
        };
        self.log(transition);
    }

    /// Ask for permission to make one call
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let now = self.clock.instant();
        let (result, transition) = {
            let mut inner = self.state.lock();
            let transition = self.expire_open(&mut inner);

            let current = inner.state;
            let result = match current {
                CircuitState::Closed => Ok(CallPermit::new(self, inner.generation, false)),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                    Err(CircuitOpen {
                        name: self.name.clone(),
                        retry_after: self.config.open_timeout().saturating_sub(elapsed),
                    })
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.half_open_max_calls {
                        inner.half_open_in_flight += 1;
                        Ok(CallPermit::new(self, inner.generation, true))
                    } else {
                        Err(CircuitOpen {
                            name: self.name.clone(),
                            retry_after: Duration::ZERO,
                        })
                    }
                }
            };
            (result, transition)
        };
        self.log(transition);
        result
    }

    /// Run `op` under this breaker; every error counts as a failure
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(BreakerError::Open)?;
        match op().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(BreakerError::Failed(err))
            }
        }
    }

    fn expire_open(&self, inner: &mut BreakerState) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let now = self.clock.instant();
        let opened_at = inner.opened_at?;
        if now.saturating_duration_since(opened_at) < self.config.open_timeout() {
            return None;
        }
        Some(inner.transition(CircuitState::HalfOpen, now))
    }

    fn on_success(&self, generation: u64, trial: bool) {
        let transition = {
            let mut inner = self.state.lock();
            if inner.generation != generation {
                return;
            }
            let current = inner.state;
            match current {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    if trial {
                        inner.half_open_in_flight -= 1;
                    }
                    inner.consecutive_successes += 1;
                    (inner.consecutive_successes >= self.config.success_threshold)
                        .then(|| inner.transition(CircuitState::Closed, self.clock.instant()))
                }
                CircuitState::Open => None,
            }
        };
        self.log(transition);
    }

    fn on_failure(&self, generation: u64) {
        let now = self.clock.instant();
        let transition = {
            let mut inner = self.state.lock();
            if inner.generation != generation {
                return;
            }
            inner.last_failure = Some(now);
            let current = inner.state;
            match current {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    (inner.consecutive_failures >= self.config.failure_threshold)
                        .then(|| inner.transition(CircuitState::Open, now))
                }
                CircuitState::HalfOpen => {
                    inner.consecutive_failures += 1;
                    Some(inner.transition(CircuitState::Open, now))
                }
                CircuitState::Open => None,
            }
        };
        self.log(transition);
    }

    fn on_release(&self, generation: u64, trial: bool) {
        let mut inner = self.state.lock();
        if trial && inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight -= 1;
        }
    }

    fn log(&self, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };
        match to {
            CircuitState::Open => warn!("circuit `{}`: {from} -> {to}", self.name),
            _ => info!("circuit `{}`: {from} -> {to}", self.name),
        }
    }
}

/// Permission to make one call through a [`CircuitBreaker`]
///
/// Report the outcome with [`succeed`](Self::succeed) or
/// [`fail`](Self::fail). A permit dropped without an outcome (the call was
/// cancelled, or its failure should not count) just frees its slot.
#[derive(Debug)]
#[must_use = "report the call outcome through the permit"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, trial: bool) -> Self {
        Self {
            breaker,
            generation,
            trial,
            settled: false,
        }
    }

    /// True if this permit is one of the limited HALF_OPEN trial calls
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation, self.trial);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_release(self.generation, self.trial);
        }
    }
}
