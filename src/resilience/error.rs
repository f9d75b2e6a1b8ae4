//! Failure taxonomy of the resilience layer
//!
//! Operations report their own error type `E`. The layer only needs to know
//! whether a failure is worth retrying ([`Classify`]) and never replaces the
//! caller's error: [`ResilienceError`] carries it through verbatim together
//! with diagnostic context.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::breaker::CircuitState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network/timeout class, worth retrying
    Transient,
    /// Validation or programming error, never retried
    Permanent,
}

/// Tells the retry policy and the breakers how to treat a failure
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;

    fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}

/// Ready-made operation error for callers without their own error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFailure {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl Classify for CallFailure {
    fn failure_kind(&self) -> FailureKind {
        match self {
            CallFailure::Transient(_) => FailureKind::Transient,
            CallFailure::Permanent(_) => FailureKind::Permanent,
        }
    }
}

/// Terminal outcome of a protected call that did not succeed
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The operation itself failed: either permanently, or transiently on the last attempt
    #[error("{source} (after {attempts} attempt(s))")]
    Failed {
        source: E,
        attempts: u32,
        /// State of the guarding breaker right after the failure, if any
        breaker: Option<CircuitState>,
    },

    /// A breaker rejected the next attempt
    ///
    /// `last_failure` holds the operation's own failure when the breaker
    /// opened between retries.
    #[error(
        "circuit `{key}` is open, retry in {retry_after:?} (after {attempts} attempt(s)){}",
        LastFailure(.last_failure)
    )]
    CircuitOpen {
        key: String,
        retry_after: Duration,
        attempts: u32,
        last_failure: Option<E>,
    },

    /// The retry budget refused another attempt
    #[error("retry budget exceeded after {attempts} attempt(s), last failure: {source}")]
    BudgetExceeded { source: E, attempts: u32 },
}

impl<E> ResilienceError<E> {
    /// Attempts actually made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::Failed { attempts, .. }
            | ResilienceError::CircuitOpen { attempts, .. }
            | ResilienceError::BudgetExceeded { attempts, .. } => *attempts,
        }
    }

    /// The operation's own last failure, if the operation ran at all
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            ResilienceError::Failed { source, .. }
            | ResilienceError::BudgetExceeded { source, .. } => Some(source),
            ResilienceError::CircuitOpen { last_failure, .. } => last_failure.as_ref(),
        }
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ResilienceError::Failed { source, .. }
            | ResilienceError::BudgetExceeded { source, .. } => Some(source),
            ResilienceError::CircuitOpen { last_failure, .. } => last_failure,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, ResilienceError::BudgetExceeded { .. })
    }
}

struct LastFailure<'a, E>(&'a Option<E>);

impl<E: fmt::Display> fmt::Display for LastFailure<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(failure) => write!(f, ", last failure: {failure}"),
            None => Ok(()),
        }
    }
}
