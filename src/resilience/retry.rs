//! Exponential backoff retry
//!
//! Attempt `n` (1-based) that fails transiently is followed by a pause of
//! `min(base * 2^(n-1), cap)`, perturbed by a uniform random factor within
//! `±jitter`. Attempts after the first are only made if the attached
//! [`RetryBudget`] admits them.
//!
//! The pause is a plain `tokio::time::sleep`. Dropping the returned future
//! (for example through `tokio::time::timeout`) cancels it, and since a
//! retry is only recorded in the budget when it actually starts, a
//! cancelled pause leaves no trace there.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::breaker::CircuitBreaker;
use super::budget::RetryBudget;
use super::error::{Classify, ResilienceError};
use crate::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    budget: Option<Arc<RetryBudget>>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            budget: None,
        }
    }

    /// Consult `budget` before every retry
    pub fn with_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Un-jittered pause after failed attempt `attempt` (1-based)
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.config
            .base_delay()
            .saturating_mul(factor)
            .min(self.config.max_delay())
    }

    /// Pause after failed attempt `attempt`, jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.config.jitter;
        if jitter <= 0.0 {
            return nominal;
        }
        let factor: f64 = rand::rng().random_range(-1.0..=1.0);
        nominal.mul_f64((1.0 + jitter * factor).max(0.0))
    }

    /// Run `op`, retrying failures the error type marks as retryable
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(op, |err: &E| err.is_retryable(), None).await
    }

    /// Run `op`, retrying failures for which `is_retryable` returns true
    pub async fn execute_with<T, E, F, Fut, P>(
        &self,
        op: F,
        is_retryable: P,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.run(op, is_retryable, None).await
    }

    pub(crate) async fn run<T, E, F, Fut, P>(
        &self,
        mut op: F,
        is_retryable: P,
        breaker: Option<&CircuitBreaker>,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let mut last_error: Option<E> = None;

        loop {
            let permit = match breaker.map(CircuitBreaker::try_acquire).transpose() {
                Ok(permit) => permit,
                Err(open) => {
                    if let Some(err) = &last_error {
                        warn!("circuit `{}` opened after {attempt} attempt(s): {err}", open.name);
                    }
                    return Err(ResilienceError::CircuitOpen {
                        key: open.name,
                        retry_after: open.retry_after,
                        attempts: attempt,
                        last_failure: last_error.take(),
                    });
                }
            };

            if let Some(budget) = &self.budget {
                match last_error.take() {
                    None => budget.record_call(false),
                    Some(source) if !budget.try_acquire_retry() => {
                        warn!("retry budget exhausted after {attempt} attempt(s): {source}");
                        return Err(ResilienceError::BudgetExceeded {
                            source,
                            attempts: attempt,
                        });
                    }
                    Some(_) => {}
                }
            }

            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.succeed();
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retryable = is_retryable(&err);
            if let Some(permit) = permit {
                if retryable {
                    permit.fail();
                } else {
                    // permanent failures say nothing about the dependency's health
                    drop(permit);
                }
            }

            if !retryable || attempt >= max_attempts {
                debug!("giving up after {attempt} attempt(s): {err}");
                return Err(ResilienceError::Failed {
                    source: err,
                    attempts: attempt,
                    breaker: breaker.map(CircuitBreaker::state),
                });
            }

            let budget_refuses = self
                .budget
                .as_ref()
                .is_some_and(|budget| !budget.allow_retry());
            if budget_refuses {
                warn!("retry budget exhausted after {attempt} attempt(s): {err}");
                return Err(ResilienceError::BudgetExceeded {
                    source: err,
                    attempts: attempt,
                });
            }

            let delay = self.delay(attempt);
            debug!("attempt {attempt}/{max_attempts} failed ({err}), retrying in {delay:?}");
            last_error = Some(err);
            tokio::time::sleep(delay).await;
        }
    }
}
