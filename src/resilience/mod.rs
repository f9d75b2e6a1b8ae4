//! Resilience layer for operations that fail transiently
//!
//! - [`RetryPolicy`]: exponential backoff with jitter and a retryable filter
//! - [`CircuitBreaker`]: per-target state machine that fails fast after
//!   repeated failures
//! - [`RetryBudget`]: sliding-window cap on the share of calls that are retries
//!
//! [`Resilience`] composes the three: every attempt passes through the
//! breaker registered for the call's key, and every retry through the budget.
//! None of them hold a lock while the operation runs or while a retry waits.

pub mod breaker;
pub mod budget;
pub mod error;
pub mod registry;
pub mod retry;

use std::future::Future;
use std::sync::Arc;

use tracing::instrument;

pub use breaker::{BreakerError, BreakerSnapshot, CallPermit, CircuitBreaker, CircuitOpen, CircuitState};
pub use budget::{BudgetStats, RetryBudget};
pub use error::{CallFailure, Classify, FailureKind, ResilienceError};
pub use registry::BreakerRegistry;
pub use retry::RetryPolicy;

use crate::clock::SharedClock;
use crate::config::{BreakerConfig, BudgetConfig, Config, RetryConfig};

#[derive(Debug, Clone)]
pub struct Resilience {
    policy: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
    budget: Arc<RetryBudget>,
}

impl Resilience {
    pub fn new(
        retry: RetryConfig,
        breaker: BreakerConfig,
        budget: BudgetConfig,
        clock: SharedClock,
    ) -> Self {
        let budget = Arc::new(RetryBudget::new(budget, clock.clone()));
        Self {
            policy: RetryPolicy::new(retry).with_budget(budget.clone()),
            breakers: Arc::new(BreakerRegistry::new(breaker, clock)),
            budget,
        }
    }

    pub fn from_config(config: &Config, clock: SharedClock) -> Self {
        Self::new(
            config.retry.clone(),
            config.circuit_breaker.clone(),
            config.retry_budget.clone(),
            clock,
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    /// Run `op` against the dependency identified by `key`
    ///
    /// Transient failures are retried and count against `key`'s breaker.
    /// Permanent failures end the call at once and leave the breaker alone.
    /// An open breaker ends the call without running `op` again.
    #[instrument(skip(self, op))]
    pub async fn call<T, E, F, Fut>(&self, key: &str, op: F) -> Result<T, ResilienceError<E>>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breakers.get_or_create(key);
        self.policy
            .run(op, |err: &E| err.is_retryable(), Some(&breaker))
            .await
    }
}
