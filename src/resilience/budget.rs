//! Retry budget
//!
//! Caps the share of calls within a sliding time window that may be
//! retries. When a dependency degrades, every caller starts retrying at
//! once; the budget refuses new retries (it never queues them) once the
//! ratio would go above the ceiling.
//!
//! The window is a queue of timestamped entries. Entries older than the
//! window are dropped on every check, so there is no periodic reset.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::SharedClock;
use crate::config::BudgetConfig;

#[derive(Debug, Default)]
struct Window {
    calls: VecDeque<(Instant, bool)>,
    retries: usize,
}

impl Window {
    fn evict(&mut self, now: Instant, length: Duration) {
        while let Some(&(at, is_retry)) = self.calls.front() {
            if now.saturating_duration_since(at) < length {
                break;
            }
            self.calls.pop_front();
            if is_retry {
                self.retries -= 1;
            }
        }
    }

    fn push(&mut self, now: Instant, is_retry: bool) {
        self.calls.push_back((now, is_retry));
        if is_retry {
            self.retries += 1;
        }
    }

    fn admits_retry(&self, config: &BudgetConfig) -> bool {
        let total = self.calls.len();
        if total < config.min_calls {
            return true;
        }
        let ratio = (self.retries + 1) as f64 / (total + 1) as f64;
        ratio <= config.max_retry_ratio
    }
}

/// Current window contents
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetStats {
    pub total: usize,
    pub retries: usize,
    pub ratio: f64,
}

#[derive(Debug)]
pub struct RetryBudget {
    config: BudgetConfig,
    clock: SharedClock,
    window: Mutex<Window>,
}

impl RetryBudget {
    pub fn new(config: BudgetConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            window: Mutex::new(Window::default()),
        }
    }

    /// Would one more retry keep the window at or below the ceiling?
    pub fn allow_retry(&self) -> bool {
        let now = self.clock.instant();
        let mut window = self.window.lock();
        window.evict(now, self.config.window());
        window.admits_retry(&self.config)
    }

    /// Record a call that is about to be made
    pub fn record_call(&self, is_retry: bool) {
        let now = self.clock.instant();
        let mut window = self.window.lock();
        window.evict(now, self.config.window());
        window.push(now, is_retry);
    }

    /// Check and record a retry in one step
    ///
    /// Returns false, recording nothing, if the retry would break the budget.
    pub fn try_acquire_retry(&self) -> bool {
        let now = self.clock.instant();
        let mut window = self.window.lock();
        window.evict(now, self.config.window());
        if !window.admits_retry(&self.config) {
            return false;
        }
        window.push(now, true);
        true
    }

    pub fn stats(&self) -> BudgetStats {
        let now = self.clock.instant();
        let mut window = self.window.lock();
        window.evict(now, self.config.window());

        let total = window.calls.len();
        BudgetStats {
            total,
            retries: window.retries,
            ratio: if total == 0 {
                0.0
            } else {
                window.retries as f64 / total as f64
            },
        }
    }
}
