use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::clock::SharedClock;
use crate::config::BreakerConfig;
use crate::sync::RwLock;

/// One circuit breaker per operation class, created on first use
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: SharedClock,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.with_read(|breakers| breakers.get(key).cloned())
    }

    /// Breaker for `key`, created under the write lock if missing
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(key) {
            return breaker;
        }

        let mut breakers = self.breakers.write();
        // another caller may have created it while we waited for the write lock
        if let Some(breaker) = breakers.get(key) {
            return breaker.clone();
        }

        debug!("creating circuit breaker `{key}`");
        let breaker = Arc::new(CircuitBreaker::new(
            key,
            self.config.clone(),
            self.clock.clone(),
        ));
        breakers.insert(key.to_string(), breaker.clone());
        breaker
    }

    /// Snapshots of every breaker, sorted by key
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<_> = self
            .breakers
            .with_read(|breakers| breakers.values().cloned().collect());

        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.with_read(|breakers| breakers.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
