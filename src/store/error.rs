//! Error types for store operations
//!
//! Unknown machine or command ids are not errors: lookups return `None` and
//! the caller decides whether absence matters.

use thiserror::Error;

use crate::sync::LockError;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock ordering broken or a lock wait timed out
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Invalid configuration
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// True for programming errors that must never be retried or swallowed
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, StoreError::Lock(LockError::OrderViolation { .. }))
    }
}
