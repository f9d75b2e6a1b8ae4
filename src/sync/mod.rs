//! Synchronization primitives for the resource store
//!
//! - [`rwlock::RwLock`]: writer-priority read/write lock with scoped guards
//! - [`ranked::RankedLock`]: a `RwLock` tagged with a [`Resource`] rank so
//!   out-of-order acquisition fails fast instead of deadlocking

pub mod ranked;
pub mod rwlock;

pub use ranked::{LockError, RankedLock, Resource};
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
