//! Lock ranking for the store's resources
//!
//! Every store resource has a fixed rank (`Machines < History < Commands`).
//! A thread may only acquire a resource lock whose rank is strictly above
//! every resource lock it already holds. Anything else could deadlock
//! against another multi-resource operation, so it is rejected up front with
//! [`LockError::OrderViolation`] instead of blocking.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::error;

use super::rwlock::{ReadGuard, RwLock, WriteGuard};

/// Resources guarded by the store, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Machines,
    History,
    Commands,
}

impl Resource {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    const ALL: [Resource; 3] = [Resource::Machines, Resource::History, Resource::Commands];
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Machines => write!(f, "machines"),
            Resource::History => write!(f, "history"),
            Resource::Commands => write!(f, "commands"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Acquisition would break the global lock order (programming error)
    #[error("lock contract violation: requested {requested} while holding {held}")]
    OrderViolation { held: Resource, requested: Resource },

    /// The configured wait limit elapsed before the lock became free
    #[error("timed out after {waited:?} waiting for the {resource} lock")]
    Timeout { resource: Resource, waited: Duration },
}

thread_local! {
    static HELD: Cell<u8> = const { Cell::new(0) };
}

fn highest_held(mask: u8) -> Option<Resource> {
    Resource::ALL
        .iter()
        .rev()
        .copied()
        .find(|resource| mask & resource.bit() != 0)
}

/// Resources the current thread holds, lowest rank first
pub fn held_resources() -> Vec<Resource> {
    let mask = HELD.with(Cell::get);
    Resource::ALL
        .into_iter()
        .filter(|resource| mask & resource.bit() != 0)
        .collect()
}

/// Marks a resource as held by the current thread until dropped
struct RankToken {
    resource: Resource,
    _not_send: PhantomData<*const ()>,
}

impl RankToken {
    fn claim(resource: Resource) -> Result<Self, LockError> {
        HELD.with(|held| {
            let mask = held.get();
            if let Some(highest) = highest_held(mask).filter(|held| *held >= resource) {
                error!("refusing {resource} lock while holding {highest}");
                return Err(LockError::OrderViolation {
                    held: highest,
                    requested: resource,
                });
            }
            held.set(mask | resource.bit());
            Ok(Self {
                resource,
                _not_send: PhantomData,
            })
        })
    }
}

impl Drop for RankToken {
    fn drop(&mut self) {
        let bit = self.resource.bit();
        HELD.with(|held| held.set(held.get() & !bit));
    }
}

/// A [`RwLock`] bound to one store resource and its rank
#[derive(Debug)]
pub struct RankedLock<T> {
    resource: Resource,
    lock: RwLock<T>,
    timeout: Option<Duration>,
}

impl<T> RankedLock<T> {
    pub fn new(resource: Resource, value: T, timeout: Option<Duration>) -> Self {
        Self {
            resource,
            lock: RwLock::new(value),
            timeout,
        }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn read(&self) -> Result<RankedReadGuard<'_, T>, LockError> {
        let token = RankToken::claim(self.resource)?;
        let guard = match self.timeout {
            Some(timeout) => self.lock.read_for(timeout).ok_or(LockError::Timeout {
                resource: self.resource,
                waited: timeout,
            })?,
            None => self.lock.read(),
        };
        Ok(RankedReadGuard {
            guard,
            _token: token,
        })
    }

    pub fn write(&self) -> Result<RankedWriteGuard<'_, T>, LockError> {
        let token = RankToken::claim(self.resource)?;
        let guard = match self.timeout {
            Some(timeout) => self.lock.write_for(timeout).ok_or(LockError::Timeout {
                resource: self.resource,
                waited: timeout,
            })?,
            None => self.lock.write(),
        };
        Ok(RankedWriteGuard {
            guard,
            _token: token,
        })
    }

    /// Exclusive access that waits however long it takes
    ///
    /// The rank is still enforced. For writes that follow an already
    /// committed change to a lower-ranked resource and must not be dropped.
    pub fn write_untimed(&self) -> Result<RankedWriteGuard<'_, T>, LockError> {
        let token = RankToken::claim(self.resource)?;
        Ok(RankedWriteGuard {
            guard: self.lock.write(),
            _token: token,
        })
    }
}

pub struct RankedReadGuard<'a, T> {
    guard: ReadGuard<'a, T>,
    _token: RankToken,
}

impl<T> Deref for RankedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct RankedWriteGuard<'a, T> {
    guard: WriteGuard<'a, T>,
    _token: RankToken,
}

impl<T> Deref for RankedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: fmt::Debug> fmt::Debug for RankedReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Debug> fmt::Debug for RankedWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
