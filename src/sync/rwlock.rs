//! Writer-priority read/write lock
//!
//! Any number of readers may hold the lock at once; a writer holds it
//! exclusively. As soon as a writer starts waiting, new readers queue up
//! behind it, so a steady stream of readers cannot starve writers.
//!
//! The bookkeeping lives in a mutex-guarded [`LockState`] with two condition
//! variables: readers wait on one, writers on the other. The mutex is only
//! held while the counters change, never while a guard is alive.
//!
//! The data itself sits in a `parking_lot::RwLock`. [`LockState`] decides who
//! gets in; the inner lock is only taken once admission is granted, so it
//! never blocks for longer than a departing guard takes to drop.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct LockState {
    active_readers: usize,
    writer_active: bool,
    waiting_writers: usize,
}

impl LockState {
    fn reader_may_enter(&self) -> bool {
        !self.writer_active && self.waiting_writers == 0
    }

    fn writer_may_enter(&self) -> bool {
        !self.writer_active && self.active_readers == 0
    }
}

/// Read/write lock with writer priority
pub struct RwLock<T: ?Sized> {
    state: Mutex<LockState>,
    readers: Condvar,
    writers: Condvar,
    data: parking_lot::RwLock<T>,
}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            readers: Condvar::new(),
            writers: Condvar::new(),
            data: parking_lot::RwLock::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquire shared access, blocking while a writer holds or awaits the lock
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut state = self.state.lock();
        while !state.reader_may_enter() {
            self.readers.wait(&mut state);
        }
        state.active_readers += 1;
        drop(state);
        ReadGuard::new(self)
    }

    /// Like [`read`](Self::read), but gives up after `timeout`
    pub fn read_for(&self, timeout: Duration) -> Option<ReadGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.reader_may_enter() {
            if self.readers.wait_until(&mut state, deadline).timed_out()
                && !state.reader_may_enter()
            {
                return None;
            }
        }
        state.active_readers += 1;
        drop(state);
        Some(ReadGuard::new(self))
    }

    /// Acquire exclusive access
    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while !state.writer_may_enter() {
            self.writers.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer_active = true;
        drop(state);
        WriteGuard::new(self)
    }

    /// Like [`write`](Self::write), but gives up after `timeout`
    pub fn write_for(&self, timeout: Duration) -> Option<WriteGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while !state.writer_may_enter() {
            if self.writers.wait_until(&mut state, deadline).timed_out()
                && !state.writer_may_enter()
            {
                state.waiting_writers -= 1;
                self.abandon_write_wait(&state);
                return None;
            }
        }
        state.waiting_writers -= 1;
        state.writer_active = true;
        drop(state);
        Some(WriteGuard::new(self))
    }

    /// Run `f` with shared access; the lock is released when `f` returns or unwinds
    pub fn with_read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.read();
        f(&guard)
    }

    /// Run `f` with exclusive access; the lock is released when `f` returns or unwinds
    pub fn with_write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.write();
        f(&mut guard)
    }

    /// Number of writers currently blocked in `write`
    pub fn waiting_writers(&self) -> usize {
        self.state.lock().waiting_writers
    }

    /// Number of readers currently holding the lock
    pub fn active_readers(&self) -> usize {
        self.state.lock().active_readers
    }

    // A timed-out writer may have swallowed the single wakeup meant for the
    // next writer, and may have been the only thing holding readers back.
    fn abandon_write_wait(&self, state: &MutexGuard<'_, LockState>) {
        if state.writer_active {
            return;
        }
        if state.waiting_writers > 0 {
            if state.active_readers == 0 {
                self.writers.notify_one();
            }
        } else {
            self.readers.notify_all();
        }
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.active_readers -= 1;
        if state.active_readers == 0 && state.waiting_writers > 0 {
            self.writers.notify_one();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer_active = false;
        if state.waiting_writers > 0 {
            self.writers.notify_one();
        } else {
            self.readers.notify_all();
        }
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RwLock")
            .field("active_readers", &state.active_readers)
            .field("writer_active", &state.writer_active)
            .field("waiting_writers", &state.waiting_writers)
            .finish_non_exhaustive()
    }
}

/// Shared access to the data behind a [`RwLock`]
///
/// Guards are tied to the thread that acquired them.
pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    // dropped after `release_read`, see the module docs
    data: RwLockReadGuard<'a, T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> ReadGuard<'a, T> {
    fn new(lock: &'a RwLock<T>) -> Self {
        Self {
            lock,
            data: lock.data.read(),
            _not_send: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive access to the data behind a [`RwLock`]
pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    data: RwLockWriteGuard<'a, T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> WriteGuard<'a, T> {
    fn new(lock: &'a RwLock<T>) -> Self {
        Self {
            lock,
            data: lock.data.write(),
            _not_send: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
