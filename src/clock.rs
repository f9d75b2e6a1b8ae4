//! Time sources
//!
//! Machine status is derived from wall-clock time (`DateTime<Utc>`), while
//! circuit breakers and retry budgets measure elapsed time on a monotonic
//! clock (`Instant`). Both come from a single [`Clock`] so tests can move
//! them forward together with a [`ManualClock`].

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of wall-clock and monotonic time
pub trait Clock: Send + Sync + Debug {
    /// Current wall-clock time (UTC)
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic instant
    fn instant(&self) -> Instant;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// The real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a shared handle to the system clock
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
///
/// Wall-clock and monotonic time advance in lockstep, starting from the
/// moment the clock was created.
#[derive(Debug)]
pub struct ManualClock {
    wall_origin: DateTime<Utc>,
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            wall_origin: Utc::now(),
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time advanced since creation
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock();
        // offsets are bounded by test durations, far below chrono's range
        self.wall_origin + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero())
    }

    fn instant(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}
