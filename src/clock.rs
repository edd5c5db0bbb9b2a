use std::fmt;
use std::time::Instant;

/// Monotonic time source consulted by the scheduler for timer comparisons.
///
/// Implementations should be monotonic; the scheduler additionally clamps
/// readings so that time never goes backwards within a single run.
pub trait Clock: Send + Sync + fmt::Debug {
  fn now(&self) -> Instant;
}

/// The default clock, backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }
}
