use super::lock::Lock;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::thread;

enum Mode {
  Guarded(Lock<u64>),
  /// Read and write are separate steps with a yield in between.
  Unguarded(AtomicU64),
}

/// A counter shared between preemptive contexts.
///
/// The guarded flavour performs every increment while holding its [`Lock`], so
/// `n` concurrent increments always add up to `n`. The unguarded flavour is
/// an explicit opt-in to a lost-update race: it reads, yields the thread and
/// writes back, so concurrent increments overwrite each other. Both are free
/// of undefined behaviour.
pub struct SharedCounter {
  mode: Mode,
}

impl SharedCounter {
  pub fn guarded() -> Self {
    Self {
      mode: Mode::Guarded(Lock::new(0)),
    }
  }

  pub fn unguarded() -> Self {
    Self {
      mode: Mode::Unguarded(AtomicU64::new(0)),
    }
  }

  pub fn increment(&self) {
    match &self.mode {
      Mode::Guarded(lock) => {
        let mut value = lock.acquire();
        *value += 1;
      }
      Mode::Unguarded(value) => {
        let seen = value.load(AtomicOrdering::Relaxed);
        thread::yield_now();
        value.store(seen + 1, AtomicOrdering::Relaxed);
      }
    }
  }

  pub fn get(&self) -> u64 {
    match &self.mode {
      Mode::Guarded(lock) => *lock.acquire(),
      Mode::Unguarded(value) => value.load(AtomicOrdering::Relaxed),
    }
  }

  pub fn is_guarded(&self) -> bool {
    matches!(self.mode, Mode::Guarded(_))
  }
}

impl fmt::Debug for SharedCounter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedCounter")
      .field("guarded", &self.is_guarded())
      .field("value", &self.get())
      .finish()
  }
}
