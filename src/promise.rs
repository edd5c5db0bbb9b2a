use crate::context;
use crate::error::RuntimeError;
use crate::scheduler::OutstandingWait;
use crate::task::Suspension;

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

lazy_static::lazy_static! {
  static ref NEXT_RESOLVE_SEQ: AtomicU64 = AtomicU64::new(0);
}

enum Slot<T> {
  Unset {
    /// Registration order. A departed waiter leaves `None`, which the next
    /// waiter reuses.
    waiters: Vec<Option<Waker>>,
    /// Set when the resolver is dropped without resolving.
    abandoned: bool,
  },
  Resolved {
    /// Process-wide resolution order, used by `join_all` to find the first failure.
    seq: u64,
    outcome: Result<T, RuntimeError>,
  },
}

impl<T> Slot<T> {
  fn resolved(outcome: Result<T, RuntimeError>) -> Self {
    Slot::Resolved {
      seq: NEXT_RESOLVE_SEQ.fetch_add(1, Ordering::SeqCst),
      outcome,
    }
  }
}

struct Inner<T> {
  slot: Mutex<Slot<T>>,
  resolved: Condvar,
}

/// A one-shot result slot shared between one producer and any number of
/// consumers.
///
/// A promise starts unset and transitions exactly once, to a value or an
/// error, when its [`Resolver`] is used. Every waiter receives a clone of the
/// same outcome. Awaiting (or [`Promise::wait`]) suspends a task
/// cooperatively; [`Promise::wait_blocking`] blocks an OS thread and is meant
/// for pool workers and raw threads.
pub struct Promise<T> {
  inner: Arc<Inner<T>>,
}

/// The producing half of a [`Promise`]. Consumed by [`Resolver::resolve`].
///
/// Dropping a resolver without resolving leaves its promise unset forever.
/// Tasks awaiting it are woken once more so the scheduler stops counting them
/// as waiting on live work; with nothing else to wake them, the run reports
/// starvation.
pub struct Resolver<T> {
  inner: Arc<Inner<T>>,
  resolved: bool,
}

impl<T> Promise<T> {
  /// Creates an unset promise and the resolver that will complete it.
  pub fn channel() -> (Resolver<T>, Promise<T>) {
    let inner = Arc::new(Inner {
      slot: Mutex::new(Slot::Unset {
        waiters: Vec::new(),
        abandoned: false,
      }),
      resolved: Condvar::new(),
    });
    (
      Resolver {
        inner: inner.clone(),
        resolved: false,
      },
      Promise { inner },
    )
  }

  /// A promise that already holds `outcome`.
  pub fn resolved(outcome: Result<T, RuntimeError>) -> Self {
    Promise {
      inner: Arc::new(Inner {
        slot: Mutex::new(Slot::resolved(outcome)),
        resolved: Condvar::new(),
      }),
    }
  }

  pub fn is_resolved(&self) -> bool {
    matches!(&*self.inner.slot.lock(), Slot::Resolved { .. })
  }

  #[cfg(test)]
  pub(crate) fn waiter_slots(&self) -> usize {
    match &*self.inner.slot.lock() {
      Slot::Unset { waiters, .. } => waiters.len(),
      Slot::Resolved { .. } => 0,
    }
  }
}

impl<T: Clone> Promise<T> {
  /// The outcome, if the promise has been resolved.
  pub fn try_get(&self) -> Option<Result<T, RuntimeError>> {
    match &*self.inner.slot.lock() {
      Slot::Resolved { outcome, .. } => Some(outcome.clone()),
      Slot::Unset { .. } => None,
    }
  }

  /// A future that completes with the outcome. Completes on first poll if the
  /// promise is already resolved.
  pub fn wait(&self) -> Wait<T> {
    Wait {
      inner: self.inner.clone(),
      waiter: None,
      outstanding: None,
    }
  }

  /// Blocks the calling thread until the promise is resolved.
  pub fn wait_blocking(&self) -> Result<T, RuntimeError> {
    let mut slot = self.inner.slot.lock();
    loop {
      if let Slot::Resolved { outcome, .. } = &*slot {
        return outcome.clone();
      }
      self.inner.resolved.wait(&mut slot);
    }
  }

  /// Like [`Promise::wait_blocking`], giving up after `timeout`.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, RuntimeError>> {
    let mut slot = self.inner.slot.lock();
    if let Slot::Unset { .. } = &*slot {
      self.inner.resolved.wait_for(&mut slot, timeout);
    }
    match &*slot {
      Slot::Resolved { outcome, .. } => Some(outcome.clone()),
      Slot::Unset { .. } => None,
    }
  }
}

impl<T> Clone for Promise<T> {
  fn clone(&self) -> Self {
    Promise {
      inner: self.inner.clone(),
    }
  }
}

impl<T: Clone> IntoFuture for Promise<T> {
  type Output = Result<T, RuntimeError>;
  type IntoFuture = Wait<T>;

  fn into_future(self) -> Wait<T> {
    Wait {
      inner: self.inner,
      waiter: None,
      outstanding: None,
    }
  }
}

impl<T> fmt::Debug for Promise<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Promise")
      .field("resolved", &self.is_resolved())
      .finish()
  }
}

impl<T> Resolver<T> {
  /// Stores `outcome` and wakes every registered waiter in registration order.
  pub fn resolve(mut self, outcome: Result<T, RuntimeError>) {
    self.resolved = true;
    let waiters = {
      let mut slot = self.inner.slot.lock();
      match std::mem::replace(&mut *slot, Slot::resolved(outcome)) {
        Slot::Unset { waiters, .. } => waiters,
        // Only one resolver exists per promise and `resolve` consumes it.
        previous @ Slot::Resolved { .. } => {
          *slot = previous;
          return;
        }
      }
    };
    self.inner.resolved.notify_all();
    for waker in waiters.into_iter().flatten() {
      waker.wake();
    }
  }
}

impl<T> Drop for Resolver<T> {
  fn drop(&mut self) {
    if self.resolved {
      return;
    }
    trace!("Resolver dropped without a value; its promise stays unset.");
    let waiters = match &mut *self.inner.slot.lock() {
      Slot::Unset { waiters, abandoned } => {
        *abandoned = true;
        std::mem::take(waiters)
      }
      Slot::Resolved { .. } => return,
    };
    for waker in waiters.into_iter().flatten() {
      waker.wake();
    }
  }
}

impl<T> fmt::Debug for Resolver<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Resolver").field("resolved", &self.resolved).finish()
  }
}

/// Future returned by [`Promise::wait`] and by awaiting a promise.
///
/// While suspended on a promise whose resolver is still alive, the wait
/// counts as outstanding work for the run polling it.
pub struct Wait<T> {
  inner: Arc<Inner<T>>,
  waiter: Option<usize>,
  outstanding: Option<OutstandingWait>,
}

impl<T: Clone> Wait<T> {
  /// Polls for the outcome together with its resolution sequence number.
  pub(crate) fn poll_outcome(&mut self, cx: &mut Context<'_>) -> Poll<(u64, Result<T, RuntimeError>)> {
    let abandoned = {
      let mut slot = self.inner.slot.lock();
      match &mut *slot {
        Slot::Resolved { seq, outcome } => {
          let ready = (*seq, outcome.clone());
          self.waiter = None;
          self.outstanding = None;
          return Poll::Ready(ready);
        }
        // The resolver took the waiter list with it; stale indices may be out of range.
        Slot::Unset { waiters, abandoned: true } => {
          if let Some(waiter) = self.waiter.take().and_then(|index| waiters.get_mut(index)) {
            *waiter = None;
          }
          true
        }
        Slot::Unset { waiters, .. } => {
          let waker = Some(cx.waker().clone());
          match self.waiter {
            Some(index) => waiters[index] = waker,
            None => {
              let index = match waiters.iter().position(Option::is_none) {
                Some(free) => {
                  waiters[free] = waker;
                  free
                }
                None => {
                  waiters.push(waker);
                  waiters.len() - 1
                }
              };
              self.waiter = Some(index);
            }
          }
          false
        }
      }
    };

    if abandoned {
      self.outstanding = None;
    } else if self.outstanding.is_none() {
      self.outstanding = OutstandingWait::register();
    }
    context::note_suspension(Suspension::Future);
    Poll::Pending
  }
}

impl<T: Clone> Future for Wait<T> {
  type Output = Result<T, RuntimeError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.poll_outcome(cx).map(|(_, outcome)| outcome)
  }
}

impl<T> Drop for Wait<T> {
  fn drop(&mut self) {
    if let Some(index) = self.waiter.take() {
      if let Slot::Unset { waiters, .. } = &mut *self.inner.slot.lock() {
        if let Some(waiter) = waiters.get_mut(index) {
          *waiter = None;
        }
      }
    }
  }
}

impl<T> fmt::Debug for Wait<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Wait").field("registered", &self.waiter.is_some()).finish()
  }
}
