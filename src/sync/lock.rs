use super::wait_graph::WaitGraph;
use crate::context;

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_CONTEXT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
  static ref NEXT_LOCK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

thread_local! {
  static CURRENT_CONTEXT: ContextId = ContextId(NEXT_CONTEXT_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed));
}

/// Identity of an execution context (an OS thread) as seen by locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
  /// The calling thread's context id, assigned on first use.
  pub fn current() -> Self {
    CURRENT_CONTEXT.with(|id| *id)
  }

  #[cfg(test)]
  pub(crate) fn from_raw(raw: u64) -> Self {
    ContextId(raw)
  }

  pub fn as_u64(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for ContextId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ctx-{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

impl LockId {
  fn next() -> Self {
    LockId(NEXT_LOCK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
  }

  #[cfg(test)]
  pub(crate) fn from_raw(raw: u64) -> Self {
    LockId(raw)
  }

  pub fn as_u64(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for LockId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "lock-{}", self.0)
  }
}

#[derive(Debug, Default)]
struct LockState {
  owner: Option<ContextId>,
  waiters: VecDeque<ContextId>,
}

impl LockState {
  fn is_free_for(&self, ctx: ContextId) -> bool {
    self.owner.is_none() && self.waiters.front().map_or(true, |front| *front == ctx)
  }
}

/// A mutual-exclusion lock with a single owner and a FIFO queue of blocked
/// acquirers.
///
/// Ownership is handed to waiters strictly in arrival order. The lock does not
/// order acquisitions across several locks: taking `A` then `B` on one thread
/// while another takes `B` then `A` deadlocks, exactly as it would with any
/// other mutex. Locks built with [`Lock::with_graph`] report their holders and
/// waiters to a [`WaitGraph`] so such a cycle can be observed from outside.
pub struct Lock<T> {
  id: LockId,
  name: Arc<str>,
  state: Mutex<LockState>,
  handoff: Condvar,
  data: Mutex<T>,
  graph: Option<WaitGraph>,
}

impl<T> Lock<T> {
  pub fn new(value: T) -> Self {
    let id = LockId::next();
    Self::build(id, Arc::from(id.to_string()), value, None)
  }

  /// A lock that records its hold/wait edges in `graph`.
  pub fn with_graph(name: &str, value: T, graph: &WaitGraph) -> Self {
    let id = LockId::next();
    let name: Arc<str> = Arc::from(name);
    graph.register_lock(id, name.clone());
    Self::build(id, name, value, Some(graph.clone()))
  }

  fn build(id: LockId, name: Arc<str>, value: T, graph: Option<WaitGraph>) -> Self {
    Self {
      id,
      name,
      state: Mutex::new(LockState::default()),
      handoff: Condvar::new(),
      data: Mutex::new(value),
      graph,
    }
  }

  pub fn id(&self) -> LockId {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Blocks the calling thread until it owns the lock.
  ///
  /// Re-acquiring a lock the calling thread already owns never returns.
  pub fn acquire(&self) -> LockGuard<'_, T> {
    let ctx = ContextId::current();
    if context::is_running() {
      warn!(lock = %self.name, "Lock acquired on a scheduler thread; every task on this loop blocks until it is granted.");
    }

    let mut state = self.state.lock();
    if state.owner == Some(ctx) {
      warn!(lock = %self.name, %ctx, "Context is re-acquiring a lock it already owns.");
    }
    if state.owner.is_none() && state.waiters.is_empty() {
      self.grant(&mut state, ctx);
    } else {
      state.waiters.push_back(ctx);
      if let Some(graph) = &self.graph {
        graph.record_waiting(ctx, self.id);
      }
      trace!(lock = %self.name, %ctx, position = state.waiters.len(), "Waiting for lock.");
      while !state.is_free_for(ctx) {
        self.handoff.wait(&mut state);
      }
      state.waiters.pop_front();
      self.grant(&mut state, ctx);
    }
    drop(state);

    LockGuard {
      lock: self,
      ctx,
      data: self.data.lock(),
    }
  }

  /// Takes the lock only if it is free and nobody is queued for it.
  pub fn try_acquire(&self) -> Option<LockGuard<'_, T>> {
    let ctx = ContextId::current();
    let mut state = self.state.lock();
    if state.owner.is_some() || !state.waiters.is_empty() {
      return None;
    }
    self.grant(&mut state, ctx);
    drop(state);
    Some(LockGuard {
      lock: self,
      ctx,
      data: self.data.lock(),
    })
  }

  fn grant(&self, state: &mut LockState, ctx: ContextId) {
    state.owner = Some(ctx);
    if let Some(graph) = &self.graph {
      graph.record_acquired(self.id, ctx);
    }
    trace!(lock = %self.name, %ctx, "Lock acquired.");
  }

  fn release(&self, ctx: ContextId) {
    let mut state = self.state.lock();
    state.owner = None;
    if let Some(graph) = &self.graph {
      graph.record_released(self.id, ctx);
    }
    let has_waiters = !state.waiters.is_empty();
    drop(state);
    trace!(lock = %self.name, %ctx, "Lock released.");
    if has_waiters {
      // Waiters check whether they are at the front of the queue.
      self.handoff.notify_all();
    }
  }

  pub fn owner(&self) -> Option<ContextId> {
    self.state.lock().owner
  }

  /// Blocked acquirers in the order they will be granted the lock.
  pub fn waiters(&self) -> Vec<ContextId> {
    self.state.lock().waiters.iter().copied().collect()
  }

  pub fn is_locked(&self) -> bool {
    self.state.lock().owner.is_some()
  }

  pub fn get_mut(&mut self) -> &mut T {
    self.data.get_mut()
  }

  pub fn into_inner(self) -> T {
    self.data.into_inner()
  }
}

impl<T: Default> Default for Lock<T> {
  fn default() -> Self {
    Lock::new(T::default())
  }
}

impl<T> fmt::Debug for Lock<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("Lock")
      .field("id", &self.id)
      .field("name", &self.name)
      .field("owner", &state.owner)
      .field("waiters", &state.waiters.len())
      .finish()
  }
}

/// Scoped ownership of a [`Lock`]. The lock is released when the guard drops.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, T> {
  lock: &'a Lock<T>,
  ctx: ContextId,
  data: MutexGuard<'a, T>,
}

impl<T> LockGuard<'_, T> {
  pub fn lock_id(&self) -> LockId {
    self.lock.id
  }
}

impl<T> Deref for LockGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.data
  }
}

impl<T> DerefMut for LockGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    &mut self.data
  }
}

impl<T> Drop for LockGuard<'_, T> {
  fn drop(&mut self) {
    self.lock.release(self.ctx);
  }
}

impl<T: fmt::Debug> fmt::Debug for LockGuard<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockGuard")
      .field("lock", &self.lock.name)
      .field("ctx", &self.ctx)
      .field("data", &*self.data)
      .finish()
  }
}
