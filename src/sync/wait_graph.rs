use super::lock::{ContextId, LockId};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Default)]
struct GraphInner {
  holders: DashMap<LockId, ContextId>,
  waiting: DashMap<ContextId, LockId>,
  names: DashMap<LockId, Arc<str>>,
}

/// Live record of which context holds which lock and which context is blocked
/// on which lock, for every [`Lock`](super::Lock) built against it.
///
/// The graph never intervenes: a cyclic wait still hangs the contexts involved.
/// It only makes the cycle visible to whoever inspects it, typically a test
/// harness polling [`WaitGraph::find_cycle`] from another thread.
#[derive(Debug, Clone, Default)]
pub struct WaitGraph {
  inner: Arc<GraphInner>,
}

/// One hold/wait edge of a cycle: `waiter` is blocked on `lock`, which `holder` owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEdge {
  pub waiter: ContextId,
  pub lock: LockId,
  pub lock_name: Arc<str>,
  pub holder: ContextId,
}

impl fmt::Display for WaitEdge {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} waits for `{}` held by {}", self.waiter, self.lock_name, self.holder)
  }
}

fn describe_cycle(cycle: &[WaitEdge]) -> String {
  cycle.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// A cyclic wait among lock holders. Every context in the cycle is blocked
/// forever.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Lock ordering hazard among {} context(s): {}", .cycle.len(), describe_cycle(.cycle))]
pub struct LockOrderingHazard {
  /// Edges in walk order; the last edge's holder is the first edge's waiter.
  pub cycle: Vec<WaitEdge>,
}

impl LockOrderingHazard {
  pub fn contexts(&self) -> Vec<ContextId> {
    self.cycle.iter().map(|edge| edge.waiter).collect()
  }

  pub fn locks(&self) -> Vec<LockId> {
    self.cycle.iter().map(|edge| edge.lock).collect()
  }
}

/// Point-in-time copy of a [`WaitGraph`], sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitGraphSnapshot {
  pub holders: Vec<(LockId, ContextId)>,
  pub waiting: Vec<(ContextId, LockId)>,
}

impl WaitGraph {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn register_lock(&self, lock: LockId, name: Arc<str>) {
    self.inner.names.insert(lock, name);
  }

  pub(crate) fn record_waiting(&self, ctx: ContextId, lock: LockId) {
    self.inner.waiting.insert(ctx, lock);
  }

  pub(crate) fn record_acquired(&self, lock: LockId, ctx: ContextId) {
    self.inner.waiting.remove_if(&ctx, |_, waited| *waited == lock);
    self.inner.holders.insert(lock, ctx);
  }

  pub(crate) fn record_released(&self, lock: LockId, ctx: ContextId) {
    self.inner.holders.remove_if(&lock, |_, holder| *holder == ctx);
  }

  pub fn snapshot(&self) -> WaitGraphSnapshot {
    let mut holders: Vec<_> = self.inner.holders.iter().map(|e| (*e.key(), *e.value())).collect();
    let mut waiting: Vec<_> = self.inner.waiting.iter().map(|e| (*e.key(), *e.value())).collect();
    holders.sort();
    waiting.sort();
    WaitGraphSnapshot { holders, waiting }
  }

  /// Looks for a cycle of contexts each blocked on a lock held by the next.
  ///
  /// Works on a snapshot, so the answer is only meaningful for a graph that
  /// has stopped changing, which a real deadlock has.
  pub fn find_cycle(&self) -> Option<LockOrderingHazard> {
    let snapshot = self.snapshot();
    let holders: HashMap<LockId, ContextId> = snapshot.holders.iter().copied().collect();
    let waiting: HashMap<ContextId, LockId> = snapshot.waiting.iter().copied().collect();

    for (start, _) in &snapshot.waiting {
      let mut path: Vec<WaitEdge> = Vec::new();
      let mut current = *start;
      loop {
        let Some(lock) = waiting.get(&current).copied() else { break };
        let Some(holder) = holders.get(&lock).copied() else { break };
        path.push(WaitEdge {
          waiter: current,
          lock,
          lock_name: self.lock_name(lock),
          holder,
        });
        if let Some(pos) = path.iter().position(|edge| edge.waiter == holder) {
          let cycle = path.split_off(pos);
          debug!(contexts = cycle.len(), "Wait graph contains a cycle.");
          return Some(LockOrderingHazard { cycle });
        }
        current = holder;
      }
    }
    None
  }

  fn lock_name(&self, lock: LockId) -> Arc<str> {
    self
      .inner
      .names
      .get(&lock)
      .map(|name| name.value().clone())
      .unwrap_or_else(|| Arc::from(lock.to_string()))
  }
}
