use std::fmt;
use std::task::Waker;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use futures::future::LocalBoxFuture;

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
}

/// Opaque task identity, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
  pub(crate) fn next() -> Self {
    TaskId(NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
  }

  pub fn as_u64(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "task-{}", self.0)
  }
}

/// Where a task is in its lifecycle. Only the scheduler moves a task between
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  /// Sitting in the ready queue.
  Pending,
  Running,
  SuspendedOnTimer,
  SuspendedOnFuture,
  Completed,
  Failed,
}

impl TaskState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskState::Completed | TaskState::Failed)
  }

  pub(crate) fn is_suspended(&self) -> bool {
    matches!(self, TaskState::SuspendedOnTimer | TaskState::SuspendedOnFuture)
  }
}

/// Recorded by suspension primitives while a task is being polled, so the
/// scheduler knows which suspended state the task moves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspension {
  Timer,
  Future,
  /// Re-queue at the back of the ready queue without waiting for a wake-up.
  Yield,
}

impl Suspension {
  pub(crate) fn into_state(self) -> TaskState {
    match self {
      Suspension::Timer => TaskState::SuspendedOnTimer,
      Suspension::Future => TaskState::SuspendedOnFuture,
      Suspension::Yield => TaskState::Pending,
    }
  }
}

/// A task's row in the scheduler's task table.
pub(crate) struct TaskEntry {
  /// `None` while the task is being polled and after it finished.
  pub(crate) future: Option<LocalBoxFuture<'static, TaskState>>,
  pub(crate) state: TaskState,
  pub(crate) waker: Waker,
  /// Set once the JoinHandle is gone; the entry is dropped as soon as the
  /// task finishes.
  pub(crate) detached: bool,
}

impl TaskEntry {
  pub(crate) fn new(future: LocalBoxFuture<'static, TaskState>, waker: Waker) -> Self {
    Self {
      future: Some(future),
      state: TaskState::Pending,
      waker,
      detached: false,
    }
  }
}

impl fmt::Debug for TaskEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskEntry")
      .field("state", &self.state)
      .field("detached", &self.detached)
      .field("has_future", &self.future.is_some())
      .finish()
  }
}
