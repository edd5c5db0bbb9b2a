use crate::context;
use crate::error::RuntimeError;
use crate::scheduler::Core;
use crate::task::{Suspension, TaskId, TaskState};

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// Where a finished task leaves its outcome until the joiner picks it up.
pub(crate) struct JoinSlot<T> {
  outcome: Option<Result<T, RuntimeError>>,
  /// Position of the task in the run's completion order.
  finished_seq: Option<u64>,
  failed: bool,
  waker: Option<Waker>,
  handle_dropped: bool,
}

impl<T> JoinSlot<T> {
  pub(crate) fn new() -> Self {
    Self {
      outcome: None,
      finished_seq: None,
      failed: false,
      waker: None,
      handle_dropped: false,
    }
  }

  /// Stores the outcome and wakes the joiner. Returns `false` when nobody is
  /// left to observe it.
  pub(crate) fn finish(&mut self, outcome: Result<T, RuntimeError>, seq: u64) -> bool {
    self.failed = outcome.is_err();
    self.outcome = Some(outcome);
    self.finished_seq = Some(seq);
    if let Some(waker) = self.waker.take() {
      waker.wake();
    }
    !self.handle_dropped
  }
}

/// A handle to a task spawned on the running scheduler.
///
/// Awaiting the handle suspends the caller until the task reaches a terminal
/// state and yields its value or failure. Dropping the handle detaches the
/// task; it keeps running until it finishes or the run ends.
///
/// Handles are tied to the scheduler thread and cannot be sent to pool
/// workers.
pub struct JoinHandle<T> {
  id: TaskId,
  slot: Rc<RefCell<JoinSlot<T>>>,
  core: Weak<Core>,
}

impl<T> JoinHandle<T> {
  pub(crate) fn new(id: TaskId, slot: Rc<RefCell<JoinSlot<T>>>, core: Weak<Core>) -> Self {
    Self { id, slot, core }
  }

  /// Returns the unique ID of this task.
  pub fn id(&self) -> TaskId {
    self.id
  }

  /// Whether the task has reached `Completed` or `Failed`.
  pub fn is_finished(&self) -> bool {
    self.slot.borrow().finished_seq.is_some()
  }

  /// Current state of the task as tracked by the scheduler.
  pub fn state(&self) -> TaskState {
    if let Some(state) = self.core.upgrade().and_then(|core| core.task_state(self.id)) {
      return state;
    }
    let slot = self.slot.borrow();
    match (slot.finished_seq, slot.failed) {
      (Some(_), true) => TaskState::Failed,
      (Some(_), false) => TaskState::Completed,
      // The run that owned this task has ended without finishing it.
      (None, _) => TaskState::Pending,
    }
  }

  pub(crate) fn take_outcome(&mut self) -> Option<Result<T, RuntimeError>> {
    self.slot.borrow_mut().outcome.take()
  }

  /// Polls for the outcome together with its completion sequence number.
  pub(crate) fn poll_outcome(&mut self, cx: &mut Context<'_>) -> Poll<(u64, Result<T, RuntimeError>)> {
    let mut slot = self.slot.borrow_mut();
    if let Some(outcome) = slot.outcome.take() {
      let seq = slot.finished_seq.unwrap_or_default();
      return Poll::Ready((seq, outcome));
    }
    if let Some(seq) = slot.finished_seq {
      tracing::warn!(task_id = %self.id, "Join handle polled after its outcome was taken.");
      return Poll::Ready((
        seq,
        Err(RuntimeError::task_failed(format!("outcome of {} was already taken", self.id))),
      ));
    }
    slot.waker = Some(cx.waker().clone());
    drop(slot);
    context::note_suspension(Suspension::Future);
    Poll::Pending
  }
}

impl<T> Future for JoinHandle<T> {
  type Output = Result<T, RuntimeError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.poll_outcome(cx).map(|(_, outcome)| outcome)
  }
}

impl<T> Drop for JoinHandle<T> {
  fn drop(&mut self) {
    if let Ok(mut slot) = self.slot.try_borrow_mut() {
      slot.handle_dropped = true;
      slot.waker = None;
    }
    if let Some(core) = self.core.upgrade() {
      core.release(self.id);
    }
  }
}

impl<T> fmt::Debug for JoinHandle<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JoinHandle")
      .field("id", &self.id)
      .field("finished", &self.is_finished())
      .finish()
  }
}
