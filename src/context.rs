use crate::error::RuntimeError;
use crate::scheduler::Core;
use crate::task::Suspension;

use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
  static CURRENT: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
}

/// Keeps a run installed as the thread's active scheduler; uninstalls it on drop.
pub(crate) struct EnterGuard {
  _private: (),
}

impl Drop for EnterGuard {
  fn drop(&mut self) {
    let _ = CURRENT.try_with(|current| current.borrow_mut().take());
  }
}

pub(crate) fn enter(core: Rc<Core>) -> Result<EnterGuard, RuntimeError> {
  CURRENT.with(|current| {
    let mut current = current.borrow_mut();
    if current.is_some() {
      return Err(RuntimeError::AlreadyRunning);
    }
    *current = Some(core);
    Ok(EnterGuard { _private: () })
  })
}

/// The active run on this thread, if any. Safe to call from `Drop` impls,
/// including during thread teardown.
pub(crate) fn try_current() -> Option<Rc<Core>> {
  CURRENT
    .try_with(|current| current.try_borrow().ok().and_then(|c| c.clone()))
    .ok()
    .flatten()
}

#[track_caller]
pub(crate) fn expect_current(operation: &str) -> Rc<Core> {
  match try_current() {
    Some(core) => core,
    None => panic!("`{}` must be called from within a running hybrid_loop scheduler", operation),
  }
}

pub(crate) fn is_running() -> bool {
  try_current().is_some()
}

pub(crate) fn note_suspension(suspension: Suspension) {
  if let Some(core) = try_current() {
    core.note_suspension(suspension);
  }
}
