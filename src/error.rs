use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur within the `hybrid_loop` runtime.
///
/// The enum is `Clone` because a single failure may be delivered to every
/// waiter of a [`Promise`](crate::Promise).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
  #[error("A scheduler run is already active on this thread")]
  AlreadyRunning,

  #[error("Task failed: {0}")]
  TaskFailed(String),

  #[error("Starvation: {suspended} task(s) are suspended on futures that can never resolve")]
  Starvation { suspended: usize },

  #[error("No task made progress for {waited:?} while {outstanding_jobs} pool job(s) were outstanding")]
  Stalled { waited: Duration, outstanding_jobs: usize },

  #[error("Job cannot cross the process boundary: {0}")]
  NotTransferable(String),

  #[error("Job failed: {0}")]
  JobFailed(String),

  #[error("Job panicked: {0}")]
  JobPanicked(String),

  #[error("Worker process error: {0}")]
  WorkerProcess(String),

  #[error("Timed out after {0:?}")]
  TimedOut(Duration),

  #[error("Pool is shutting down or already shut down, cannot accept new jobs")]
  PoolShuttingDown,

  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),
}

impl RuntimeError {
  /// Builds the failure a task body returns to mark itself `Failed`.
  pub fn task_failed<S: Into<String>>(cause: S) -> Self {
    RuntimeError::TaskFailed(cause.into())
  }

  pub fn invalid_config<S: Into<String>>(reason: S) -> Self {
    RuntimeError::InvalidConfig(reason.into())
  }
}

/// Extracts a printable message from a `catch_unwind` payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(msg) = payload.downcast_ref::<&'static str>() {
    (*msg).to_string()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
