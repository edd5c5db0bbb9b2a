use crate::error::RuntimeError;
use crate::pool::JobId;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tracing::{debug, error, info, trace};

// --- Public Event Structs for Handlers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCompletionStatus {
  Success,
  Failed,
  Panicked,
}

impl<T> From<&Result<T, RuntimeError>> for JobCompletionStatus {
  fn from(result: &Result<T, RuntimeError>) -> Self {
    match result {
      Ok(_) => JobCompletionStatus::Success,
      Err(RuntimeError::JobPanicked(_)) => JobCompletionStatus::Panicked,
      Err(_) => JobCompletionStatus::Failed,
    }
  }
}

#[derive(Debug, Clone)]
pub struct JobCompletionInfo {
  pub job_id: JobId,
  pub pool_name: Arc<String>,
  pub status: JobCompletionStatus,
  /// Time the job spent executing on its worker.
  pub elapsed: Duration,
  pub completion_time: SystemTime,
}

type CompletionHandler = Arc<dyn Fn(JobCompletionInfo) + Send + Sync + 'static>;

/// Fans job completions out to user handlers.
///
/// Handlers run on the worker thread that finished the job, after the job's
/// promise has been resolved, so a slow handler delays that worker's next job
/// but never the waiting task.
pub(crate) struct CompletionNotifier {
  pool_name: Arc<String>,
  handlers: RwLock<Vec<CompletionHandler>>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("CompletionNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &handler_count)
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(pool_name: Arc<String>) -> Self {
    Self {
      pool_name,
      handlers: RwLock::new(Vec::new()),
    }
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(JobCompletionInfo) + Send + Sync + 'static) {
    let mut handlers = self.handlers.write();
    handlers.push(Arc::new(handler));
    info!(pool_name = %self.pool_name, "Notifier: Added new completion handler. Total handlers: {}", handlers.len());
  }

  pub(crate) fn notify(&self, job_id: JobId, status: JobCompletionStatus, elapsed: Duration) {
    // Snapshot so handlers can register further handlers without deadlocking.
    let handlers: Vec<CompletionHandler> = self.handlers.read().clone();
    if handlers.is_empty() {
      trace!(pool_name = %self.pool_name, %job_id, "No completion handlers registered, dropping notification.");
      return;
    }

    let info = JobCompletionInfo {
      job_id,
      pool_name: self.pool_name.clone(),
      status,
      elapsed,
      completion_time: SystemTime::now(),
    };
    debug!(pool_name = %self.pool_name, %job_id, ?status, "Dispatching notification to {} handlers.", handlers.len());

    for handler in handlers {
      let info_for_handler = info.clone();
      let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(info_for_handler)));
      if result.is_err() {
        error!(
          pool_name = %self.pool_name,
          %job_id,
          "A completion handler panicked during execution."
        );
      }
    }
  }
}
