use super::{JobId, PoolCore, PoolKind, ShutdownMode, WorkerPool};
use crate::config::PoolConfig;
use crate::error::{panic_message, RuntimeError};
use crate::notifier::{JobCompletionInfo, JobCompletionStatus};
use crate::promise::Promise;

use std::convert::Infallible;
use std::fmt::{self, Display};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

type BoxedJob = Box<dyn FnOnce() + Send + 'static>;

/// Name of the pool behind [`spawn_blocking`].
pub const BLOCKING_POOL_NAME: &str = "hybrid_loop-blocking";

lazy_static::lazy_static! {
  static ref BLOCKING_POOL: Result<Arc<ThreadPool>, RuntimeError> = {
    let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
    let pool = ThreadPool::new(BLOCKING_POOL_NAME, (workers + 4).min(32));
    if let Err(e) = &pool {
      error!(pool_name = BLOCKING_POOL_NAME, "Failed to start the default blocking pool: {}", e);
    }
    pool
  };
}

/// Runs `job` on the process-wide default blocking pool, started on first use.
///
/// The pool has `min(32, cores + 4)` workers and lives until the process
/// exits. Any failure to start or reach it resolves the promise with that
/// error.
pub fn spawn_blocking<F, T>(job: F) -> Promise<T>
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  match &*BLOCKING_POOL {
    Ok(pool) => pool.execute(job).unwrap_or_else(|e| Promise::resolved(Err(e))),
    Err(e) => Promise::resolved(Err(e.clone())),
  }
}

/// A pool of OS threads for blocking work.
///
/// Jobs share the host's memory, so a job may capture anything that is `Send`.
/// A job that returns `Err` or panics resolves its promise with
/// [`RuntimeError::JobFailed`] or [`RuntimeError::JobPanicked`]; the worker
/// survives both.
pub struct ThreadPool {
  core: PoolCore<BoxedJob>,
}

impl ThreadPool {
  pub fn new(name: &str, workers: usize) -> Result<Arc<Self>, RuntimeError> {
    Self::with_config(PoolConfig::new(name, workers))
  }

  pub fn with_config(config: PoolConfig) -> Result<Arc<Self>, RuntimeError> {
    let core = PoolCore::start(&config, PoolKind::Thread, |_index| {
      |job_id: JobId, job: BoxedJob| {
        trace!(%job_id, "Running job.");
        job();
      }
    })?;
    Ok(Arc::new(Self { core }))
  }

  /// Enqueues `job` and returns a promise for its value. Never blocks the
  /// caller; the job starts once a worker is free.
  pub fn submit<F, T, E>(&self, job: F) -> Result<Promise<T>, RuntimeError>
  where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Display,
  {
    let job_id = JobId::next();
    let (resolver, promise) = Promise::channel();
    let notifier = self.core.notifier.clone();
    let pool_name = self.core.name.clone();

    let wrapped: BoxedJob = Box::new(move || {
      let started = Instant::now();
      let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
          debug!(pool_name = %pool_name, %job_id, "Job returned an error: {}", e);
          Err(RuntimeError::JobFailed(e.to_string()))
        }
        Err(payload) => {
          let message = panic_message(payload.as_ref());
          error!(pool_name = %pool_name, %job_id, "Job panicked during execution: {}", message);
          Err(RuntimeError::JobPanicked(message))
        }
      };
      let elapsed = started.elapsed();
      let status = JobCompletionStatus::from(&outcome);
      resolver.resolve(outcome);
      notifier.notify(job_id, status, elapsed);
    });

    self.core.enqueue(job_id, wrapped)?;
    Ok(promise)
  }

  /// Submits a job that cannot fail on its own.
  pub fn execute<F, T>(&self, job: F) -> Result<Promise<T>, RuntimeError>
  where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
  {
    self.submit(move || Ok::<T, Infallible>(job()))
  }

  /// Registers a handler invoked on the worker thread after each job's
  /// promise has been resolved.
  pub fn add_completion_handler(&self, handler: impl Fn(JobCompletionInfo) + Send + Sync + 'static) {
    self.core.notifier.add_handler(handler);
  }
}

impl WorkerPool for ThreadPool {
  fn name(&self) -> &str {
    self.core.name()
  }

  fn kind(&self) -> PoolKind {
    self.core.kind()
  }

  fn worker_count(&self) -> usize {
    self.core.worker_count()
  }

  fn active_job_count(&self) -> usize {
    self.core.active_job_count()
  }

  fn queued_job_count(&self) -> usize {
    self.core.queued_job_count()
  }

  fn shutdown(&self, mode: ShutdownMode) {
    if mode == ShutdownMode::Graceful && self.core.queued_job_count() > 0 {
      warn!(pool_name = %self.core.name, "Graceful shutdown leaves queued jobs unresolved.");
    }
    self.core.shutdown(mode);
  }
}

impl fmt::Debug for ThreadPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ThreadPool").field("core", &self.core).finish()
  }
}
