//! Bounded worker pools that bridge blocking and CPU-bound work into the
//! cooperative regime.
//!
//! Both pool kinds share the same contract: `submit` enqueues a job without
//! blocking and returns a [`Promise`](crate::Promise) that a worker resolves
//! with the job's value or error. At most `workers` jobs run at once, jobs
//! start in submission order and may finish in any order.

mod process_pool;
mod queue;
mod thread_pool;

pub use process_pool::{serve_worker, serve_worker_if_requested, JobRegistry, ProcessJob, ProcessPool, WorkerCommand, WORKER_ENV};
pub use thread_pool::{spawn_blocking, ThreadPool, BLOCKING_POOL_NAME};

use crate::config::PoolConfig;
use crate::error::RuntimeError;
use crate::notifier::CompletionNotifier;
use queue::JobQueue;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_POOL_JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Identity of a submitted job, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
  pub(crate) fn next() -> Self {
    JobId(NEXT_POOL_JOB_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
  }

  pub fn as_u64(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for JobId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "job-{}", self.0)
  }
}

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Queued and in-flight jobs all run to completion before workers exit.
  Drain,
  /// In-flight jobs finish; queued jobs that haven't started are dropped and
  /// their promises never resolve.
  Graceful,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
  /// Workers share the host process's memory.
  Thread,
  /// Workers run in isolated child processes.
  Process,
}

/// Introspection and lifecycle shared by both pool kinds.
pub trait WorkerPool: Send + Sync {
  fn name(&self) -> &str;
  fn kind(&self) -> PoolKind;
  fn worker_count(&self) -> usize;
  /// Jobs currently executing on a worker.
  fn active_job_count(&self) -> usize;
  /// Jobs waiting for a free worker.
  fn queued_job_count(&self) -> usize;
  /// Stops accepting jobs and joins the workers once they are done according
  /// to `mode`. Calling it again only waits for workers not yet joined.
  fn shutdown(&self, mode: ShutdownMode);
}

/// Worker threads, queue and shutdown state common to both pool kinds.
pub(crate) struct PoolCore<J: Send + 'static> {
  pub(crate) name: Arc<String>,
  kind: PoolKind,
  queue: Arc<JobQueue<(JobId, J)>>,
  shutdown_token: CancellationToken,
  workers: Mutex<Vec<JoinHandle<()>>>,
  worker_count: usize,
  /// Jobs currently on a worker, with the instant they started.
  active: Arc<DashMap<JobId, Instant>>,
  pub(crate) notifier: Arc<CompletionNotifier>,
}

impl<J: Send + 'static> PoolCore<J> {
  /// Spawns `config.workers` threads. `make_worker` builds the per-worker job
  /// runner; it owns whatever state the worker keeps between jobs.
  pub(crate) fn start<W, F>(config: &PoolConfig, kind: PoolKind, make_worker: F) -> Result<Self, RuntimeError>
  where
    F: Fn(usize) -> W,
    W: FnMut(JobId, J) + Send + 'static,
  {
    config.validate()?;
    let name = Arc::new(config.name.clone());
    let queue = Arc::new(JobQueue::new());
    let active = Arc::new(DashMap::new());
    let shutdown_token = CancellationToken::new();
    let mut workers = Vec::with_capacity(config.workers);

    for index in 0..config.workers {
      let mut run_job = make_worker(index);
      let worker_queue = queue.clone();
      let worker_active = active.clone();
      let span = info_span!("pool_worker", pool_name = %name, worker = index);

      let mut builder = thread::Builder::new().name(format!("{}-{}", name, index));
      if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
      }

      let spawned = builder.spawn(move || {
        let _entered = span.entered();
        debug!("Worker started.");
        while let Some((job_id, job)) = worker_queue.pop_blocking() {
          worker_active.insert(job_id, Instant::now());
          trace!(%job_id, "Dequeued job.");
          run_job(job_id, job);
          worker_active.remove(&job_id);
        }
        debug!("Worker stopped.");
      });

      match spawned {
        Ok(handle) => workers.push(handle),
        Err(e) => {
          error!(pool_name = %name, "Failed to spawn worker thread: {}", e);
          let _ = queue.close(true);
          for handle in workers {
            let _ = handle.join();
          }
          return Err(RuntimeError::invalid_config(format!("failed to spawn worker thread: {}", e)));
        }
      }
    }

    info!(pool_name = %name, ?kind, workers = config.workers, "Pool started.");
    Ok(Self {
      notifier: Arc::new(CompletionNotifier::new(name.clone())),
      name,
      kind,
      queue,
      shutdown_token,
      workers: Mutex::new(workers),
      worker_count: config.workers,
      active,
    })
  }

  pub(crate) fn enqueue(&self, job_id: JobId, job: J) -> Result<(), RuntimeError> {
    if self.shutdown_token.is_cancelled() {
      warn!(pool_name = %self.name, %job_id, "Submit: Attempted to submit job to a pool that is shutting down or closed.");
      return Err(RuntimeError::PoolShuttingDown);
    }
    debug!(pool_name = %self.name, %job_id, "Submitting job to queue.");
    self.queue.push((job_id, job)).map_err(|_rejected| {
      warn!(pool_name = %self.name, %job_id, "Submit: Queue closed concurrently with submission.");
      RuntimeError::PoolShuttingDown
    })
  }

  fn close(&self, mode: ShutdownMode) {
    if self.shutdown_token.is_cancelled() {
      trace!(pool_name = %self.name, "Shutdown already in progress or initiated by another call/Drop.");
      return;
    }
    self.shutdown_token.cancel();
    let discarded = self.queue.close(mode == ShutdownMode::Drain);
    if discarded.is_empty() {
      info!(pool_name = %self.name, ?mode, "Shutdown requested; job queue closed.");
    } else {
      warn!(pool_name = %self.name, ?mode, "Shutdown requested; dropping {} queued job(s).", discarded.len());
    }
    drop(discarded);
  }
}

impl<J: Send + 'static> WorkerPool for PoolCore<J> {
  fn name(&self) -> &str {
    &self.name
  }

  fn kind(&self) -> PoolKind {
    self.kind
  }

  fn worker_count(&self) -> usize {
    self.worker_count
  }

  fn active_job_count(&self) -> usize {
    self.active.len()
  }

  fn queued_job_count(&self) -> usize {
    self.queue.len()
  }

  fn shutdown(&self, mode: ShutdownMode) {
    self.close(mode);

    let handles = std::mem::take(&mut *self.workers.lock());
    if handles.is_empty() {
      trace!(pool_name = %self.name, "Worker handles already taken; no join needed.");
      return;
    }
    info!(pool_name = %self.name, "Waiting for {} worker(s) to join.", handles.len());
    for handle in handles {
      if handle.join().is_err() {
        error!(pool_name = %self.name, "Error joining worker during shutdown. Worker thread panicked.");
      }
    }
    info!(pool_name = %self.name, "Pool shutdown completed.");
  }
}

impl<J: Send + 'static> Drop for PoolCore<J> {
  fn drop(&mut self) {
    if !self.queue.is_closed() {
      // Workers finish the remaining jobs on their own; they are not joined here.
      info!(pool_name = %self.name, "Pool dropped. Initiating implicit drain shutdown.");
      self.close(ShutdownMode::Drain);
    }
  }
}

impl<J: Send + 'static> fmt::Debug for PoolCore<J> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolCore")
      .field("name", &self.name)
      .field("kind", &self.kind)
      .field("worker_count", &self.worker_count)
      .field("queue", &self.queue)
      .field("shutting_down", &self.shutdown_token.is_cancelled())
      .finish()
  }
}
