//! A hybrid concurrency runtime: a single-threaded cooperative scheduler that
//! delegates blocking and CPU-bound work to bounded thread and process pools,
//! plus FIFO locks for state shared between preemptive contexts.
//!
//! Tasks are ordinary futures driven by [`run`]. They suspend on timers
//! ([`sleep`]), on [`Promise`]s resolved by pool workers, or on other tasks
//! ([`join_all`]). Pool workers and raw threads coordinate through [`Lock`],
//! whose hold/wait edges can be recorded in a [`WaitGraph`] to observe lock
//! ordering cycles.

mod clock;
mod config;
mod context;
mod error;
mod handle;
mod join;
mod notifier;
mod pool;
mod promise;
mod scheduler;
mod sync;
mod task;
mod time;

pub use clock::{Clock, SystemClock};
pub use config::{PoolConfig, RuntimeConfig, RuntimeConfigBuilder};
pub use error::RuntimeError;
pub use handle::JoinHandle;
pub use join::{join_all, JoinAll, Joinable};
pub use notifier::{JobCompletionInfo, JobCompletionStatus};
pub use pool::{
  serve_worker, serve_worker_if_requested, JobId, JobRegistry, PoolKind, ProcessJob, ProcessPool, ShutdownMode,
  spawn_blocking, ThreadPool, WorkerCommand, WorkerPool, BLOCKING_POOL_NAME, WORKER_ENV,
};
pub use promise::{Promise, Resolver, Wait};
pub use scheduler::{current_task, now, run, spawn, task_state, Runtime};
pub use sync::{ContextId, Lock, LockGuard, LockId, LockOrderingHazard, SharedCounter, WaitEdge, WaitGraph, WaitGraphSnapshot};
pub use task::{TaskId, TaskState};
pub use time::{sleep, timeout, yield_now, Sleep, Timeout, YieldNow};
