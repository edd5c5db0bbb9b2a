//! Runs without the default test harness: the test binary is also the worker
//! executable the process pool launches, so `main` must hand control to the
//! worker loop before anything else happens.

use hybrid_loop::{
  join_all, serve_worker_if_requested, sleep, spawn, JobRegistry, PoolKind, ProcessJob, ProcessPool, RuntimeError,
  ShutdownMode, WorkerPool,
};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BurnReport {
  rounds: u64,
  pid: u32,
}

/// Spins the CPU for the requested number of milliseconds.
struct BurnCpu;

impl ProcessJob for BurnCpu {
  const NAME: &'static str = "burn_cpu";
  type Input = u64;
  type Output = BurnReport;
  type Error = String;

  fn run(millis: u64) -> Result<BurnReport, String> {
    let deadline = Instant::now() + Duration::from_millis(millis);
    let mut rounds = 0u64;
    let mut acc = 0u64;
    while Instant::now() < deadline {
      for i in 0..10_000u64 {
        acc = acc.wrapping_mul(31).wrapping_add(i);
      }
      rounds += 1;
    }
    std::hint::black_box(acc);
    Ok(BurnReport {
      rounds,
      pid: std::process::id(),
    })
  }
}

struct CheckedSqrt;

impl ProcessJob for CheckedSqrt {
  const NAME: &'static str = "checked_sqrt";
  type Input = i64;
  type Output = f64;
  type Error = String;

  fn run(value: i64) -> Result<f64, String> {
    if value < 0 {
      return Err(format!("negative input: {}", value));
    }
    if value == i64::MAX {
      panic!("refusing to take the root of i64::MAX");
    }
    Ok((value as f64).sqrt())
  }
}

/// Input keyed by tuples, which JSON objects cannot represent.
struct TallyGrid;

impl ProcessJob for TallyGrid {
  const NAME: &'static str = "tally_grid";
  type Input = HashMap<(i32, i32), u32>;
  type Output = u32;
  type Error = String;

  fn run(grid: HashMap<(i32, i32), u32>) -> Result<u32, String> {
    Ok(grid.values().sum())
  }
}

/// Implemented but never registered.
struct Unregistered;

impl ProcessJob for Unregistered {
  const NAME: &'static str = "unregistered";
  type Input = ();
  type Output = ();
  type Error = String;

  fn run(_: ()) -> Result<(), String> {
    Ok(())
  }
}

fn registry() -> JobRegistry {
  JobRegistry::new()
    .register::<BurnCpu>()
    .register::<CheckedSqrt>()
    .register::<TallyGrid>()
}

fn setup_tracing_for_test() {
  use tracing_subscriber::{fmt, EnvFilter};
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hybrid_loop=debug"));
  fmt::Subscriber::builder()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .try_init()
    .ok();
}

fn test_cpu_job_runs_while_ticker_keeps_going(registry: &Arc<JobRegistry>) {
  let pool = ProcessPool::new("test_process_pool_ticks", 1, registry.clone()).unwrap();
  assert_eq!(pool.kind(), PoolKind::Process);

  let (report, ticks) = hybrid_loop::run({
    let pool = pool.clone();
    async move {
      let job_done = Rc::new(Cell::new(false));
      let ticker = {
        let job_done = job_done.clone();
        spawn(async move {
          let mut ticks = 0u32;
          while !job_done.get() {
            sleep(Duration::from_millis(100)).await;
            ticks += 1;
            tracing::info!(ticks, "tick");
          }
          Ok::<_, RuntimeError>(ticks)
        })
      };
      let report = pool.submit::<BurnCpu>(600)?.await;
      job_done.set(true);
      let ticks = ticker.await?;
      Ok::<_, RuntimeError>((report?, ticks))
    }
  })
  .unwrap();

  assert_ne!(report.pid, std::process::id(), "job should run in a separate process");
  assert!(report.rounds > 0);
  assert!(ticks >= 4, "ticker only advanced {} times while the job ran", ticks);
  pool.shutdown(ShutdownMode::Drain);
}

fn test_parallel_jobs_use_separate_workers(registry: &Arc<JobRegistry>) {
  let pool = ProcessPool::new("test_process_pool_parallel", 2, registry.clone()).unwrap();

  let reports = hybrid_loop::run({
    let pool = pool.clone();
    async move {
      let handles: Vec<_> = (0..2)
        .map(|_| {
          let pool = pool.clone();
          spawn(async move { pool.submit::<BurnCpu>(200)?.await })
        })
        .collect();
      join_all(handles).await
    }
  })
  .unwrap();

  assert_eq!(reports.len(), 2);
  assert_ne!(reports[0].pid, reports[1].pid);
  pool.shutdown(ShutdownMode::Drain);
}

fn test_job_errors_cross_the_boundary(registry: &Arc<JobRegistry>) {
  let pool = ProcessPool::new("test_process_pool_errors", 1, registry.clone()).unwrap();

  let root = pool.submit::<CheckedSqrt>(49).unwrap();
  let negative = pool.submit::<CheckedSqrt>(-3).unwrap();
  let panicking = pool.submit::<CheckedSqrt>(i64::MAX).unwrap();
  let after_panic = pool.submit::<CheckedSqrt>(16).unwrap();

  assert_eq!(root.wait_blocking(), Ok(7.0));
  assert_eq!(negative.wait_blocking(), Err(RuntimeError::JobFailed("negative input: -3".to_string())));
  assert_eq!(
    panicking.wait_blocking(),
    Err(RuntimeError::JobPanicked("refusing to take the root of i64::MAX".to_string()))
  );
  assert_eq!(after_panic.wait_blocking(), Ok(4.0));
  pool.shutdown(ShutdownMode::Drain);
}

fn test_untransferable_jobs_fail_fast(registry: &Arc<JobRegistry>) {
  let pool = ProcessPool::new("test_process_pool_transfer", 1, registry.clone()).unwrap();

  let unregistered = pool.submit::<Unregistered>(());
  assert!(matches!(unregistered, Err(RuntimeError::NotTransferable(_))));

  let grid = HashMap::from([((0, 0), 1u32), ((0, 1), 2)]);
  let unserializable = pool.submit::<TallyGrid>(grid);
  assert!(matches!(unserializable, Err(RuntimeError::NotTransferable(_))));

  assert_eq!(pool.queued_job_count(), 0);
  pool.shutdown(ShutdownMode::Drain);
}

fn main() {
  let registry = registry();
  serve_worker_if_requested(&registry);

  setup_tracing_for_test();
  let registry = Arc::new(registry);
  let tests: [(&str, fn(&Arc<JobRegistry>)); 4] = [
    ("test_cpu_job_runs_while_ticker_keeps_going", test_cpu_job_runs_while_ticker_keeps_going),
    ("test_parallel_jobs_use_separate_workers", test_parallel_jobs_use_separate_workers),
    ("test_job_errors_cross_the_boundary", test_job_errors_cross_the_boundary),
    ("test_untransferable_jobs_fail_fast", test_untransferable_jobs_fail_fast),
  ];

  println!("running {} tests", tests.len());
  for (name, test) in tests {
    tracing::info!("Starting test: {}", name);
    test(&registry);
    println!("test {} ... ok", name);
  }
  println!("\ntest result: ok. {} passed", tests.len());
}
