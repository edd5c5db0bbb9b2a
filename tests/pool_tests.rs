use hybrid_loop::{
  join_all, spawn, spawn_blocking, PoolConfig, PoolKind, Runtime, RuntimeConfig, RuntimeError, ShutdownMode, ThreadPool,
  WorkerPool,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hybrid_loop=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

/// Polls `condition` until it holds or a generous deadline passes.
fn wait_until(what: &str, condition: impl Fn() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !condition() {
    assert!(Instant::now() < deadline, "timed out waiting for {}", what);
    thread::sleep(Duration::from_millis(2));
  }
}

#[test]
fn test_jobs_from_two_tasks_run_in_parallel() {
  setup_tracing_for_test();
  let pool_name = "test_pool_parallel";
  tracing::info!("Starting test: {}", pool_name);
  let pool = ThreadPool::new(pool_name, 2).unwrap();

  let started = Instant::now();
  let tags = hybrid_loop::run({
    let pool = pool.clone();
    async move {
      let handles: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|tag| {
          let pool = pool.clone();
          spawn(async move {
            let promise = pool.submit(move || {
              thread::sleep(Duration::from_millis(100));
              Ok::<_, String>(tag)
            })?;
            promise.await
          })
        })
        .collect();
      join_all(handles).await
    }
  })
  .unwrap();
  let elapsed = started.elapsed();

  assert_eq!(tags, vec!["left", "right"]);
  assert!(elapsed >= Duration::from_millis(100), "finished too early: {:?}", elapsed);
  assert!(elapsed < Duration::from_millis(190), "jobs did not overlap: {:?}", elapsed);
  pool.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_job_error_rejects_promise() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_job_error", 1).unwrap();

  let promise = pool.submit(|| Err::<u32, _>("disk full")).unwrap();
  assert_eq!(promise.wait_blocking(), Err(RuntimeError::JobFailed("disk full".to_string())));
  pool.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_job_panic_is_contained_and_worker_survives() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_job_panic", 1).unwrap();

  let panicking = pool
    .execute(|| {
      if true {
        panic!("job blew up");
      }
      0u32
    })
    .unwrap();
  let after = pool.execute(|| 2 + 2).unwrap();

  assert_eq!(panicking.wait_blocking(), Err(RuntimeError::JobPanicked("job blew up".to_string())));
  assert_eq!(after.wait_blocking(), Ok(4));
  pool.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_submit_after_shutdown_is_rejected() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_closed", 2).unwrap();
  pool.shutdown(ShutdownMode::Drain);

  let result = pool.execute(|| ());
  assert!(matches!(result, Err(RuntimeError::PoolShuttingDown)));

  // A second shutdown is a no-op.
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_drain_shutdown_runs_queued_jobs() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_drain", 1).unwrap();
  let completed = Arc::new(AtomicUsize::new(0));

  let promises: Vec<_> = (0..5)
    .map(|i| {
      let completed = completed.clone();
      pool
        .execute(move || {
          thread::sleep(Duration::from_millis(10));
          completed.fetch_add(1, Ordering::SeqCst);
          i
        })
        .unwrap()
    })
    .collect();

  pool.shutdown(ShutdownMode::Drain);
  assert_eq!(completed.load(Ordering::SeqCst), 5);
  let values: Vec<_> = promises.iter().map(|p| p.try_get()).collect();
  assert_eq!(values, (0..5).map(|i| Some(Ok(i))).collect::<Vec<_>>());
}

#[test]
fn test_graceful_shutdown_drops_queued_jobs() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_graceful", 1).unwrap();
  let (started_tx, started_rx) = mpsc::channel();
  let (release_tx, release_rx) = mpsc::channel::<()>();

  let in_flight = pool
    .execute(move || {
      started_tx.send(()).unwrap();
      release_rx.recv().unwrap();
      "in-flight"
    })
    .unwrap();
  started_rx.recv().unwrap();

  let queued: Vec<_> = (0..3).map(|_| pool.execute(|| "queued").unwrap()).collect();
  assert_eq!(pool.queued_job_count(), 3);

  let releaser = thread::spawn(move || {
    thread::sleep(Duration::from_millis(50));
    release_tx.send(()).unwrap();
  });
  pool.shutdown(ShutdownMode::Graceful);
  releaser.join().unwrap();

  assert_eq!(in_flight.try_get(), Some(Ok("in-flight")));
  assert!(queued.iter().all(|p| !p.is_resolved()));
  assert_eq!(pool.queued_job_count(), 0);
}

#[test]
fn test_concurrency_never_exceeds_worker_count() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_limit", 2).unwrap();
  let running = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));

  let promises: Vec<_> = (0..8)
    .map(|_| {
      let running = running.clone();
      let max_seen = max_seen.clone();
      pool
        .execute(move || {
          let now = running.fetch_add(1, Ordering::SeqCst) + 1;
          max_seen.fetch_max(now, Ordering::SeqCst);
          thread::sleep(Duration::from_millis(20));
          running.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap()
    })
    .collect();

  for promise in &promises {
    promise.wait_blocking().unwrap();
  }
  let max_seen = max_seen.load(Ordering::SeqCst);
  assert!(max_seen <= 2, "saw {} concurrent jobs", max_seen);
  assert!(max_seen >= 1);
  pool.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_jobs_start_in_submission_order() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_order", 1).unwrap();
  let starts = Arc::new(Mutex::new(Vec::new()));

  for i in 0..10 {
    let starts = starts.clone();
    pool.execute(move || starts.lock().unwrap().push(i)).unwrap();
  }
  pool.shutdown(ShutdownMode::Drain);

  assert_eq!(*starts.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_pool_introspection() {
  setup_tracing_for_test();
  let config = PoolConfig::new("test_pool_introspection", 1).stack_size(256 * 1024);
  let pool = ThreadPool::with_config(config).unwrap();
  assert_eq!(pool.name(), "test_pool_introspection");
  assert_eq!(pool.kind(), PoolKind::Thread);
  assert_eq!(pool.worker_count(), 1);

  let (release_tx, release_rx) = mpsc::channel::<()>();
  let blocked = pool.execute(move || release_rx.recv().unwrap()).unwrap();
  let queued = pool.execute(|| ()).unwrap();

  wait_until("the first job to start", || pool.active_job_count() == 1);
  assert_eq!(pool.queued_job_count(), 1);

  release_tx.send(()).unwrap();
  blocked.wait_blocking().unwrap();
  queued.wait_blocking().unwrap();
  wait_until("the worker to go idle", || pool.active_job_count() == 0);
  pool.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_invalid_pool_config_is_rejected() {
  setup_tracing_for_test();
  assert!(matches!(ThreadPool::new("no_workers", 0), Err(RuntimeError::InvalidConfig(_))));
  assert!(matches!(ThreadPool::new("", 1), Err(RuntimeError::InvalidConfig(_))));

  let tiny_stack = PoolConfig::new("tiny_stack", 1).stack_size(1024);
  assert!(matches!(ThreadPool::with_config(tiny_stack), Err(RuntimeError::InvalidConfig(_))));
}

#[test]
fn test_run_reports_stall_while_job_never_finishes() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_stall", 1).unwrap();
  let (release_tx, release_rx) = mpsc::channel::<()>();
  let config = RuntimeConfig::builder()
    .name("stall_watchdog")
    .stall_timeout(Duration::from_millis(100))
    .build()
    .unwrap();

  let result = Runtime::new(config).unwrap().run({
    let pool = pool.clone();
    async move {
      let promise = pool.execute(move || release_rx.recv().unwrap())?;
      promise.await
    }
  });

  match result {
    Err(RuntimeError::Stalled { waited, outstanding_jobs }) => {
      assert!(waited >= Duration::from_millis(100));
      assert_eq!(outstanding_jobs, 1);
    }
    other => panic!("expected a stall, got {:?}", other),
  }

  release_tx.send(()).unwrap();
  pool.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_waiting_on_a_job_is_not_starvation() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_no_starvation", 1).unwrap();

  let value = hybrid_loop::run({
    let pool = pool.clone();
    async move {
      let promise = pool.execute(|| {
        thread::sleep(Duration::from_millis(50));
        "done"
      })?;
      promise.await
    }
  })
  .unwrap();

  assert_eq!(value, "done");
  pool.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_job_submitted_before_run_is_awaited() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_submitted_early", 1).unwrap();
  let promise = pool
    .execute(|| {
      thread::sleep(Duration::from_millis(100));
      7
    })
    .unwrap();

  let value = hybrid_loop::run(async move { promise.await });
  assert_eq!(value, Ok(7));
  pool.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_job_submitted_from_a_worker_is_awaited() {
  setup_tracing_for_test();
  let outer = ThreadPool::new("test_pool_nested_outer", 1).unwrap();
  let inner = ThreadPool::new("test_pool_nested_inner", 1).unwrap();

  let value = hybrid_loop::run({
    let outer = outer.clone();
    let inner = inner.clone();
    async move {
      let inner_promise = outer
        .submit(move || {
          inner.execute(|| {
            thread::sleep(Duration::from_millis(100));
            9
          })
        })?
        .await?;
      inner_promise.await
    }
  });

  assert_eq!(value, Ok(9));
  outer.shutdown(ShutdownMode::Drain);
  inner.shutdown(ShutdownMode::Drain);
}

#[test]
fn test_job_dropped_by_graceful_shutdown_ends_run_with_starvation() {
  setup_tracing_for_test();
  let pool = ThreadPool::new("test_pool_dropped_job", 1).unwrap();
  let (release_tx, release_rx) = mpsc::channel::<()>();
  let blocker = pool.execute(move || release_rx.recv().unwrap()).unwrap();
  let queued = pool.execute(|| "never runs").unwrap();

  let closer = thread::spawn({
    let pool = pool.clone();
    move || {
      thread::sleep(Duration::from_millis(50));
      pool.shutdown(ShutdownMode::Graceful);
    }
  });

  let result = hybrid_loop::run(async move { queued.await });
  assert_eq!(result, Err(RuntimeError::Starvation { suspended: 1 }));

  release_tx.send(()).unwrap();
  closer.join().unwrap();
  assert_eq!(blocker.try_get(), Some(Ok(())));
}

#[test]
fn test_spawn_blocking_jobs_join_in_parallel() {
  setup_tracing_for_test();
  let started = Instant::now();
  let values = hybrid_loop::run(async {
    let promises: Vec<_> = (1..=2u64)
      .map(|i| {
        spawn_blocking(move || {
          thread::sleep(Duration::from_millis(100));
          (i, thread::current().name().map(str::to_string))
        })
      })
      .collect();
    join_all(promises).await
  })
  .unwrap();
  let elapsed = started.elapsed();

  assert_eq!(values.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2]);
  for (_, worker) in &values {
    let worker = worker.as_deref().unwrap_or_default();
    assert!(worker.starts_with(hybrid_loop::BLOCKING_POOL_NAME), "ran on {:?}", worker);
  }
  assert!(elapsed < Duration::from_millis(190), "blocking jobs did not overlap: {:?}", elapsed);
}
