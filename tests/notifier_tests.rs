use hybrid_loop::{JobCompletionInfo, JobCompletionStatus, ShutdownMode, ThreadPool, WorkerPool};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

// Helper to initialize tracing for tests
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

// Helper for collecting notifications in tests
fn create_collecting_handler() -> (
  Arc<Mutex<Vec<JobCompletionInfo>>>,
  impl Fn(JobCompletionInfo) + Send + Sync + 'static,
) {
  let collected_notifications = Arc::new(Mutex::new(Vec::new()));
  let collected_notifications_clone = collected_notifications.clone();
  let handler = move |info: JobCompletionInfo| {
    tracing::debug!(
      "Test Collecting Handler: Received notification for job_id: {}, status: {:?}",
      info.job_id,
      info.status
    );
    collected_notifications_clone.lock().unwrap().push(info);
  };
  (collected_notifications, handler)
}

#[test]
fn test_completion_notifier_success() {
  setup_tracing_for_test();
  let pool_name = "test_notifier_success";
  tracing::info!("Starting test: {}", pool_name);
  let pool = ThreadPool::new(pool_name, 1).unwrap();
  let (notifications, handler) = create_collecting_handler();
  pool.add_completion_handler(handler);

  let promise = pool
    .execute(|| {
      thread::sleep(Duration::from_millis(30));
      "success_val"
    })
    .unwrap();
  assert_eq!(promise.wait_blocking(), Ok("success_val"));
  // Joining the workers guarantees the handlers have run.
  pool.shutdown(ShutdownMode::Drain);

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 1);
  let info = &notifs[0];
  assert_eq!(*info.pool_name, pool_name);
  assert_eq!(info.status, JobCompletionStatus::Success);
  assert!(info.elapsed >= Duration::from_millis(30));
  assert!(info.completion_time <= std::time::SystemTime::now());
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_completion_notifier_failed_and_panicked() {
  setup_tracing_for_test();
  let pool_name = "test_notifier_failures";
  tracing::info!("Starting test: {}", pool_name);
  let pool = ThreadPool::new(pool_name, 1).unwrap();
  let (notifications, handler) = create_collecting_handler();
  pool.add_completion_handler(handler);

  let failed = pool.submit(|| Err::<(), _>("refused")).unwrap();
  let panicked = pool
    .execute(|| {
      if true {
        panic!("job panicked for the notifier test");
      }
    })
    .unwrap();
  assert!(failed.wait_blocking().is_err());
  assert!(panicked.wait_blocking().is_err());
  pool.shutdown(ShutdownMode::Drain);

  let notifs = notifications.lock().unwrap();
  let statuses: Vec<_> = notifs.iter().map(|info| info.status).collect();
  assert_eq!(statuses, vec![JobCompletionStatus::Failed, JobCompletionStatus::Panicked]);
  assert!(notifs[0].job_id < notifs[1].job_id);
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_completion_notifier_multiple_handlers() {
  setup_tracing_for_test();
  let pool_name = "test_notifier_multi_handler";
  tracing::info!("Starting test: {}", pool_name);
  let pool = ThreadPool::new(pool_name, 1).unwrap();

  let (notifications1, handler1) = create_collecting_handler();
  let (notifications2, handler2) = create_collecting_handler();
  pool.add_completion_handler(handler1);
  pool.add_completion_handler(handler2);

  let promise = pool.execute(|| 7).unwrap();
  assert_eq!(promise.wait_blocking(), Ok(7));
  pool.shutdown(ShutdownMode::Drain);

  let notifs1 = notifications1.lock().unwrap();
  let notifs2 = notifications2.lock().unwrap();
  assert_eq!(notifs1.len(), 1);
  assert_eq!(notifs2.len(), 1);
  assert_eq!(notifs1[0].job_id, notifs2[0].job_id);
  assert_eq!(notifs2[0].status, JobCompletionStatus::Success);
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_completion_notifier_handler_panics() {
  setup_tracing_for_test();
  let pool_name = "test_notifier_handler_panic";
  tracing::info!("Starting test: {}", pool_name);
  let pool = ThreadPool::new(pool_name, 1).unwrap();

  let (notifications_collect, collecting_handler) = create_collecting_handler();
  let panicking_handler = |_info: JobCompletionInfo| {
    panic!("Intentional panic in completion handler for test_notifier_handler_panic!");
  };

  pool.add_completion_handler(panicking_handler); // Add panicking handler first
  pool.add_completion_handler(collecting_handler); // Add normal handler second

  let first = pool.execute(|| "first").unwrap();
  let second = pool.execute(|| "second").unwrap();
  assert_eq!(first.wait_blocking(), Ok("first"));
  assert_eq!(second.wait_blocking(), Ok("second"));
  pool.shutdown(ShutdownMode::Drain);

  let collected = notifications_collect.lock().unwrap();
  assert_eq!(collected.len(), 2, "Collecting handler should still have received both notifications.");
  assert!(collected.iter().all(|info| info.status == JobCompletionStatus::Success));
  tracing::info!("Finished test: {}. Check logs for handler panic.", pool_name);
}

#[test]
fn test_completion_notifier_during_graceful_shutdown() {
  setup_tracing_for_test();
  let pool_name = "test_notifier_graceful_shutdown";
  tracing::info!("Starting test: {}", pool_name);
  let pool = ThreadPool::new(pool_name, 1).unwrap();
  let (notifications, handler) = create_collecting_handler();
  pool.add_completion_handler(handler);

  let (started_tx, started_rx) = mpsc::channel();
  // Job A (active, will complete)
  let job_a = pool
    .execute(move || {
      started_tx.send(()).unwrap();
      thread::sleep(Duration::from_millis(100));
      "job_a_graceful"
    })
    .unwrap();
  // Job B (queued, will not run)
  let job_b = pool.execute(|| "job_b_queued_graceful").unwrap();

  started_rx.recv().unwrap();
  assert_eq!(pool.active_job_count(), 1);
  assert_eq!(pool.queued_job_count(), 1);

  pool.shutdown(ShutdownMode::Graceful);

  assert_eq!(job_a.try_get(), Some(Ok("job_a_graceful")));
  assert_eq!(job_b.try_get(), None);

  let notifs = notifications.lock().unwrap();
  assert_eq!(notifs.len(), 1, "Only job A should have a completion notification.");
  assert_eq!(notifs[0].status, JobCompletionStatus::Success);
  tracing::info!("Finished test: {}", pool_name);
}
