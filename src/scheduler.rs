use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{panic_message, RuntimeError};
use crate::handle::{JoinHandle, JoinSlot};
use crate::task::{Suspension, TaskEntry, TaskId, TaskState};

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures::task::ArcWake;
use futures::FutureExt;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, info_span, trace, warn};

/// The part of a run that other threads may touch: the wake-up queue fed by
/// wakers and the count of task waits on pool work still in flight.
///
/// Marking a task ready is the only preemptive-safe critical section of the
/// scheduler.
#[derive(Debug, Default)]
pub(crate) struct Shared {
  woken: Mutex<VecDeque<TaskId>>,
  signal: Condvar,
  outstanding_jobs: AtomicUsize,
}

impl Shared {
  fn wake(&self, id: TaskId) {
    let mut woken = self.woken.lock();
    woken.push_back(id);
    self.signal.notify_one();
  }

  fn take_woken(&self) -> VecDeque<TaskId> {
    std::mem::take(&mut *self.woken.lock())
  }

  fn has_woken(&self) -> bool {
    !self.woken.lock().is_empty()
  }

  pub(crate) fn outstanding_jobs(&self) -> usize {
    self.outstanding_jobs.load(AtomicOrdering::SeqCst)
  }

  /// Blocks the loop thread until a wake-up arrives, the outstanding job count
  /// moves away from `observed_outstanding`, or `timeout` elapses.
  fn park(&self, timeout: Option<Duration>, observed_outstanding: usize) {
    let mut woken = self.woken.lock();
    if !woken.is_empty() || self.outstanding_jobs() != observed_outstanding {
      return;
    }
    match timeout {
      Some(timeout) => {
        self.signal.wait_for(&mut woken, timeout);
      }
      None => self.signal.wait(&mut woken),
    }
  }
}

struct TaskWaker {
  id: TaskId,
  shared: Arc<Shared>,
}

impl ArcWake for TaskWaker {
  fn wake_by_ref(arc_self: &Arc<Self>) {
    arc_self.shared.wake(arc_self.id);
  }
}

/// Counts one suspended wait on a promise whose producer is still alive, so
/// the loop parks instead of reporting starvation while that work is in
/// flight. Released when the wait completes, is dropped, or sees its
/// producer go away.
pub(crate) struct OutstandingWait {
  shared: Arc<Shared>,
}

impl OutstandingWait {
  /// Registers with the run active on the calling thread, if any.
  pub(crate) fn register() -> Option<Self> {
    context::try_current().map(|core| {
      core.shared.outstanding_jobs.fetch_add(1, AtomicOrdering::SeqCst);
      Self {
        shared: core.shared.clone(),
      }
    })
  }
}

impl Drop for OutstandingWait {
  fn drop(&mut self) {
    self.shared.outstanding_jobs.fetch_sub(1, AtomicOrdering::SeqCst);
    let _woken = self.shared.woken.lock();
    self.shared.signal.notify_one();
  }
}

impl fmt::Debug for OutstandingWait {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OutstandingWait").finish_non_exhaustive()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
  pub(crate) deadline: Instant,
  seq: u64,
}

/// State of one scheduler run. Lives on the loop thread only.
pub(crate) struct Core {
  pub(crate) shared: Arc<Shared>,
  config: RuntimeConfig,
  tasks: RefCell<HashMap<TaskId, TaskEntry>>,
  ready: RefCell<VecDeque<TaskId>>,
  timers: RefCell<BTreeMap<TimerKey, Waker>>,
  timer_seq: Cell<u64>,
  finish_seq: Cell<u64>,
  current_task: Cell<Option<TaskId>>,
  suspension: Cell<Option<Suspension>>,
  last_now: Cell<Instant>,
}

impl Core {
  fn new(config: RuntimeConfig) -> Self {
    let start = config.clock.now();
    Self {
      shared: Arc::new(Shared::default()),
      config,
      tasks: RefCell::new(HashMap::new()),
      ready: RefCell::new(VecDeque::new()),
      timers: RefCell::new(BTreeMap::new()),
      timer_seq: Cell::new(0),
      finish_seq: Cell::new(0),
      current_task: Cell::new(None),
      suspension: Cell::new(None),
      last_now: Cell::new(start),
    }
  }

  /// Clock reading clamped so it never goes backwards within the run.
  pub(crate) fn now(&self) -> Instant {
    let now = self.config.clock.now().max(self.last_now.get());
    self.last_now.set(now);
    now
  }

  pub(crate) fn note_suspension(&self, suspension: Suspension) {
    self.suspension.set(Some(suspension));
  }

  pub(crate) fn current_task(&self) -> Option<TaskId> {
    self.current_task.get()
  }

  pub(crate) fn task_state(&self, id: TaskId) -> Option<TaskState> {
    self.tasks.borrow().get(&id).map(|entry| entry.state)
  }

  fn next_finish_seq(&self) -> u64 {
    let seq = self.finish_seq.get();
    self.finish_seq.set(seq + 1);
    seq
  }

  pub(crate) fn spawn_task<F, T>(self: &Rc<Self>, body: F) -> JoinHandle<T>
  where
    F: Future<Output = Result<T, RuntimeError>> + 'static,
    T: 'static,
  {
    let id = TaskId::next();
    let slot = Rc::new(RefCell::new(JoinSlot::new()));
    let task_slot = slot.clone();
    let core_ref = Rc::downgrade(self);

    let wrapped = async move {
      let outcome = match AssertUnwindSafe(body).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
          let message = panic_message(&*payload);
          error!(task_id = %id, "Task panicked: {}", message);
          Err(RuntimeError::TaskFailed(message))
        }
      };
      let terminal = match &outcome {
        Ok(_) => TaskState::Completed,
        Err(e) => {
          debug!(task_id = %id, "Task failed: {}", e);
          TaskState::Failed
        }
      };
      let seq = core_ref.upgrade().map(|core| core.next_finish_seq()).unwrap_or_default();
      let observed = task_slot.borrow_mut().finish(outcome, seq);
      if !observed && terminal == TaskState::Failed {
        warn!(task_id = %id, "Detached task failed and nobody is left to observe the error.");
      }
      terminal
    }
    .boxed_local();

    let waker = futures::task::waker(Arc::new(TaskWaker {
      id,
      shared: self.shared.clone(),
    }));
    self.tasks.borrow_mut().insert(id, TaskEntry::new(wrapped, waker));
    self.ready.borrow_mut().push_back(id);
    debug!(task_id = %id, "Spawned task.");

    JoinHandle::new(id, slot, Rc::downgrade(self))
  }

  /// Called when the joiner is done with a task: drops the table entry if the
  /// task already finished, otherwise marks it detached.
  pub(crate) fn release(&self, id: TaskId) {
    let removed = {
      let mut tasks = match self.tasks.try_borrow_mut() {
        Ok(tasks) => tasks,
        Err(_) => return,
      };
      let finished = match tasks.get_mut(&id) {
        Some(entry) if entry.state.is_terminal() => true,
        Some(entry) => {
          entry.detached = true;
          false
        }
        None => false,
      };
      if finished {
        tasks.remove(&id)
      } else {
        None
      }
    };
    if removed.is_some() {
      trace!(task_id = %id, "Task removed from table after its outcome was observed.");
    }
  }

  pub(crate) fn register_timer(&self, deadline: Instant, waker: Waker) -> TimerKey {
    let seq = self.timer_seq.get();
    self.timer_seq.set(seq + 1);
    let key = TimerKey { deadline, seq };
    self.timers.borrow_mut().insert(key, waker);
    key
  }

  pub(crate) fn refresh_timer(&self, key: TimerKey, waker: &Waker) {
    let mut timers = self.timers.borrow_mut();
    match timers.get_mut(&key) {
      Some(existing) if existing.will_wake(waker) => {}
      Some(existing) => *existing = waker.clone(),
      None => {
        timers.insert(key, waker.clone());
      }
    }
  }

  pub(crate) fn cancel_timer(&self, key: TimerKey) {
    let removed = match self.timers.try_borrow_mut() {
      Ok(mut timers) => timers.remove(&key),
      Err(_) => None,
    };
    drop(removed);
  }

  fn next_timer_deadline(&self) -> Option<Instant> {
    self.timers.borrow().keys().next().map(|key| key.deadline)
  }

  fn fire_expired_timers(&self, now: Instant) {
    let expired: Vec<Waker> = {
      let mut timers = self.timers.borrow_mut();
      let mut expired = Vec::new();
      while let Some(entry) = timers.first_entry() {
        if entry.key().deadline > now {
          break;
        }
        expired.push(entry.remove());
      }
      expired
    };
    for waker in expired {
      waker.wake();
    }
  }

  /// Moves tasks woken since the last call into the ready queue, in wake order.
  fn drain_woken(&self) {
    let woken = self.shared.take_woken();
    if woken.is_empty() {
      return;
    }
    let mut tasks = self.tasks.borrow_mut();
    let mut ready = self.ready.borrow_mut();
    for id in woken {
      if let Some(entry) = tasks.get_mut(&id) {
        if entry.state.is_suspended() {
          entry.state = TaskState::Pending;
          ready.push_back(id);
          trace!(task_id = %id, "Task made ready.");
        }
      }
    }
  }

  fn pop_ready(&self) -> Option<TaskId> {
    self.ready.borrow_mut().pop_front()
  }

  fn suspended_count(&self) -> usize {
    self.tasks.borrow().values().filter(|entry| entry.state.is_suspended()).count()
  }

  /// Resumes one task until it finishes or suspends again.
  fn poll_task(&self, id: TaskId) {
    let (mut future, waker) = {
      let mut tasks = self.tasks.borrow_mut();
      let entry = match tasks.get_mut(&id) {
        Some(entry) => entry,
        None => return,
      };
      let future = match entry.future.take() {
        Some(future) => future,
        None => return,
      };
      entry.state = TaskState::Running;
      (future, entry.waker.clone())
    };

    self.current_task.set(Some(id));
    self.suspension.set(None);
    let mut cx = Context::from_waker(&waker);
    let poll = future.as_mut().poll(&mut cx);
    self.current_task.set(None);

    match poll {
      Poll::Ready(terminal) => {
        let removed = {
          let mut tasks = self.tasks.borrow_mut();
          let detached = match tasks.get_mut(&id) {
            Some(entry) => {
              entry.state = terminal;
              entry.detached
            }
            None => false,
          };
          if detached {
            tasks.remove(&id)
          } else {
            None
          }
        };
        trace!(task_id = %id, state = ?terminal, "Task reached a terminal state.");
        drop(removed);
        drop(future);
      }
      Poll::Pending => {
        let suspension = self.suspension.take().unwrap_or(Suspension::Future);
        if let Some(entry) = self.tasks.borrow_mut().get_mut(&id) {
          entry.future = Some(future);
          entry.state = suspension.into_state();
        }
        if suspension == Suspension::Yield {
          self.ready.borrow_mut().push_back(id);
        }
        trace!(task_id = %id, ?suspension, "Task suspended.");
      }
    }
  }

  /// Drops everything the run still owns. Futures are dropped outside of any
  /// table borrow because their destructors may call back into the core.
  fn teardown(&self) {
    let abandoned: Vec<_> = {
      let mut tasks = self.tasks.borrow_mut();
      tasks.values_mut().filter_map(|entry| entry.future.take()).collect()
    };
    if !abandoned.is_empty() {
      debug!("Dropping {} unfinished task(s) at the end of the run.", abandoned.len());
    }
    drop(abandoned);

    let entries: Vec<_> = self.tasks.borrow_mut().drain().collect();
    drop(entries);
    let timers = std::mem::take(&mut *self.timers.borrow_mut());
    drop(timers);
    self.ready.borrow_mut().clear();
    self.shared.take_woken();
  }
}

/// Entry point of the cooperative regime.
///
/// Each call to [`Runtime::run`] builds a fresh, isolated scheduler on the
/// calling thread, drives the root future to completion and tears everything
/// down again. Tasks still pending when the root finishes are dropped.
#[derive(Debug, Clone, Default)]
pub struct Runtime {
  config: RuntimeConfig,
}

impl Runtime {
  pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
    config.validate()?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  /// Runs `root` as the initial task and returns its result.
  ///
  /// # Errors
  /// Returns `RuntimeError::AlreadyRunning` if this thread is already driving a run.
  /// Returns `RuntimeError::Starvation` if the root can never be woken again.
  /// Returns `RuntimeError::Stalled` if the configured stall timeout expires.
  /// Otherwise returns whatever the root task returned or failed with.
  pub fn run<F, T>(&self, root: F) -> Result<T, RuntimeError>
  where
    F: Future<Output = Result<T, RuntimeError>> + 'static,
    T: 'static,
  {
    let core = Rc::new(Core::new(self.config.clone()));
    let _enter = context::enter(core.clone())?;

    let span = info_span!("hybrid_loop_run", name = %self.config.name);
    let _span_guard = span.enter();
    info!("Run started.");

    let mut root_handle = core.spawn_task(root);
    let result = self.drive(&core, &mut root_handle);
    drop(root_handle);
    core.teardown();

    match &result {
      Ok(_) => info!("Run finished."),
      Err(e) => info!("Run finished with error: {}", e),
    }
    result
  }

  fn drive<T>(&self, core: &Core, root: &mut JoinHandle<T>) -> Result<T, RuntimeError> {
    let mut last_progress = core.now();

    loop {
      let now = core.now();
      core.fire_expired_timers(now);
      core.drain_woken();

      if let Some(id) = core.pop_ready() {
        core.poll_task(id);
        if let Some(outcome) = root.take_outcome() {
          return outcome;
        }
        last_progress = core.now();
        continue;
      }

      let next_deadline = core.next_timer_deadline();
      let outstanding = core.shared.outstanding_jobs();

      if next_deadline.is_none() && outstanding == 0 {
        // A job may have posted its wake-up after the drain above.
        if core.shared.has_woken() {
          continue;
        }
        let suspended = core.suspended_count();
        warn!(suspended, "No ready tasks, timers or outstanding jobs remain.");
        return Err(RuntimeError::Starvation { suspended });
      }

      let mut timeout = next_deadline.map(|deadline| deadline.saturating_duration_since(now));
      if next_deadline.is_none() {
        if let Some(stall_timeout) = self.config.stall_timeout {
          let waited = now.saturating_duration_since(last_progress);
          if waited >= stall_timeout {
            warn!(outstanding_jobs = outstanding, "Run stalled waiting on pool jobs.");
            return Err(RuntimeError::Stalled {
              waited,
              outstanding_jobs: outstanding,
            });
          }
          timeout = Some(stall_timeout - waited);
        }
      }

      trace!(?timeout, outstanding_jobs = outstanding, "Parking loop thread.");
      core.shared.park(timeout, outstanding);
    }
  }
}

/// Runs `root` on a fresh scheduler with the default configuration.
pub fn run<F, T>(root: F) -> Result<T, RuntimeError>
where
  F: Future<Output = Result<T, RuntimeError>> + 'static,
  T: 'static,
{
  Runtime::default().run(root)
}

/// Spawns a task on the running scheduler. The caller is not suspended.
///
/// # Panics
/// Panics when called outside of a run.
#[track_caller]
pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
  F: Future<Output = Result<T, RuntimeError>> + 'static,
  T: 'static,
{
  context::expect_current("spawn").spawn_task(future)
}

/// The task currently being polled, if called from inside a task body.
pub fn current_task() -> Option<TaskId> {
  context::try_current().and_then(|core| core.current_task())
}

/// The running scheduler's clock. Readings never go backwards within one run.
///
/// # Panics
/// Panics when called outside of a run.
#[track_caller]
pub fn now() -> Instant {
  context::expect_current("now").now()
}

/// State of a task in the running scheduler's table. `None` outside of a run
/// or once the task has been removed.
pub fn task_state(id: TaskId) -> Option<TaskState> {
  context::try_current().and_then(|core| core.task_state(id))
}
