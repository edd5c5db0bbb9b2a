use std::collections::VecDeque;
use std::fmt;

use parking_lot::{Condvar, Mutex};

struct QueueState<J> {
  jobs: VecDeque<J>,
  closed: bool,
}

/// Unbounded FIFO job queue shared by all workers of a pool.
///
/// Jobs are handed out in submission order. Once closed the queue refuses new
/// jobs; workers keep draining whatever is left unless the close discarded it.
pub(crate) struct JobQueue<J> {
  state: Mutex<QueueState<J>>,
  available: Condvar,
}

impl<J> JobQueue<J> {
  pub(crate) fn new() -> Self {
    Self {
      state: Mutex::new(QueueState {
        jobs: VecDeque::new(),
        closed: false,
      }),
      available: Condvar::new(),
    }
  }

  /// Appends a job. Hands the job back if the queue has been closed.
  pub(crate) fn push(&self, job: J) -> Result<(), J> {
    let mut state = self.state.lock();
    if state.closed {
      return Err(job);
    }
    state.jobs.push_back(job);
    drop(state);
    self.available.notify_one();
    Ok(())
  }

  /// Blocks until a job is available. Returns `None` once the queue is closed
  /// and empty, which tells the worker to exit.
  pub(crate) fn pop_blocking(&self) -> Option<J> {
    let mut state = self.state.lock();
    loop {
      if let Some(job) = state.jobs.pop_front() {
        return Some(job);
      }
      if state.closed {
        return None;
      }
      self.available.wait(&mut state);
    }
  }

  /// Closes the queue. With `drain` the queued jobs stay for the workers;
  /// otherwise they are removed and returned so the caller drops them outside
  /// the lock.
  pub(crate) fn close(&self, drain: bool) -> Vec<J> {
    let mut state = self.state.lock();
    state.closed = true;
    let discarded = if drain {
      Vec::new()
    } else {
      state.jobs.drain(..).collect()
    };
    drop(state);
    self.available.notify_all();
    discarded
  }

  pub(crate) fn len(&self) -> usize {
    self.state.lock().jobs.len()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.state.lock().closed
  }
}

impl<J> fmt::Debug for JobQueue<J> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("JobQueue")
      .field("queued", &state.jobs.len())
      .field("closed", &state.closed)
      .finish()
  }
}
