use crate::context;
use crate::error::RuntimeError;
use crate::scheduler::TimerKey;
use crate::task::Suspension;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Future returned by [`sleep`].
#[derive(Debug)]
pub struct Sleep {
  duration: Duration,
  timer: Option<TimerKey>,
  done: bool,
}

/// Suspends the calling task for at least `duration`.
///
/// The deadline is taken when the future is first polled. Tasks whose
/// deadlines are equal resume in the order they went to sleep, and a zero
/// duration still yields once to the rest of the ready queue. A duration too
/// large to represent as a deadline sleeps forever.
pub fn sleep(duration: Duration) -> Sleep {
  Sleep {
    duration,
    timer: None,
    done: false,
  }
}

impl Future for Sleep {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    if self.done {
      return Poll::Ready(());
    }
    let core = context::expect_current("sleep");
    let now = core.now();

    match self.timer {
      // A deadline past the end of `Instant` never fires and is not registered.
      None => {
        if let Some(deadline) = now.checked_add(self.duration) {
          self.timer = Some(core.register_timer(deadline, cx.waker().clone()));
        }
      }
      Some(key) if now >= key.deadline => {
        core.cancel_timer(key);
        self.timer = None;
        self.done = true;
        return Poll::Ready(());
      }
      Some(key) => core.refresh_timer(key, cx.waker()),
    }

    core.note_suspension(Suspension::Timer);
    Poll::Pending
  }
}

impl Drop for Sleep {
  fn drop(&mut self) {
    if let Some(key) = self.timer.take() {
      if let Some(core) = context::try_current() {
        core.cancel_timer(key);
      }
    }
  }
}

/// Future returned by [`yield_now`].
#[derive(Debug, Default)]
pub struct YieldNow {
  yielded: bool,
}

/// Moves the calling task to the back of the ready queue.
pub fn yield_now() -> YieldNow {
  YieldNow::default()
}

impl Future for YieldNow {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    if self.yielded {
      return Poll::Ready(());
    }
    self.yielded = true;
    match context::try_current() {
      Some(core) => core.note_suspension(Suspension::Yield),
      None => cx.waker().wake_by_ref(),
    }
    Poll::Pending
  }
}

/// Future returned by [`timeout`].
pub struct Timeout<F> {
  future: Pin<Box<F>>,
  sleep: Sleep,
  duration: Duration,
}

/// Races `future` against a timer.
///
/// When the timer wins, `future` is dropped and the result is
/// `RuntimeError::TimedOut`. Pass a [`JoinHandle`](crate::JoinHandle) to keep
/// the underlying work running detached after the deadline.
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
  Timeout {
    future: Box::pin(future),
    sleep: sleep(duration),
    duration,
  }
}

impl<F: Future> Future for Timeout<F> {
  type Output = Result<F::Output, RuntimeError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if let Poll::Ready(value) = self.future.as_mut().poll(cx) {
      return Poll::Ready(Ok(value));
    }
    let duration = self.duration;
    match Pin::new(&mut self.sleep).poll(cx) {
      Poll::Ready(()) => Poll::Ready(Err(RuntimeError::TimedOut(duration))),
      Poll::Pending => Poll::Pending,
    }
  }
}
