use crate::error::RuntimeError;
use crate::handle::JoinHandle;
use crate::promise::Wait;

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::{Context, Poll};

/// A future whose outcome carries the order in which it completed.
///
/// Implemented for task handles and for promise waits, so [`join_all`] accepts
/// `JoinHandle`s and `Promise`s alike.
pub trait Joinable {
  type Value;

  /// Polls for the outcome and its completion sequence number. Sequence
  /// numbers are only comparable between joinables of the same kind.
  fn poll_joined(&mut self, cx: &mut Context<'_>) -> Poll<(u64, Result<Self::Value, RuntimeError>)>;
}

impl<T> Joinable for JoinHandle<T> {
  type Value = T;

  fn poll_joined(&mut self, cx: &mut Context<'_>) -> Poll<(u64, Result<T, RuntimeError>)> {
    self.poll_outcome(cx)
  }
}

impl<T: Clone> Joinable for Wait<T> {
  type Value = T;

  fn poll_joined(&mut self, cx: &mut Context<'_>) -> Poll<(u64, Result<T, RuntimeError>)> {
    self.poll_outcome(cx)
  }
}

/// Future returned by [`join_all`].
pub struct JoinAll<J: Joinable> {
  pending: Vec<J>,
  outcomes: Vec<Option<(u64, Result<J::Value, RuntimeError>)>>,
}

impl<J: Joinable> Unpin for JoinAll<J> {}

/// Waits for every task handle or promise in `items` to complete.
///
/// Resolves to the values in argument order. If any item failed, resolves to
/// the failure that happened first in completion order instead; the other
/// items are never cancelled and still run to completion.
pub fn join_all<I>(items: I) -> JoinAll<<I::Item as IntoFuture>::IntoFuture>
where
  I: IntoIterator,
  I::Item: IntoFuture,
  <I::Item as IntoFuture>::IntoFuture: Joinable,
{
  let pending: Vec<_> = items.into_iter().map(IntoFuture::into_future).collect();
  let outcomes = pending.iter().map(|_| None).collect();
  JoinAll { pending, outcomes }
}

impl<J: Joinable> Future for JoinAll<J> {
  type Output = Result<Vec<J::Value>, RuntimeError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = &mut *self;
    let mut pending = false;
    for (item, outcome) in this.pending.iter_mut().zip(this.outcomes.iter_mut()) {
      if outcome.is_some() {
        continue;
      }
      match item.poll_joined(cx) {
        Poll::Ready(finished) => *outcome = Some(finished),
        Poll::Pending => pending = true,
      }
    }
    if pending {
      return Poll::Pending;
    }

    let mut values = Vec::with_capacity(this.outcomes.len());
    let mut first_failure: Option<(u64, RuntimeError)> = None;
    for (seq, outcome) in std::mem::take(&mut this.outcomes).into_iter().flatten() {
      match outcome {
        Ok(value) => values.push(value),
        Err(e) => {
          if first_failure.as_ref().map_or(true, |(first_seq, _)| seq < *first_seq) {
            first_failure = Some((seq, e));
          }
        }
      }
    }
    // Completed waits release their slots and outstanding counts now.
    this.pending.clear();

    match first_failure {
      Some((_, e)) => Poll::Ready(Err(e)),
      None => Poll::Ready(Ok(values)),
    }
  }
}
