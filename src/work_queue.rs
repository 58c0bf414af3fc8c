use crate::invoker::{Invoker, Status};

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// What a worker should do next, decided by the pool each time the worker is
/// about to pick work or go idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
  /// Keep serving the queue; block when it is empty.
  Work,
  /// The pool is shutting down: keep serving until the queue is empty, then
  /// stop instead of blocking.
  Drain,
  /// This worker's slot was removed by a shrink: stop after the current
  /// invoker, even if work remains for the surviving workers.
  Terminate,
}

/// The ordered, mutex-protected sequence of pending invokers shared by all
/// worker threads, with its companion condition variable.
///
/// Entries are appended in submission order and popped from the front. An
/// entry whose status has already left `Enqueued` is a tombstone: some thread
/// claimed the invoker inline (via the run-if-not-started path) and the queue
/// merely discards the leftover placeholder.
pub(crate) struct WorkQueue {
  pending: Mutex<VecDeque<Arc<dyn Invoker>>>,
  cond: Condvar,
}

impl WorkQueue {
  pub(crate) fn new() -> Self {
    Self {
      pending: Mutex::new(VecDeque::new()),
      cond: Condvar::new(),
    }
  }

  /// Appends an invoker and wakes one idle worker.
  pub(crate) fn push(&self, invoker: Arc<dyn Invoker>) {
    {
      let mut pending = self.pending.lock();
      pending.push_back(invoker);
    }
    self.cond.notify_one();
  }

  /// Wakes every idle worker. Used after publishing a flag the workers'
  /// directive reads (shutdown, new thread-count target); the empty critical
  /// section orders the flag store before any waiter's re-check.
  pub(crate) fn wake_all(&self) {
    drop(self.pending.lock());
    self.cond.notify_all();
  }

  pub(crate) fn len(&self) -> usize {
    self.pending.lock().len()
  }

  /// Blocking dequeue driven by `directive`, which is evaluated under the
  /// queue mutex and must only read atomics.
  ///
  /// Returns the front pending invoker, or `None` when the directive ends
  /// the worker's service. The returned invoker is *not* yet claimed; the
  /// caller performs the `Enqueued -> Running` exchange outside the queue
  /// mutex.
  pub(crate) fn dequeue(&self, mut directive: impl FnMut() -> Directive) -> Option<Arc<dyn Invoker>> {
    let mut pending = self.pending.lock();
    loop {
      let current = directive();
      if current == Directive::Terminate {
        return None;
      }
      Self::discard_consumed(&mut pending);
      if let Some(invoker) = pending.pop_front() {
        return Some(invoker);
      }
      if current == Directive::Drain {
        return None;
      }
      self.cond.wait(&mut pending);
    }
  }

  /// Non-blocking variant used when draining leftovers on the dropping
  /// thread.
  pub(crate) fn try_pop(&self) -> Option<Arc<dyn Invoker>> {
    let mut pending = self.pending.lock();
    Self::discard_consumed(&mut pending);
    pending.pop_front()
  }

  fn discard_consumed(pending: &mut VecDeque<Arc<dyn Invoker>>) {
    while let Some(front) = pending.front() {
      if front.core().status() == Status::Enqueued {
        break;
      }
      trace!(
        sequence = front.core().sequence(),
        "discarding tombstone left by an inline run"
      );
      pending.pop_front();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::invoker::InvokerCore;
  use std::sync::Weak;

  fn enqueued_invoker(sequence: u64) -> Arc<dyn Invoker> {
    let invoker: Arc<InvokerCore<u64>> =
      Arc::new(InvokerCore::new(sequence, Weak::new(), Box::new(move || sequence)));
    invoker.core().store_status(Status::Enqueued);
    invoker
  }

  #[test]
  fn test_fifo_order() {
    let queue = WorkQueue::new();
    for sequence in 0..4 {
      queue.push(enqueued_invoker(sequence));
    }

    for expected in 0..4 {
      let invoker = queue.dequeue(|| Directive::Drain).unwrap();
      assert_eq!(invoker.core().sequence(), expected);
    }
    assert!(queue.dequeue(|| Directive::Drain).is_none());
  }

  #[test]
  fn test_leading_tombstones_are_discarded() {
    let queue = WorkQueue::new();
    let stolen = enqueued_invoker(0);
    queue.push(stolen.clone());
    queue.push(enqueued_invoker(1));

    // Simulate an inline run claiming the front entry.
    assert!(stolen.core().try_transition(Status::Enqueued, Status::Running));

    let invoker = queue.dequeue(|| Directive::Drain).unwrap();
    assert_eq!(invoker.core().sequence(), 1);
    assert_eq!(queue.len(), 0);
  }

  #[test]
  fn test_terminate_directive_leaves_work_behind() {
    let queue = WorkQueue::new();
    queue.push(enqueued_invoker(0));

    assert!(queue.dequeue(|| Directive::Terminate).is_none());
    assert_eq!(queue.len(), 1);
  }
}
