use crate::error::PoolError;
use crate::invoker::{Invoker, InvokerCore, Status};

use std::sync::Arc;
use std::thread;

use tracing::trace;

/// The externally visible handle to a task's eventual result.
///
/// Cloneable; every clone shares the same underlying state, and the pool's
/// queue and dependency machinery hold their own references, so a future may
/// be dropped freely without affecting the task.
pub struct TaskFuture<R: Send + 'static> {
  inner: Arc<InvokerCore<R>>,
}

impl<R: Send + 'static> Clone for TaskFuture<R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<R: Send + 'static> TaskFuture<R> {
  pub(crate) fn new(inner: Arc<InvokerCore<R>>) -> Self {
    Self { inner }
  }

  /// The task's submission sequence number, unique process-wide.
  pub fn sequence(&self) -> u64 {
    self.inner.core().sequence()
  }

  /// Non-blocking probe: `true` once the result slot is populated.
  pub fn is_ready(&self) -> bool {
    self.inner.core().status() == Status::Ready
  }

  /// Blocks until the task has completed. Returns immediately when the
  /// future is already ready; otherwise parks on the future's own condition
  /// variable, so waiting here never contends with unrelated futures.
  pub fn wait(&self) {
    self.inner.core().wait();
  }

  /// Waits for the result, running work inline instead of blocking when
  /// possible, and returns the task's outcome.
  ///
  /// If the invoker has not started yet and the calling thread is not one of
  /// the pool's workers, the calling thread executes it synchronously: an
  /// enqueued invoker is claimed right out of the queue, and an on-hold one
  /// is marked high priority while its prerequisites get the same treatment
  /// recursively. This is what makes a zero-thread pool (and a pool whose
  /// workers are all blocked on this very future's prerequisites) complete
  /// instead of deadlocking. An invoker already running elsewhere is simply
  /// waited for.
  pub fn result(&self) -> Result<R, PoolError>
  where
    R: Clone,
  {
    let core = self.inner.core();
    if core.status() != Status::Ready {
      let steal_allowed = self.inner.pool().map_or(true, |pool| !pool.is_pool_thread());
      if steal_allowed {
        let erased: Arc<dyn Invoker> = self.inner.clone();
        run_if_pending(&erased);
      }
      core.wait();
    }
    self.inner.cloned_result()
  }

  /// Like [`result`](Self::result), but unwraps the outcome.
  ///
  /// # Panics
  ///
  /// Panics with the recorded message if the callable panicked.
  pub fn get(&self) -> R
  where
    R: Clone,
  {
    match self.result() {
      Ok(value) => value,
      Err(error) => panic!("task {} failed: {}", self.sequence(), error),
    }
  }

  /// Erases the result type, for use as a prerequisite of
  /// [`submit_dependent`](crate::ThreadPoolManager::submit_dependent) or in
  /// [`wait_all`].
  pub fn as_any(&self) -> AnyTaskFuture {
    AnyTaskFuture {
      inner: self.inner.clone(),
    }
  }
}

impl<R: Send + 'static> From<&TaskFuture<R>> for AnyTaskFuture {
  fn from(future: &TaskFuture<R>) -> Self {
    future.as_any()
  }
}

/// A type-erased task future: completion and ordering without access to the
/// result value.
#[derive(Clone)]
pub struct AnyTaskFuture {
  inner: Arc<dyn Invoker>,
}

impl AnyTaskFuture {
  pub(crate) fn erased(&self) -> Arc<dyn Invoker> {
    Arc::clone(&self.inner)
  }

  pub fn sequence(&self) -> u64 {
    self.inner.core().sequence()
  }

  pub fn is_ready(&self) -> bool {
    self.inner.core().status() == Status::Ready
  }

  pub fn wait(&self) {
    self.inner.core().wait();
  }
}

/// Waits for every future in the collection.
///
/// A single pass first claims and runs, on the calling thread, any member
/// still sitting enqueued (once, not recursively per future); only then does
/// the call fall back to blocking waits for the remainder, so most of the
/// collection is retired without parking at all.
pub fn wait_all<I>(futures: I)
where
  I: IntoIterator<Item = AnyTaskFuture>,
{
  let futures: Vec<AnyTaskFuture> = futures.into_iter().collect();
  for future in &futures {
    let core = future.inner.core();
    if core.status() == Status::Enqueued && core.try_transition(Status::Enqueued, Status::Running) {
      trace!(sequence = core.sequence(), "wait_all running enqueued invoker inline");
      future.inner.invoke();
    }
  }
  for future in &futures {
    future.inner.core().wait();
  }
}

/// Drives a not-yet-started invoker to completion on the calling thread.
///
/// `Enqueued` is claimed by CAS and executed here, leaving a tombstone in the
/// work queue. `OnHold` is marked high priority, its prerequisites are driven
/// the same way, and whichever thread completes the last prerequisite then
/// runs the invoker inline. `Running` and `Ready` need no help.
pub(crate) fn run_if_pending(invoker: &Arc<dyn Invoker>) {
  loop {
    match invoker.core().status() {
      Status::Ready | Status::Running => return,
      Status::Enqueued => {
        if invoker.core().try_transition(Status::Enqueued, Status::Running) {
          trace!(sequence = invoker.core().sequence(), "claimed enqueued invoker for an inline run");
          invoker.invoke();
        }
        return;
      }
      Status::OnHold => {
        invoker.core().mark_high_priority();
        let priors = invoker.priors();
        if priors.is_empty() {
          // The zero crossing is in flight on another thread; the status is
          // about to move.
          thread::yield_now();
          continue;
        }
        for prior in &priors {
          run_if_pending(prior);
        }
        for prior in &priors {
          prior.core().wait();
        }
        // Every prior is ready, so the zero crossing has fired: this invoker
        // was run inline (possibly by this very thread) or enqueued. Loop to
        // pick up the new status.
        thread::yield_now();
      }
      Status::Constructing => {
        // Submission on another thread has not published the status yet.
        thread::yield_now();
      }
    }
  }
}
