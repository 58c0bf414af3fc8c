use crate::error::PoolError;
use crate::manager::PoolShared;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

/// The type of callable that the pool executes. Arguments are captured by the
/// closure itself; the pool only ever sees a zero-argument callable.
pub(crate) type TaskToRun<R> = Box<dyn FnOnce() -> R + Send + 'static>;

/// Lifecycle of a task. Transitions are forward-only; no status is ever
/// revisited. `OnHold` and `Constructing` may be skipped entirely, and the
/// transition into `Running` is always a compare-and-swap so that exactly one
/// thread executes the callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Status {
  /// Being assembled by the submitting thread; never observable through a
  /// returned future.
  Constructing = 0,
  /// Waiting for one or more prerequisite futures to become `Ready`.
  OnHold = 1,
  /// Sitting in the work queue, eligible to be claimed by any thread.
  Enqueued = 2,
  /// Claimed; the callable is executing on exactly one thread.
  Running = 3,
  /// The result slot is populated. Terminal.
  Ready = 4,
}

impl Status {
  fn from_u8(raw: u8) -> Status {
    match raw {
      0 => Status::Constructing,
      1 => Status::OnHold,
      2 => Status::Enqueued,
      3 => Status::Running,
      _ => Status::Ready,
    }
  }
}

/// State guarded by a future's private mutex: the wakeup flag for blocked
/// waiters and the list of invokers waiting on this future.
struct FutureSync {
  done: bool,
  dependents: Vec<Weak<dyn Invoker>>,
}

/// Bookkeeping shared by every holder of a task's future: the submitter's
/// handle, dependents of the task, and the work queue itself.
///
/// Each future carries its own mutex/condvar pair so that waiting on one
/// future never contends with unrelated futures. The dependents list is only
/// mutated under that lock; the status and counters are atomics.
pub(crate) struct FutureCore {
  sequence: u64,
  status: AtomicU8,
  remaining_prereqs: AtomicUsize,
  high_priority: AtomicBool,
  sync: Mutex<FutureSync>,
  cond: Condvar,
}

impl FutureCore {
  pub(crate) fn new(sequence: u64) -> Self {
    Self {
      sequence,
      status: AtomicU8::new(Status::Constructing as u8),
      remaining_prereqs: AtomicUsize::new(0),
      high_priority: AtomicBool::new(false),
      sync: Mutex::new(FutureSync {
        done: false,
        dependents: Vec::new(),
      }),
      cond: Condvar::new(),
    }
  }

  pub(crate) fn sequence(&self) -> u64 {
    self.sequence
  }

  pub(crate) fn status(&self) -> Status {
    Status::from_u8(self.status.load(AtomicOrdering::SeqCst))
  }

  pub(crate) fn store_status(&self, status: Status) {
    self.status.store(status as u8, AtomicOrdering::SeqCst);
  }

  /// Forward-only transition; returns `true` for the single thread that wins
  /// the exchange.
  pub(crate) fn try_transition(&self, from: Status, to: Status) -> bool {
    self
      .status
      .compare_exchange(from as u8, to as u8, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
      .is_ok()
  }

  pub(crate) fn mark_high_priority(&self) {
    self.high_priority.store(true, AtomicOrdering::SeqCst);
  }

  pub(crate) fn is_high_priority(&self) -> bool {
    self.high_priority.load(AtomicOrdering::SeqCst)
  }

  /// Seeds the prerequisite counter with the registration bias. The bias is
  /// removed by a final `resolve_prereq` once registration has finished, so
  /// the zero crossing cannot happen while priors are still being counted.
  pub(crate) fn begin_prereq_registration(&self) {
    self.remaining_prereqs.store(1, AtomicOrdering::SeqCst);
  }

  pub(crate) fn add_prereq(&self) {
    self.remaining_prereqs.fetch_add(1, AtomicOrdering::SeqCst);
  }

  /// Decrements the prerequisite counter; `true` exactly once, for whichever
  /// caller observes the zero crossing.
  pub(crate) fn resolve_prereq(&self) -> bool {
    self.remaining_prereqs.fetch_sub(1, AtomicOrdering::SeqCst) == 1
  }

  /// Adds a dependent to be resolved when this future completes. Returns
  /// `false` without registering if the future is already `Ready`; the
  /// caller then treats this prerequisite as satisfied.
  pub(crate) fn register_dependent(&self, dependent: &Arc<dyn Invoker>) -> bool {
    let mut sync = self.sync.lock();
    if self.status() == Status::Ready {
      return false;
    }
    sync.dependents.push(Arc::downgrade(dependent));
    true
  }

  /// Publishes `Ready`, wakes every blocked waiter and hands the drained
  /// dependents list back to the completing thread for resolution.
  ///
  /// `Ready` is stored before the lock is taken, so a registrant holding the
  /// lock either sees `Ready` (and skips registration) or gets its entry
  /// drained here.
  pub(crate) fn complete(&self) -> Vec<Weak<dyn Invoker>> {
    self.store_status(Status::Ready);
    let dependents = {
      let mut sync = self.sync.lock();
      sync.done = true;
      std::mem::take(&mut sync.dependents)
    };
    self.cond.notify_all();
    dependents
  }

  /// Blocks until the future is `Ready`. Fast path: no lock when the status
  /// is already terminal.
  pub(crate) fn wait(&self) {
    if self.status() == Status::Ready {
      return;
    }
    let mut sync = self.sync.lock();
    while !sync.done {
      self.cond.wait(&mut sync);
    }
  }
}

/// A task record as seen by the work queue and the dependency machinery,
/// erased over the callable's result type.
pub(crate) trait Invoker: Send + Sync {
  fn core(&self) -> &FutureCore;

  /// Executes the callable and completes the future. The caller must have
  /// won the `Running` transition.
  fn invoke(&self);

  /// Called once per completed prerequisite. The zero-crossing caller moves
  /// this invoker out of the on-hold registry and into the work queue, or
  /// runs it inline when it is marked high priority.
  fn on_prior_ready(self: Arc<Self>);

  /// Snapshot of the not-yet-cleared prerequisite futures, used by the
  /// run-if-not-started path to drive them to completion.
  fn priors(&self) -> Vec<Arc<dyn Invoker>>;
}

/// An invoker: the callable, its eventual result, the prerequisites it still
/// holds strongly, and the shared future bookkeeping.
pub(crate) struct InvokerCore<R: Send + 'static> {
  core: FutureCore,
  pool: Weak<PoolShared>,
  callable: Mutex<Option<TaskToRun<R>>>,
  result: Mutex<Option<Result<R, PoolError>>>,
  priors: Mutex<Vec<Arc<dyn Invoker>>>,
}

impl<R: Send + 'static> InvokerCore<R> {
  pub(crate) fn new(sequence: u64, pool: Weak<PoolShared>, callable: TaskToRun<R>) -> Self {
    Self {
      core: FutureCore::new(sequence),
      pool: Weak::clone(&pool),
      callable: Mutex::new(Some(callable)),
      result: Mutex::new(None),
      priors: Mutex::new(Vec::new()),
    }
  }

  pub(crate) fn set_priors(&self, priors: Vec<Arc<dyn Invoker>>) {
    *self.priors.lock() = priors;
  }

  pub(crate) fn pool(&self) -> Option<Arc<PoolShared>> {
    self.pool.upgrade()
  }

  /// Clones the stored outcome. Only valid once the future is `Ready`; the
  /// result slot is written before `Ready` is published.
  pub(crate) fn cloned_result(&self) -> Result<R, PoolError>
  where
    R: Clone,
  {
    self
      .result
      .lock()
      .as_ref()
      .cloned()
      .expect("result slot is populated before a future becomes ready")
  }
}

impl<R: Send + 'static> Invoker for InvokerCore<R> {
  fn core(&self) -> &FutureCore {
    &self.core
  }

  fn invoke(&self) {
    debug_assert_eq!(self.core.status(), Status::Running);
    // Strong references to priors are only needed while on hold; release
    // their results as soon as this task starts.
    self.priors.lock().clear();

    let callable = self.callable.lock().take();
    let Some(callable) = callable else {
      // Unreachable: the `Running` CAS admits exactly one claimant.
      error!(sequence = self.core.sequence(), "invoker claimed twice, callable already taken");
      return;
    };

    trace!(sequence = self.core.sequence(), "invoker running");
    let outcome = catch_unwind(AssertUnwindSafe(callable)).map_err(|payload| {
      warn!(
        sequence = self.core.sequence(),
        "callable panicked; recording the failure and keeping the worker alive"
      );
      PoolError::TaskPanicked(panic_message(payload.as_ref()))
    });
    *self.result.lock() = Some(outcome);

    let dependents = self.core.complete();
    trace!(
      sequence = self.core.sequence(),
      dependents = dependents.len(),
      "invoker ready"
    );
    for dependent in dependents {
      if let Some(dependent) = dependent.upgrade() {
        dependent.on_prior_ready();
      }
    }
  }

  fn on_prior_ready(self: Arc<Self>) {
    if !self.core.resolve_prereq() {
      return;
    }

    // Zero crossing: this thread owns the OnHold -> Enqueued/Running
    // transition. Drop the registry's strong reference first; the Arc in
    // hand keeps the invoker alive through the hand-off.
    let pool = self.pool.upgrade();
    if let Some(pool) = &pool {
      pool.release_hold(self.core.sequence());
    }
    let erased: Arc<dyn Invoker> = self.clone();

    if self.core.is_high_priority() && self.core.try_transition(Status::OnHold, Status::Running) {
      debug!(
        sequence = self.core.sequence(),
        "last prerequisite resolved; running high-priority dependent inline"
      );
      erased.invoke();
      return;
    }

    if self.core.try_transition(Status::OnHold, Status::Enqueued) {
      match pool {
        Some(pool) => {
          debug!(sequence = self.core.sequence(), "last prerequisite resolved; enqueueing dependent");
          pool.enqueue(erased);
        }
        None => {
          // The pool is gone but the task was promised to run. Claim it and
          // run it here rather than lose it.
          if self.core.try_transition(Status::Enqueued, Status::Running) {
            warn!(
              sequence = self.core.sequence(),
              "pool released before dependent resolved; running it on the resolving thread"
            );
            erased.invoke();
          }
        }
      }
    } else {
      // Only the zero-crossing owner transitions out of OnHold; any other
      // status here is a lifecycle bug.
      error!(
        sequence = self.core.sequence(),
        status = ?self.core.status(),
        "dependent was not on hold at its zero crossing"
      );
    }
  }

  fn priors(&self) -> Vec<Arc<dyn Invoker>> {
    self.priors.lock().clone()
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
