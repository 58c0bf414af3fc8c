use crate::controller::{ControlCommand, Controller};
use crate::future::{AnyTaskFuture, TaskFuture};
use crate::invoker::{Invoker, InvokerCore, Status};
use crate::work_queue::{Directive, WorkQueue};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_SUBMISSION_SEQUENCE: AtomicU64 = AtomicU64::new(0);
}

/// Process-wide submission counter; FIFO order among equal-priority tasks
/// follows this sequence.
fn next_sequence() -> u64 {
  NEXT_SUBMISSION_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Identity of one logical worker slot. The slot index is read by the owning
/// thread to decide whether a shrink removed it, and rewritten by the resize
/// logic when logical slots are swapped.
pub(crate) struct WorkerState {
  slot: AtomicUsize,
}

struct WorkerSlot {
  state: Arc<WorkerState>,
  join: Option<JoinHandle<()>>,
}

/// Pool internals shared by the manager, the worker threads and every
/// invoker (the latter through a `Weak`, so futures never keep a dead pool
/// alive).
pub(crate) struct PoolShared {
  name: Arc<String>,
  queue: WorkQueue,
  /// Strong ownership of invokers that are waiting on prerequisites and
  /// therefore in no queue; keyed by sequence. Guarantees a dependent whose
  /// public future was dropped still runs exactly once.
  on_hold: DashMap<u64, Arc<dyn Invoker>>,
  /// Thread-id -> worker-slot map; touched on resize, shutdown and the
  /// is-this-a-worker check, never on the hot execution path.
  thread_slots: DashMap<ThreadId, Arc<WorkerState>>,
  workers: Mutex<Vec<WorkerSlot>>,
  /// Thread count workers compare their slot against; slots at or above it
  /// terminate after their current invoker.
  target_threads: AtomicUsize,
  /// What `get_thread_count` reports: the allocated count, eventually
  /// consistent during an in-flight resize.
  allocated_threads: AtomicUsize,
  destroying: AtomicBool,
  controller: Controller,
}

impl PoolShared {
  /// Appends a runnable invoker to the work queue and wakes one idle worker.
  pub(crate) fn enqueue(&self, invoker: Arc<dyn Invoker>) {
    self.queue.push(invoker);
  }

  pub(crate) fn hold(&self, sequence: u64, invoker: Arc<dyn Invoker>) {
    self.on_hold.insert(sequence, invoker);
  }

  pub(crate) fn release_hold(&self, sequence: u64) {
    self.on_hold.remove(&sequence);
  }

  /// Whether the calling thread is one of this pool's workers. Gates the
  /// recursive run-if-not-started path in `TaskFuture::result`.
  pub(crate) fn is_pool_thread(&self) -> bool {
    self.thread_slots.contains_key(&thread::current().id())
  }

  fn apply(this: &Arc<Self>, command: ControlCommand) {
    match command {
      ControlCommand::SetThreadCount(thread_count) => Self::resize(this, thread_count),
    }
  }

  fn resize(this: &Arc<Self>, target: usize) {
    let mut workers = this.workers.lock();
    // Checked under the workers lock so a resize racing destruction either
    // fully precedes the shutdown barrier or is ignored.
    if this.destroying.load(AtomicOrdering::SeqCst) {
      warn!(pool_name = %*this.name, target, "ignoring thread count change during shutdown");
      return;
    }
    this.allocated_threads.store(target, AtomicOrdering::SeqCst);
    let current = workers.len();
    if target > current {
      info!(pool_name = %*this.name, from = current, to = target, "growing worker pool");
      this.target_threads.store(target, AtomicOrdering::SeqCst);
      for slot in current..target {
        let worker = Self::spawn_worker(this, slot);
        workers.push(worker);
      }
      return;
    }
    if target == current {
      return;
    }

    info!(pool_name = %*this.name, from = current, to = target, "shrinking worker pool");
    // The command may be applied by a worker of this very pool (a task called
    // set_thread_count). Such a thread must never join itself: if its slot is
    // being removed, swap logical slots with slot 0 so it survives the
    // shrink, or detach its handle when the shrink leaves no slot to swap to.
    if let Some(me) = this.thread_slots.get(&thread::current().id()).map(|entry| Arc::clone(entry.value())) {
      let my_slot = me.slot.load(AtomicOrdering::SeqCst);
      // Slot indexes and the workers vec length only change under the
      // controller's processing token, so a driving worker's slot is in
      // range.
      debug_assert!(my_slot < current);
      if my_slot >= target {
        if target > 0 {
          debug!(pool_name = %*this.name, my_slot, "resize driven by a doomed worker; swapping logical slots with slot 0");
          let keeper = Arc::clone(&workers[0].state);
          keeper.slot.store(my_slot, AtomicOrdering::SeqCst);
          me.slot.store(0, AtomicOrdering::SeqCst);
          workers.swap(0, my_slot);
        } else {
          debug!(pool_name = %*this.name, my_slot, "shrink to zero driven by a worker; detaching its own handle");
          workers[my_slot].join = None;
        }
      }
    }

    this.target_threads.store(target, AtomicOrdering::SeqCst);
    this.queue.wake_all();
    let doomed: Vec<WorkerSlot> = workers.drain(target..).collect();
    drop(workers);
    Self::join_slots(this, doomed);
  }

  fn spawn_worker(this: &Arc<Self>, slot: usize) -> WorkerSlot {
    let state = Arc::new(WorkerState {
      slot: AtomicUsize::new(slot),
    });
    let pool = Arc::clone(this);
    let thread_state = Arc::clone(&state);
    let join = thread::Builder::new()
      .name(format!("{}-worker-{}", this.name, slot))
      .spawn(move || Self::worker_loop(pool, thread_state))
      .expect("failed to spawn worker thread");
    WorkerSlot {
      state,
      join: Some(join),
    }
  }

  fn worker_loop(pool: Arc<PoolShared>, state: Arc<WorkerState>) {
    pool.thread_slots.insert(thread::current().id(), Arc::clone(&state));
    info!(pool_name = %*pool.name, slot = state.slot.load(AtomicOrdering::SeqCst), "worker started");

    loop {
      let next = pool.queue.dequeue(|| {
        if state.slot.load(AtomicOrdering::SeqCst) >= pool.target_threads.load(AtomicOrdering::SeqCst) {
          Directive::Terminate
        } else if pool.destroying.load(AtomicOrdering::SeqCst) {
          Directive::Drain
        } else {
          Directive::Work
        }
      });
      let Some(invoker) = next else {
        break;
      };

      // The claim happens outside the queue mutex; losing it means some
      // thread ran this invoker inline and the popped entry was a tombstone.
      if invoker.core().try_transition(Status::Enqueued, Status::Running) {
        trace!(
          pool_name = %*pool.name,
          sequence = invoker.core().sequence(),
          "worker picked up invoker"
        );
        invoker.invoke();
      }
    }

    pool.thread_slots.remove(&thread::current().id());
    info!(pool_name = %*pool.name, slot = state.slot.load(AtomicOrdering::SeqCst), "worker terminated");
  }

  /// Barrier used when shrinking and on destruction: joins every worker slot
  /// at or above `start`, blocking until each has terminated.
  fn sync(this: &Arc<Self>, start: usize) {
    let doomed: Vec<WorkerSlot> = {
      let mut workers = this.workers.lock();
      if start >= workers.len() {
        Vec::new()
      } else {
        workers.drain(start..).collect()
      }
    };
    Self::join_slots(this, doomed);
  }

  fn join_slots(this: &Arc<Self>, slots: Vec<WorkerSlot>) {
    for mut slot in slots {
      if let Some(join) = slot.join.take() {
        if join.join().is_err() {
          // Callable panics are caught inside invoke; a panicking worker
          // thread indicates a bug in the pool itself.
          error!(pool_name = %*this.name, "worker thread panicked outside an invoker");
        }
      }
    }
  }

  /// Runs every remaining queue entry on the calling thread. This is the
  /// entire execution path for a zero-thread pool and the last line of
  /// defense during shutdown.
  fn drain_inline(&self) {
    while let Some(invoker) = self.queue.try_pop() {
      if invoker.core().try_transition(Status::Enqueued, Status::Running) {
        debug!(
          pool_name = %*self.name,
          sequence = invoker.core().sequence(),
          "running leftover invoker on the dropping thread"
        );
        invoker.invoke();
      }
    }
  }
}

/// A pool of worker threads executing submitted callables, with shared
/// futures, inter-task dependencies and dynamic resizing.
///
/// The manager is an explicitly owned object: create once, share by
/// reference (or `Arc`), drop once. Dropping it drains all remaining work
/// (every future ever returned is `Ready` before `drop` returns), so
/// submitting to a destroyed pool is not expressible.
pub struct ThreadPoolManager {
  shared: Arc<PoolShared>,
}

impl ThreadPoolManager {
  /// Creates a pool with `thread_count` worker threads. A count of zero is
  /// valid: all work then runs inline on threads that wait on its futures,
  /// or on the dropping thread.
  pub fn new(thread_count: usize, pool_name: &str) -> Self {
    let shared = Arc::new(PoolShared {
      name: Arc::new(pool_name.to_string()),
      queue: WorkQueue::new(),
      on_hold: DashMap::new(),
      thread_slots: DashMap::new(),
      workers: Mutex::new(Vec::new()),
      target_threads: AtomicUsize::new(thread_count),
      allocated_threads: AtomicUsize::new(thread_count),
      destroying: AtomicBool::new(false),
      controller: Controller::new(),
    });

    {
      let mut workers = shared.workers.lock();
      for slot in 0..thread_count {
        let worker = PoolShared::spawn_worker(&shared, slot);
        workers.push(worker);
      }
    }

    info!(pool_name, thread_count, "thread pool started");
    Self { shared }
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  /// Number of invokers sitting in the work queue (tombstones included
  /// until a dequeue discards them).
  pub fn queued_task_count(&self) -> usize {
    self.shared.queue.len()
  }

  /// Submits a callable with no prerequisites. The invoker is enqueued
  /// immediately and one idle worker is woken; the call returns at once.
  pub fn submit<F, R>(&self, callable: F) -> TaskFuture<R>
  where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
  {
    let sequence = next_sequence();
    let invoker = Arc::new(InvokerCore::new(
      sequence,
      Arc::downgrade(&self.shared),
      Box::new(callable),
    ));
    invoker.core().store_status(Status::Enqueued);
    debug!(pool_name = %*self.shared.name, sequence, "submitting task");
    self.shared.enqueue(invoker.clone());
    TaskFuture::new(invoker)
  }

  /// Submits a callable that must not run before every prior future is
  /// `Ready`. Priors that already resolved count as satisfied at submission
  /// time; with no pending prior this behaves exactly like [`submit`].
  ///
  /// Priors may come from futures of different result types (and even from a
  /// different pool); erase them with [`TaskFuture::as_any`].
  ///
  /// [`submit`]: Self::submit
  pub fn submit_dependent<I, F, R>(&self, priors: I, callable: F) -> TaskFuture<R>
  where
    I: IntoIterator<Item = AnyTaskFuture>,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
  {
    let sequence = next_sequence();
    let invoker = Arc::new(InvokerCore::new(
      sequence,
      Arc::downgrade(&self.shared),
      Box::new(callable),
    ));
    let erased: Arc<dyn Invoker> = invoker.clone();
    let priors: Vec<Arc<dyn Invoker>> = priors.into_iter().map(|prior| prior.erased()).collect();

    // The +1 bias keeps the counter from crossing zero while priors are
    // still being registered; the on_prior_ready below removes it and
    // performs the enqueue itself when nothing is pending.
    invoker.core().begin_prereq_registration();
    invoker.core().store_status(Status::OnHold);
    invoker.set_priors(priors.clone());
    self.shared.hold(sequence, erased.clone());

    let mut pending = 0usize;
    for prior in &priors {
      if prior.core().register_dependent(&erased) {
        invoker.core().add_prereq();
        pending += 1;
      }
    }
    debug!(
      pool_name = %*self.shared.name,
      sequence,
      priors = priors.len(),
      pending,
      "submitting dependent task"
    );
    invoker.clone().on_prior_ready();
    TaskFuture::new(invoker)
  }

  /// Requests a new worker thread count. The request is queued on the
  /// control channel and applied by a single serialized path, in submission
  /// order, never interleaved with another administrative command. Shrinking
  /// lets removed workers finish their current invoker first; remaining
  /// queued work is unaffected.
  pub fn set_thread_count(&self, thread_count: usize) {
    debug!(pool_name = %*self.shared.name, thread_count, "queueing thread count change");
    self.shared.controller.push(ControlCommand::SetThreadCount(thread_count));
    let shared = Arc::clone(&self.shared);
    self
      .shared
      .controller
      .pump(move |command| PoolShared::apply(&shared, command));
  }

  /// The allocated worker thread count. Eventually consistent: during an
  /// in-flight resize this may be stale, which is documented behavior rather
  /// than an error.
  pub fn get_thread_count(&self) -> usize {
    self.shared.allocated_threads.load(AtomicOrdering::SeqCst)
  }
}

impl Drop for ThreadPoolManager {
  fn drop(&mut self) {
    let shared = &self.shared;
    info!(pool_name = %*shared.name, "shutting down; remaining work will be drained, not cancelled");

    // Flush administrative commands queued before destruction began.
    {
      let pump_target = Arc::clone(shared);
      shared
        .controller
        .pump(move |command| PoolShared::apply(&pump_target, command));
    }

    shared.destroying.store(true, AtomicOrdering::SeqCst);
    shared.queue.wake_all();
    PoolShared::sync(shared, 0);
    shared.drain_inline();

    if !shared.on_hold.is_empty() {
      // Every on-hold invoker has a prerequisite in the queue or running,
      // and the drain above runs them all; leftovers indicate a bug.
      warn!(
        pool_name = %*shared.name,
        held = shared.on_hold.len(),
        "on-hold invokers survived shutdown"
      );
    }
    info!(pool_name = %*shared.name, "thread pool stopped");
  }
}
