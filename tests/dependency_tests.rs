use threads_orchestra::{wait_all, TaskFuture, ThreadPoolManager};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,threads_orchestra=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[test]
fn test_dependent_starts_after_prerequisite_completes() {
  setup_tracing_for_test();
  let pool = ThreadPoolManager::new(2, "test_deps_basic_chain");

  // Task A returns 1, deliberately slowly; B depends on A and returns
  // A's value + 1. B must never start before A's future is ready.
  let a = pool.submit(|| {
    std::thread::sleep(Duration::from_millis(50));
    1
  });
  let a_for_b = a.clone();
  let b = pool.submit_dependent([a.as_any()], move || {
    assert!(a_for_b.is_ready(), "dependent started before its prerequisite completed");
    a_for_b.get() + 1
  });

  assert_eq!(b.get(), 2);
}

#[test]
fn test_dependent_with_multiple_prerequisites() {
  setup_tracing_for_test();
  let pool = ThreadPoolManager::new(4, "test_deps_multi_prereq");

  let flags: Vec<_> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
  let priors: Vec<TaskFuture<usize>> = flags
    .iter()
    .cloned()
    .enumerate()
    .map(|(index, flag)| {
      pool.submit(move || {
        std::thread::sleep(Duration::from_millis(10 * (index as u64 + 1)));
        flag.store(true, Ordering::SeqCst);
        index + 1
      })
    })
    .collect();

  let prior_handles: Vec<_> = priors.iter().cloned().collect();
  let check_flags = flags.clone();
  let sum = pool.submit_dependent(priors.iter().map(|prior| prior.as_any()), move || {
    for flag in &check_flags {
      assert!(flag.load(Ordering::SeqCst), "a prerequisite had not completed");
    }
    prior_handles.iter().map(|prior| prior.get()).sum::<usize>()
  });

  assert_eq!(sum.get(), 6);
}

#[test]
fn test_dependent_on_already_ready_prerequisite_behaves_like_submit() {
  setup_tracing_for_test();
  let pool = ThreadPoolManager::new(2, "test_deps_ready_prereq");

  let a = pool.submit(|| 10);
  a.wait();

  let a_for_b = a.clone();
  let b = pool.submit_dependent([a.as_any()], move || a_for_b.get() * 2);
  assert_eq!(b.get(), 20);
}

#[test]
fn test_chain_of_dependents() {
  setup_tracing_for_test();
  let pool = ThreadPoolManager::new(2, "test_deps_chain");

  let mut tail: TaskFuture<u64> = pool.submit(|| 0);
  for _ in 0..32 {
    let previous = tail.clone();
    tail = pool.submit_dependent([tail.as_any()], move || previous.get() + 1);
  }

  assert_eq!(tail.get(), 32);
}

#[test]
fn test_diamond_dependency() {
  setup_tracing_for_test();
  let pool = ThreadPoolManager::new(4, "test_deps_diamond");

  let a = pool.submit(|| 1u64);
  let a_for_b = a.clone();
  let b = pool.submit_dependent([a.as_any()], move || a_for_b.get() + 10);
  let a_for_c = a.clone();
  let c = pool.submit_dependent([a.as_any()], move || a_for_c.get() + 100);

  let b_for_d = b.clone();
  let c_for_d = c.clone();
  let d = pool.submit_dependent([b.as_any(), c.as_any()], move || {
    assert!(b_for_d.is_ready() && c_for_d.is_ready());
    b_for_d.get() + c_for_d.get()
  });

  assert_eq!(d.get(), 112);
}

#[test]
fn test_wait_all_retires_enqueued_work_inline() {
  setup_tracing_for_test();
  // No workers at all: wait_all must claim and run everything on this
  // thread, including a dependent whose priors appear earlier in the
  // collection.
  let pool = ThreadPoolManager::new(0, "test_deps_wait_all_inline");

  let futures: Vec<TaskFuture<u64>> = (0..10).map(|value| pool.submit(move || value)).collect();
  let first = futures[0].clone();
  let dependent = pool.submit_dependent([futures[0].as_any()], move || first.get() + 40);

  let mut all = futures.iter().map(|future| future.as_any()).collect::<Vec<_>>();
  all.push(dependent.as_any());
  wait_all(all);

  assert!(futures.iter().all(|future| future.is_ready()));
  assert_eq!(dependent.get(), 40);
}

#[test]
fn test_get_steals_past_a_busy_worker() {
  setup_tracing_for_test();
  let pool = ThreadPoolManager::new(1, "test_deps_get_steals");

  // The only worker is busy; get() on the dependent must drive the
  // prerequisite and the dependent itself on the calling thread instead of
  // queueing up behind the blocker.
  let _blocker = pool.submit(|| std::thread::sleep(Duration::from_millis(100)));
  let a = pool.submit(|| 2);
  let a_for_b = a.clone();
  let b = pool.submit_dependent([a.as_any()], move || a_for_b.get() * 2);

  assert_eq!(b.get(), 4);
}

#[test]
fn test_dependent_on_a_future_from_another_pool() {
  setup_tracing_for_test();
  let upstream = ThreadPoolManager::new(1, "test_deps_upstream_pool");
  let downstream = ThreadPoolManager::new(1, "test_deps_downstream_pool");

  let parsed = upstream.submit(|| 5);
  let parsed_for_render = parsed.clone();
  let rendered = downstream.submit_dependent([parsed.as_any()], move || parsed_for_render.get() * 3);

  assert_eq!(rendered.get(), 15);
}

#[test]
fn test_dependent_registration_races_with_completion() {
  setup_tracing_for_test();
  let pool = ThreadPoolManager::new(4, "test_deps_registration_race");
  let mut rng = rand::rng();

  // The prerequisite finishes at a jittered moment while the dependent is
  // being registered; whichever side observes the zero crossing, the
  // dependent must run exactly once.
  for round in 0..100 {
    let calls = Arc::new(AtomicUsize::new(0));
    let delay = rng.random_range(0..50u64);
    let a = pool.submit(move || {
      if delay > 0 {
        std::thread::sleep(Duration::from_micros(delay));
      }
    });

    let calls_in_task = calls.clone();
    let b = pool.submit_dependent([a.as_any()], move || {
      calls_in_task.fetch_add(1, Ordering::SeqCst);
    });

    b.wait();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "round {}", round);
  }
}
