use std::time::Duration;

use threads_orchestra::{wait_all, ThreadPoolManager};
use tracing::info;

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Dependent Tasks Example ---");

  let pool = ThreadPoolManager::new(4, "deps_pool");

  // Two independent "load" stages followed by a "combine" stage that must
  // not start before both loads are done.
  let left = pool.submit(|| {
    std::thread::sleep(Duration::from_millis(300));
    info!("left operand loaded");
    20
  });
  let right = pool.submit(|| {
    std::thread::sleep(Duration::from_millis(150));
    info!("right operand loaded");
    22
  });

  let left_for_sum = left.clone();
  let right_for_sum = right.clone();
  let sum = pool.submit_dependent([left.as_any(), right.as_any()], move || {
    let total = left_for_sum.get() + right_for_sum.get();
    info!("combine stage ran with both operands ready: {}", total);
    total
  });

  info!("Answer: {}", sum.get());

  // wait_all retires any still-enqueued members on this thread.
  let batch: Vec<_> = (0..4u64)
    .map(|i| {
      pool.submit(move || {
        std::thread::sleep(Duration::from_millis(50 * i));
      })
    })
    .collect();
  wait_all(batch.iter().map(|future| future.as_any()));
  info!("Batch drained.");

  info!("--- Dependent Tasks Example End ---");
}
