use std::time::Duration;

use threads_orchestra::{TaskFuture, ThreadPoolManager};
use tracing::info;

fn my_task_fn(id: usize, delay_ms: u64) -> String {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  std::thread::sleep(Duration::from_millis(delay_ms));
  let result = format!("Task {} finished successfully after {}ms", id, delay_ms);
  info!("{}", result);
  result
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  let pool = ThreadPoolManager::new(2, "basic_pool");

  let mut futures: Vec<TaskFuture<String>> = Vec::new();
  for i in 0..5usize {
    // Alternate sleep times for variety
    let sleep_duration: u64 = 500 + (i as u64 % 3 * 250);
    let future = pool.submit(move || my_task_fn(i, sleep_duration));
    info!("Submitted task {} with sequence {}", i, future.sequence());
    futures.push(future);
  }

  info!("All tasks submitted. Awaiting results...");

  for (i, future) in futures.iter().enumerate() {
    info!("Result for task {}: {}", i, future.get());
  }

  info!("All task results processed. Dropping the pool drains nothing: everything is done.");
  drop(pool);
  info!("--- Basic Usage Example End ---");
}
