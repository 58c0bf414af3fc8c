use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use threads_orchestra::ThreadPoolManager;
use tracing::info;

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Dynamic Resize Example ---");

  let pool = ThreadPoolManager::new(8, "resize_pool");
  let completed = Arc::new(AtomicUsize::new(0));

  let futures: Vec<_> = (0..200)
    .map(|_| {
      let completed = completed.clone();
      pool.submit(move || {
        std::thread::sleep(Duration::from_millis(5));
        completed.fetch_add(1, Ordering::SeqCst);
      })
    })
    .collect();

  info!(
    "Submitted {} tasks on {} threads; shrinking to 1 while they run",
    futures.len(),
    pool.get_thread_count()
  );
  pool.set_thread_count(1);
  info!("Allocated thread count now {}", pool.get_thread_count());

  for future in &futures {
    future.wait();
  }
  info!("All {} tasks completed despite the shrink", completed.load(Ordering::SeqCst));

  pool.set_thread_count(4);
  info!("Grew back to {} threads", pool.get_thread_count());

  info!("--- Dynamic Resize Example End ---");
}
