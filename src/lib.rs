//! A thread-based pool for executing callables with shared futures,
//! inter-task dependencies, priority inline runs and dynamic resizing.
//!
//! Work is submitted as plain closures and tracked through cloneable
//! [`TaskFuture`] handles. A task may declare other futures as
//! prerequisites; it enters the work queue only once the last of them
//! resolves. Threads that wait on a future run not-yet-started work inline
//! rather than blocking, so even a zero-thread pool completes everything on
//! the calling threads. The worker pool can be grown and shrunk at runtime
//! through a serialized control channel, and dropping the pool drains all
//! remaining work instead of cancelling it.

mod controller;
mod error;
mod future;
mod invoker;
mod manager;
mod work_queue;

pub use error::PoolError;
pub use future::{wait_all, AnyTaskFuture, TaskFuture};
pub use manager::ThreadPoolManager;
