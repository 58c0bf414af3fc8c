use thiserror::Error;

/// Errors that can occur within the `threads_orchestra` pool.
///
/// The pool itself is infallible in normal operation: submission always
/// succeeds and every submitted callable runs exactly once. The only failure
/// a caller can observe is the callable itself blowing up, surfaced through
/// [`TaskFuture::result`](crate::TaskFuture::result).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  /// The submitted callable panicked during execution. The worker that ran
  /// it survives; the panic message is preserved when the payload is a
  /// string.
  #[error("submitted callable panicked: {0}")]
  TaskPanicked(String),
}
