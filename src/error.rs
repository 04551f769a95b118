//! Error types surfaced by the pool and the ambient fiber API.

use thiserror::Error;

/// Returned by [`Pool::post`](crate::Pool::post) and
/// [`Pool::submit`](crate::Pool::submit) when the pool has left the
/// `Running` state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool is shutting down (or has shut down); the task was not
    /// accepted.
    #[error("the task cannot be delivered: the pool is not running")]
    SubmitAfterShutdown,
}

/// Returned by [`bind_to_this_thread`](crate::bind_to_this_thread) when the
/// caller is not a fiber running on a worker thread.
///
/// Fibers never execute on the main thread (the thread that first created
/// the pool), so binding there is always an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fibers cannot be bound to the main thread")]
pub struct PinError;

/// The terminal state of a task submitted through
/// [`Pool::submit`](crate::Pool::submit), as observed through its
/// [`TaskFuture`](crate::TaskFuture).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task body panicked; the payload is preserved as a message.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task was discarded before its body ran, e.g. because the pool
    /// entered `Cleaning` or the fiber was interrupted before its first
    /// schedule.
    #[error("task was discarded before completion")]
    Aborted,
}
