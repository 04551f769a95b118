//! Result channel for `Pool::submit`.
//!
//! A submitted callable is wrapped in a [`PackagedTask`] whose
//! [`TaskFuture`] resolves to the returned value, to the captured panic, or
//! to [`TaskError::Aborted`] when the body never ran (the pool discarded it
//! during shutdown or the fiber was interrupted before its first schedule).

use crate::error::TaskError;
use crate::runnable::panic_message;
use crate::wait::WaitQueue;
use parking_lot::Mutex;
use std::sync::Arc;

enum Slot<T> {
    Pending,
    Ready(Result<T, TaskError>),
    Taken,
}

struct FutureState<T> {
    slot: Mutex<Slot<T>>,
    waiters: WaitQueue,
}

impl<T> FutureState<T> {
    fn fulfill(&self, value: Result<T, TaskError>) {
        {
            let mut slot = self.slot.lock();
            if matches!(*slot, Slot::Pending) {
                *slot = Slot::Ready(value);
            }
        }
        self.waiters.wake_all();
    }

    fn is_ready(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }
}

/// The receiving end of a [`Pool::submit`](crate::Pool::submit) call.
///
/// Waiting from inside a fiber parks the fiber (the worker thread stays
/// busy); waiting from a plain thread blocks that thread. The future carries
/// no interrupt capability — use `post` and the fiber handle when
/// cancellation is required.
pub struct TaskFuture<T> {
    state: Arc<FutureState<T>>,
}

impl<T> TaskFuture<T> {
    /// True once the task has produced a value, a panic, or was discarded.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Blocks until the task reaches a terminal state.
    pub fn wait(&self) {
        self.state.waiters.wait_until(|| self.state.is_ready());
    }

    /// Waits for the task and takes its result.
    pub fn get(self) -> Result<T, TaskError> {
        self.wait();
        match std::mem::replace(&mut *self.state.slot.lock(), Slot::Taken) {
            Slot::Ready(result) => result,
            // Unreachable in practice: `get` consumes the only future.
            Slot::Pending | Slot::Taken => Err(TaskError::Aborted),
        }
    }
}

/// The sending half: a one-shot callable that fulfills the future on every
/// exit path. Dropped without running (body skipped), it reports `Aborted`,
/// mirroring a broken promise.
pub(crate) struct PackagedTask<F, T> {
    body: Option<F>,
    state: Arc<FutureState<T>>,
}

impl<F, T> PackagedTask<F, T>
where
    F: FnOnce() -> T,
{
    pub(crate) fn new(body: F) -> (Self, TaskFuture<T>) {
        let state = Arc::new(FutureState {
            slot: Mutex::new(Slot::Pending),
            waiters: WaitQueue::new(),
        });
        let future = TaskFuture {
            state: state.clone(),
        };
        (
            PackagedTask {
                body: Some(body),
                state,
            },
            future,
        )
    }

    /// Runs the callable, capturing a panic into the future instead of
    /// letting it reach the runnable boundary.
    pub(crate) fn run(mut self) {
        if let Some(body) = self.body.take() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
            self.state.fulfill(
                result.map_err(|payload| TaskError::Panicked(panic_message(&payload).to_owned())),
            );
        }
    }
}

impl<F, T> Drop for PackagedTask<F, T> {
    fn drop(&mut self) {
        if self.body.is_some() {
            self.state.fulfill(Err(TaskError::Aborted));
        }
    }
}
