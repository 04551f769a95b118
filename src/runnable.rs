//! The type-erased unit of work executed as a fiber body.
//!
//! A runnable is the closure a caller handed to the pool, boxed behind a
//! single-method trait. Constructing one increments a process-wide live
//! counter and dropping one decrements it; the pool surfaces that counter as
//! `fiber_count()`. The counter therefore tracks logical tasks, not fibers
//! that happen to be on a queue.

use crate::props::FiberProps;
use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE_RUNNABLES: AtomicUsize = AtomicUsize::new(0);

/// Number of runnables constructed but not yet destroyed.
pub(crate) fn live_count() -> usize {
    LIVE_RUNNABLES.load(Ordering::SeqCst)
}

/// A type-erased task body. `invoke` is the outermost failure boundary for
/// user code: nothing may propagate out of it into the scheduler.
pub(crate) trait Runnable: Send {
    fn invoke(self: Box<Self>, props: &FiberProps);
}

/// Concrete runnable wrapping a captured closure. The `Option` marks an
/// intact payload; it is taken exactly once by `invoke`.
pub(crate) struct Closure<F: FnOnce() + Send> {
    body: Option<F>,
}

impl<F: FnOnce() + Send> Closure<F> {
    pub(crate) fn new(body: F) -> Self {
        LIVE_RUNNABLES.fetch_add(1, Ordering::SeqCst);
        Closure { body: Some(body) }
    }
}

impl<F: FnOnce() + Send> Drop for Closure<F> {
    fn drop(&mut self) {
        // One decrement per logical runnable, whether or not the body ran.
        LIVE_RUNNABLES.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<F: FnOnce() + Send> Runnable for Closure<F> {
    fn invoke(mut self: Box<Self>, props: &FiberProps) {
        let skip = props.interrupted() || crate::pool::shutdown_discards_work();
        if !skip {
            if let Some(body) = self.body.take() {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
                if let Err(payload) = result {
                    log::warn!(
                        "unhandled panic in fiber task (swallowed): {}",
                        panic_message(&payload)
                    );
                }
            }
        }
        props.finish();
    }
}

/// Best-effort rendering of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "opaque panic payload"
    }
}
