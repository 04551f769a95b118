//! Blocking primitive that works for fibers and plain threads alike.
//!
//! A [`WaitQueue`] holds everything currently waiting for some condition
//! owned by its embedding structure (a fiber's completion, a future's
//! fulfillment). Fiber waiters are parked through the fiber park/wake
//! protocol and so never block their worker thread; plain threads fall back
//! to a condition variable.

use crate::fiber::{self, FiberRef};
use parking_lot::{Condvar, Mutex};

enum Waiter {
    Fiber(FiberRef),
    Thread(std::sync::Arc<ThreadWaiter>),
}

struct ThreadWaiter {
    signaled: Mutex<bool>,
    cv: Condvar,
}

/// A list of parked fibers / blocked threads, woken in bulk.
pub(crate) struct WaitQueue {
    waiters: Mutex<Vec<Waiter>>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        WaitQueue {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Blocks the caller until `ready()` observes true.
    ///
    /// The register-then-recheck ordering makes the wait race-free against a
    /// concurrent `wake_all`: a wake that fires after registration is either
    /// seen by the recheck or delivered through the park permit / condvar
    /// flag.
    pub(crate) fn wait_until(&self, ready: impl Fn() -> bool) {
        if let Some(current) = fiber::current() {
            loop {
                if ready() {
                    return;
                }
                self.waiters.lock().push(Waiter::Fiber(current.clone()));
                if ready() {
                    return;
                }
                fiber::park_current();
            }
        } else {
            let me = std::sync::Arc::new(ThreadWaiter {
                signaled: Mutex::new(false),
                cv: Condvar::new(),
            });
            loop {
                if ready() {
                    return;
                }
                self.waiters.lock().push(Waiter::Thread(me.clone()));
                if ready() {
                    return;
                }
                let mut signaled = me.signaled.lock();
                while !*signaled {
                    me.cv.wait(&mut signaled);
                }
                *signaled = false;
            }
        }
    }

    /// Wakes every registered waiter and empties the list.
    pub(crate) fn wake_all(&self) {
        let drained = std::mem::take(&mut *self.waiters.lock());
        for waiter in drained {
            match waiter {
                Waiter::Fiber(f) => f.wake(),
                Waiter::Thread(t) => {
                    let mut signaled = t.signaled.lock();
                    *signaled = true;
                    t.cv.notify_all();
                }
            }
        }
    }
}
