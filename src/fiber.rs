//! Fiber contexts and the ambient fiber API.
//!
//! A fiber is a stackful execution context backed by a `corosensei`
//! coroutine. Fibers are resumed by worker threads; when a fiber suspends it
//! hands the worker a [`Suspend`] intent telling the scheduler what to do
//! with it (requeue, sleep, or park until woken).
//!
//! The free functions at the bottom form the ambient API available to code
//! running inside a fiber: [`yield_now`], [`sleep`], [`is_interrupted`],
//! [`bind_to_this_thread`] and [`fiber_local`]. Called from a plain thread
//! they degrade to the closest thread-level behavior.

use crate::error::PinError;
use crate::props::FiberProps;
use crate::runnable::Runnable;
use crate::wait::WaitQueue;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-unique fiber identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// What a suspended fiber wants from the scheduler.
pub(crate) enum Suspend {
    /// Ready again immediately; reclassify through `on_awakened`.
    Yielded,
    /// Not ready before the deadline; goes to the worker's sleep heap.
    Sleeping(Instant),
    /// Not ready until an explicit wake; kept alive by a wait queue.
    Parked,
}

/// Result of resuming a fiber once.
pub(crate) enum RunOutcome {
    Suspended(Suspend),
    Completed,
}

/// Distinguishes user task fibers from thread-internal service contexts.
/// Service contexts stay on their thread's local queue and never migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberKind {
    Task,
    Service,
}

// Park/wake state machine. Guarantees a wake racing with the fiber's
// suspension is never lost and that exactly one party re-enqueues the fiber.
pub(crate) const PARK_RUNNING: u8 = 0;
pub(crate) const PARK_PARKING: u8 = 1;
pub(crate) const PARK_PARKED: u8 = 2;
pub(crate) const PARK_NOTIFIED: u8 = 3;

type FiberCoroutine = Coroutine<(), Suspend, ()>;
type FiberYielder = Yielder<(), Suspend>;

/// A lightweight stackful execution context.
///
/// Shared via `Arc`: ready queues, wait queues and handles all hold
/// references. The coroutine itself is owned by whichever worker is
/// currently resuming the fiber; between resumes it sits in `co`.
pub(crate) struct Fiber {
    id: FiberId,
    kind: FiberKind,
    props: FiberProps,
    co: Mutex<Option<FiberCoroutine>>,
    /// Published by the coroutine body on entry; valid only while the fiber
    /// is running. Used by the ambient operations to suspend.
    yielder: AtomicPtr<FiberYielder>,
    park: AtomicU8,
    /// Fibers and threads joined on this fiber's completion.
    pub(crate) waiters: WaitQueue,
    /// The `fiber_local` any-slot.
    local: Mutex<Option<Box<dyn Any + Send>>>,
}

pub(crate) type FiberRef = Arc<Fiber>;

// The raw yielder pointer and the coroutine are only touched by the worker
// that currently owns the resume; queue/record ownership enforces exclusive
// access.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT_FIBER: RefCell<Option<FiberRef>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Creates a fiber whose body runs `runnable` to completion.
    pub(crate) fn spawn(kind: FiberKind, runnable: Box<dyn Runnable>) -> FiberRef {
        let fiber = Arc::new(Fiber {
            id: FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            props: FiberProps::new(),
            co: Mutex::new(None),
            yielder: AtomicPtr::new(ptr::null_mut()),
            park: AtomicU8::new(PARK_RUNNING),
            waiters: WaitQueue::new(),
            local: Mutex::new(None),
        });

        // The body captures a weak reference: the coroutine lives inside the
        // fiber record, so a strong one would leak the record.
        let weak = Arc::downgrade(&fiber);
        let co = Coroutine::new(move |yielder: &FiberYielder, ()| {
            if let Some(fiber) = weak.upgrade() {
                fiber
                    .yielder
                    .store(yielder as *const FiberYielder as *mut _, Ordering::Release);
                runnable.invoke(&fiber.props);
                fiber.yielder.store(ptr::null_mut(), Ordering::Release);
            }
        });
        *fiber.co.lock() = Some(co);
        fiber
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn kind(&self) -> FiberKind {
        self.kind
    }

    pub(crate) fn props(&self) -> &FiberProps {
        &self.props
    }

    pub(crate) fn local_slot(&self) -> &Mutex<Option<Box<dyn Any + Send>>> {
        &self.local
    }

    /// Resumes the fiber on the current thread until its next suspension
    /// point or completion.
    pub(crate) fn resume(self: &FiberRef) -> RunOutcome {
        let co = self.co.lock().take();
        let Some(mut co) = co else {
            // Already completed; nothing to run.
            return RunOutcome::Completed;
        };

        CURRENT_FIBER.with(|cur| *cur.borrow_mut() = Some(self.clone()));
        let result = co.resume(());
        CURRENT_FIBER.with(|cur| *cur.borrow_mut() = None);

        match result {
            CoroutineResult::Yield(intent) => {
                *self.co.lock() = Some(co);
                RunOutcome::Suspended(intent)
            }
            CoroutineResult::Return(()) => RunOutcome::Completed,
        }
    }

    /// Called by the worker after the fiber's body returned: releases every
    /// joiner. `finished` was already set at the runnable boundary.
    pub(crate) fn complete(&self) {
        debug_assert!(self.props.finished());
        self.waiters.wake_all();
    }

    /// Wakes a parked (or about-to-park) fiber, enqueueing it exactly once.
    /// Waking a running fiber leaves a permit that the next park consumes.
    pub(crate) fn wake(self: &FiberRef) {
        loop {
            let observed = self.park.load(Ordering::SeqCst);
            let next = match observed {
                PARK_PARKED | PARK_PARKING | PARK_RUNNING => PARK_NOTIFIED,
                _ => return, // already notified
            };
            if self
                .park
                .compare_exchange(observed, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if observed == PARK_PARKED {
                    // Fully suspended: this waker owns the requeue.
                    crate::scheduler::schedule_ready(self.clone());
                }
                // PARKING: the suspending worker requeues. RUNNING: the
                // permit is consumed by the next park.
                return;
            }
        }
    }

    /// Transitions after the coroutine yielded `Parked`: either the fiber is
    /// now fully parked (wait queues own it), or a wake raced in and the
    /// fiber must be requeued by the caller.
    pub(crate) fn commit_park(&self) -> ParkCommit {
        match self.park.compare_exchange(
            PARK_PARKING,
            PARK_PARKED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => ParkCommit::Parked,
            Err(_) => ParkCommit::AlreadyNotified,
        }
    }

    #[cfg(test)]
    pub(crate) fn park_state(&self) -> u8 {
        self.park.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn force_park_state(&self, state: u8) {
        self.park.store(state, Ordering::SeqCst);
    }
}

/// Outcome of committing a park on the worker side.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParkCommit {
    Parked,
    AlreadyNotified,
}

/// The fiber currently running on this thread, if any.
pub(crate) fn current() -> Option<FiberRef> {
    CURRENT_FIBER.with(|cur| cur.borrow().clone())
}

/// Suspends the current fiber with the given intent. Must be called from
/// fiber context.
fn suspend_current(fiber: &FiberRef, intent: Suspend) {
    let yielder = fiber.yielder.load(Ordering::Acquire);
    if yielder.is_null() {
        // A fiber body publishes its yielder before running user code;
        // reaching here means the call did not come from inside a fiber.
        panic!("fiber suspended without an active yielder");
    }
    // SAFETY: the yielder pointer is published by this fiber's own body and
    // stays valid while the body is on the stack, which it is: we are it.
    unsafe { (*yielder).suspend(intent) };
}

/// Parks the current fiber until [`Fiber::wake`]. Consumes a pending wake
/// permit instead of suspending, so a wake that lands just before the park
/// is never lost. No-op outside fiber context.
pub(crate) fn park_current() {
    let Some(fiber) = current() else { return };

    if fiber
        .park
        .compare_exchange(
            PARK_NOTIFIED,
            PARK_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok()
    {
        return; // consumed a permit
    }
    if fiber
        .park
        .compare_exchange(
            PARK_RUNNING,
            PARK_PARKING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_err()
    {
        // A wake raced the announcement; consume it.
        fiber.park.store(PARK_RUNNING, Ordering::SeqCst);
        return;
    }
    suspend_current(&fiber, Suspend::Parked);
    fiber.park.store(PARK_RUNNING, Ordering::SeqCst);
}

/// Yields the current fiber back to the scheduler, letting other ready
/// fibers run. Falls back to a thread yield outside fiber context.
pub fn yield_now() {
    match current() {
        Some(fiber) => suspend_current(&fiber, Suspend::Yielded),
        None => std::thread::yield_now(),
    }
}

/// Puts the current fiber to sleep for at least `duration` without blocking
/// its worker thread. Falls back to a thread sleep outside fiber context.
pub fn sleep(duration: Duration) {
    match current() {
        Some(fiber) => suspend_current(&fiber, Suspend::Sleeping(Instant::now() + duration)),
        None => std::thread::sleep(duration),
    }
}

/// True when the current fiber should wind down: its own `interrupted` flag
/// is set, or the pool has begun shutting down.
pub fn is_interrupted() -> bool {
    if crate::pool::shutdown_in_progress() {
        return true;
    }
    current().map_or(false, |fiber| fiber.props().interrupted())
}

/// Pins the current fiber to the worker thread it is running on; from the
/// first suspension after this call, the fiber only ever resumes there.
///
/// Fails with [`PinError`] outside fiber context — which includes the main
/// thread, where fibers never run.
pub fn bind_to_this_thread() -> Result<(), PinError> {
    let Some(fiber) = current() else {
        return Err(PinError);
    };
    if crate::registry::is_main_thread() {
        return Err(PinError);
    }
    fiber.props().pin_to(std::thread::current().id());
    // The fiber is running, so it sits in no ready queue and this is a
    // no-op; kept for the case of pinning a fiber that is queued.
    crate::scheduler::with_current(|sched| sched.on_property_change(&fiber));
    Ok(())
}

/// Grants access to the current fiber's local data slot, an `Any` box that
/// travels with the fiber across suspensions and workers. Returns `None`
/// outside fiber context.
pub fn fiber_local<R>(f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> Option<R> {
    current().map(|fiber| f(&mut fiber.local_slot().lock()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::Closure;

    fn noop_fiber() -> FiberRef {
        Fiber::spawn(FiberKind::Task, Box::new(Closure::new(|| {})))
    }

    #[test]
    fn ids_are_unique() {
        let a = noop_fiber();
        let b = noop_fiber();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn resume_runs_body_to_completion() {
        let fiber = noop_fiber();
        assert!(matches!(fiber.resume(), RunOutcome::Completed));
        assert!(fiber.props().finished());
        // Resuming a completed fiber is inert.
        assert!(matches!(fiber.resume(), RunOutcome::Completed));
    }

    #[test]
    fn wake_before_park_leaves_a_permit() {
        let fiber = noop_fiber();
        fiber.wake();
        assert_eq!(fiber.park_state(), PARK_NOTIFIED);
        // A second wake is idempotent.
        fiber.wake();
        assert_eq!(fiber.park_state(), PARK_NOTIFIED);
    }

    #[test]
    fn commit_park_detects_racing_wake() {
        let fiber = noop_fiber();
        fiber.force_park_state(PARK_PARKING);
        fiber.wake();
        assert_eq!(fiber.commit_park(), ParkCommit::AlreadyNotified);

        let fiber = noop_fiber();
        fiber.force_park_state(PARK_PARKING);
        assert_eq!(fiber.commit_park(), ParkCommit::Parked);
    }

    #[test]
    fn ambient_ops_degrade_outside_fiber_context() {
        assert!(current().is_none());
        yield_now();
        sleep(Duration::from_millis(1));
        assert_eq!(bind_to_this_thread(), Err(PinError));
        assert!(fiber_local(|_| ()).is_none());
    }
}
