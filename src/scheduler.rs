//! Per-thread work-sharing scheduler.
//!
//! Every worker thread (and any thread that posts work) installs one
//! [`Scheduler`]. Ready fibers are classified by `on_awakened` into one of
//! three queues:
//!
//! - the process-wide **shared ready queue**, a mutex-protected FIFO any
//!   worker may pop;
//! - the per-worker **pinned queue** for fibers bound to this thread;
//! - the per-worker **local queue** for thread-internal service contexts
//!   that must never migrate.
//!
//! `pick_next` prefers pinned over shared over local, FIFO within each
//! queue. Cross-thread wakeups of pinned fibers arrive through a lock-free
//! remote inbox drained by the owner, so the pinned and local queues remain
//! single-threaded. A mutex/condvar/flag triple (`suspend_until`/`notify`)
//! parks idle workers; wakeups are broadcast through the global registry.

use crate::fiber::{Fiber, FiberKind, FiberRef, ParkCommit};
use crate::registry;
use crate::runnable::Runnable;
use crossbeam::queue::SegQueue;
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

lazy_static! {
    /// The process-wide shared ready queue of unpinned fibers.
    static ref READY_QUEUE: Mutex<VecDeque<FiberRef>> = Mutex::new(VecDeque::new());
}

/// The cross-thread-visible half of a scheduler: the wake condition and the
/// remote inbox for pinned-fiber wakeups.
pub(crate) struct SchedulerShared {
    thread: ThreadId,
    suspendable: bool,
    wake: Mutex<bool>,
    wake_cv: Condvar,
    inbox: SegQueue<FiberRef>,
}

impl SchedulerShared {
    fn new(thread: ThreadId, suspendable: bool) -> Self {
        SchedulerShared {
            thread,
            suspendable,
            wake: Mutex::new(false),
            wake_cv: Condvar::new(),
            inbox: SegQueue::new(),
        }
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Signals the owning worker to re-run `pick_next`.
    pub(crate) fn notify(&self) {
        if !self.suspendable {
            return;
        }
        let mut flag = self.wake.lock();
        *flag = true;
        self.wake_cv.notify_all();
    }

    /// Parks the owning worker until notified or until `deadline`. With
    /// suspension disabled this returns immediately (the worker spins).
    fn suspend_until(&self, deadline: Option<Instant>) {
        if !self.suspendable {
            return;
        }
        let mut flag = self.wake.lock();
        match deadline {
            Some(deadline) => {
                while !*flag {
                    if self.wake_cv.wait_until(&mut flag, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*flag {
                    self.wake_cv.wait(&mut flag);
                }
            }
        }
        *flag = false;
    }

    pub(crate) fn push_remote(&self, fiber: FiberRef) {
        self.inbox.push(fiber);
    }

    #[cfg(test)]
    pub(crate) fn for_tests(suspendable: bool) -> Self {
        // A thread id no live scheduler can own.
        let thread = std::thread::spawn(std::thread::current)
            .join()
            .expect("spawn for thread id")
            .id();
        SchedulerShared::new(thread, suspendable)
    }

    #[cfg(test)]
    pub(crate) fn wake_pending(&self) -> bool {
        *self.wake.lock()
    }

    #[cfg(test)]
    pub(crate) fn clear_wake(&self) {
        *self.wake.lock() = false;
    }
}

/// A fiber sleeping until its deadline; ordered as a min-heap entry with
/// FIFO tie-breaking.
struct Sleeper {
    deadline: Instant,
    seq: u64,
    fiber: FiberRef,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Sleeper {}
impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
        // on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// The per-thread scheduler instance. Only its owning thread touches the
/// queues; everything cross-thread goes through [`SchedulerShared`].
pub(crate) struct Scheduler {
    thread: ThreadId,
    /// Cached at construction: the main thread identity is fixed by the
    /// first pool construction, before any scheduler exists.
    is_main: bool,
    shared: Arc<SchedulerShared>,
    pinned: RefCell<VecDeque<FiberRef>>,
    local: RefCell<VecDeque<FiberRef>>,
    sleepers: RefCell<BinaryHeap<Sleeper>>,
    sleep_seq: Cell<u64>,
}

thread_local! {
    static SCHEDULER: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

impl Scheduler {
    fn new(suspendable: bool) -> Rc<Scheduler> {
        let thread = std::thread::current().id();
        let shared = Arc::new(SchedulerShared::new(thread, suspendable));
        registry::register(&shared);
        Rc::new(Scheduler {
            thread,
            is_main: registry::is_main_thread(),
            shared,
            pinned: RefCell::new(VecDeque::new()),
            local: RefCell::new(VecDeque::new()),
            sleepers: RefCell::new(BinaryHeap::new()),
            sleep_seq: Cell::new(0),
        })
    }

    /// Installs a scheduler on the current thread, replacing none: the first
    /// installation wins for the thread's lifetime.
    pub(crate) fn install(suspendable: bool) -> Rc<Scheduler> {
        SCHEDULER.with(|slot| {
            let mut slot = slot.borrow_mut();
            match &*slot {
                Some(sched) => sched.clone(),
                None => {
                    let sched = Scheduler::new(suspendable);
                    *slot = Some(sched.clone());
                    sched
                }
            }
        })
    }

    /// A fiber became ready on this thread: classify it onto a queue.
    pub(crate) fn on_awakened(&self, fiber: FiberRef) {
        debug_assert!(!fiber.props().finished(), "finished fibers are never re-enqueued");
        match fiber.kind() {
            FiberKind::Service => {
                // Thread-internal contexts never leave their thread.
                self.local.borrow_mut().push_back(fiber);
            }
            FiberKind::Task => {
                if fiber.props().pinned() {
                    match fiber.props().pinned_to() {
                        Some(owner) if owner == self.thread => {
                            debug_assert!(
                                !registry::is_main_thread(),
                                "pinning to the main thread is rejected at pin time"
                            );
                            #[cfg(feature = "metrics")]
                            crate::metrics::global().pinned_queue_pushes.fetch_add(
                                1,
                                std::sync::atomic::Ordering::Relaxed,
                            );
                            self.pinned.borrow_mut().push_back(fiber);
                        }
                        Some(owner) => {
                            // Woken away from home: hand it to its owner.
                            if let Err(fiber) = registry::route_to_owner(owner, fiber) {
                                // Owner is gone (teardown); let any worker
                                // drain it so its runnable is released.
                                push_shared(fiber, Some(self.thread));
                            }
                        }
                        None => push_shared(fiber, Some(self.thread)),
                    }
                } else {
                    push_shared(fiber, Some(self.thread));
                }
            }
        }
    }

    /// A fiber's properties changed (it was pinned). If it is not linked in
    /// one of this scheduler's queues it is running or blocked and will be
    /// reclassified on its next wakeup; otherwise unlink and reclassify now.
    pub(crate) fn on_property_change(&self, fiber: &FiberRef) {
        if let Some(unlinked) = self.unlink(fiber) {
            self.on_awakened(unlinked);
        }
    }

    fn unlink(&self, fiber: &FiberRef) -> Option<FiberRef> {
        let mut local = self.local.borrow_mut();
        if let Some(pos) = local.iter().position(|f| Arc::ptr_eq(f, fiber)) {
            return local.remove(pos);
        }
        drop(local);
        let mut pinned = self.pinned.borrow_mut();
        if let Some(pos) = pinned.iter().position(|f| Arc::ptr_eq(f, fiber)) {
            return pinned.remove(pos);
        }
        drop(pinned);
        let mut shared = READY_QUEUE.lock();
        if let Some(pos) = shared.iter().position(|f| Arc::ptr_eq(f, fiber)) {
            return shared.remove(pos);
        }
        None
    }

    /// Selects the next fiber to run on this thread.
    ///
    /// On the main thread only the local queue is eligible (user fibers
    /// never run there); other workers are nudged first so shared work
    /// drains. Workers prefer pinned over shared over local.
    pub(crate) fn pick_next(&self) -> Option<FiberRef> {
        if self.is_main {
            registry::notify_all(Some(self.thread));
            return self.local.borrow_mut().pop_front();
        }

        self.admit_remote();
        self.admit_due_sleepers();

        if let Some(fiber) = self.pinned.borrow_mut().pop_front() {
            return Some(fiber);
        }
        {
            let mut shared = READY_QUEUE.lock();
            if let Some(fiber) = shared.pop_front() {
                #[cfg(feature = "metrics")]
                crate::metrics::global()
                    .shared_queue_pops
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Some(fiber);
            }
        }
        self.local.borrow_mut().pop_front()
    }

    /// Moves remotely-woken pinned fibers from the inbox to the pinned
    /// queue.
    fn admit_remote(&self) {
        while let Some(fiber) = self.shared.inbox.pop() {
            self.on_awakened(fiber);
        }
    }

    /// Reclassifies every sleeper whose deadline has passed.
    fn admit_due_sleepers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut sleepers = self.sleepers.borrow_mut();
                match sleepers.peek() {
                    Some(sleeper) if sleeper.deadline <= now => sleepers.pop(),
                    _ => None,
                }
            };
            match due {
                Some(sleeper) => self.on_awakened(sleeper.fiber),
                None => break,
            }
        }
    }

    /// True when this thread could run something right now.
    pub(crate) fn has_ready_fibers(&self) -> bool {
        if self.is_main {
            return !self.local.borrow().is_empty();
        }
        !self.shared.inbox.is_empty()
            || !self.pinned.borrow().is_empty()
            || !READY_QUEUE.lock().is_empty()
            || !self.local.borrow().is_empty()
    }

    /// True when nothing remains for this worker to run or wake: its own
    /// queues, inbox and sleep heap are empty and the shared ready queue is
    /// observed empty. Workers must not exit while a concurrent wakeup could
    /// still land work on the shared queue with no one left to drain it.
    pub(crate) fn is_drained(&self) -> bool {
        self.shared.inbox.is_empty()
            && self.pinned.borrow().is_empty()
            && self.local.borrow().is_empty()
            && self.sleepers.borrow().is_empty()
            && READY_QUEUE.lock().is_empty()
    }

    /// Earliest sleeper deadline, the natural bound for `suspend_until`.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.sleepers.borrow().peek().map(|s| s.deadline)
    }

    pub(crate) fn push_sleeper(&self, deadline: Instant, fiber: FiberRef) {
        let seq = self.sleep_seq.get();
        self.sleep_seq.set(seq + 1);
        self.sleepers.borrow_mut().push(Sleeper {
            deadline,
            seq,
            fiber,
        });
    }

    /// Finalizes a `Parked` suspension; requeues immediately when a wake
    /// raced in before the fiber left the stack.
    pub(crate) fn fiber_parked(&self, fiber: FiberRef) {
        match fiber.commit_park() {
            ParkCommit::Parked => {} // wait queues own the reference now
            ParkCommit::AlreadyNotified => self.on_awakened(fiber),
        }
    }

    pub(crate) fn suspend_until(&self, deadline: Option<Instant>) {
        self.shared.suspend_until(deadline);
    }

    /// Spawns a fiber running `runnable` and schedules it.
    pub(crate) fn spawn(&self, kind: FiberKind, runnable: Box<dyn Runnable>) -> FiberRef {
        let fiber = Fiber::spawn(kind, runnable);
        #[cfg(feature = "metrics")]
        crate::metrics::global()
            .fibers_spawned
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.on_awakened(fiber.clone());
        fiber
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        registry::deregister(self.thread);
    }
}

/// Pushes onto the shared ready queue and broadcasts a wake so a parked
/// worker picks the fiber up.
fn push_shared(fiber: FiberRef, except: Option<ThreadId>) {
    #[cfg(feature = "metrics")]
    crate::metrics::global()
        .shared_queue_pushes
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    READY_QUEUE.lock().push_back(fiber);
    registry::notify_all(except);
}

/// Runs `f` with the calling thread's scheduler, installing one lazily the
/// first time a thread needs it (e.g. the first `post` from that thread).
pub(crate) fn with_current<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    let sched = Scheduler::install(true);
    f(&sched)
}

/// Makes a woken fiber ready again from any thread.
pub(crate) fn schedule_ready(fiber: FiberRef) {
    with_current(|sched| sched.on_awakened(fiber));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::Closure;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    // Tests below share the process-wide READY_QUEUE and broadcast through
    // the registry; serialize them.
    use crate::test_sync::GLOBAL_LOCK as QUEUE_TEST_LOCK;

    fn task_fiber() -> FiberRef {
        Fiber::spawn(FiberKind::Task, Box::new(Closure::new(|| {})))
    }

    fn service_fiber() -> FiberRef {
        Fiber::spawn(FiberKind::Service, Box::new(Closure::new(|| {})))
    }

    fn drain_shared_queue() {
        READY_QUEUE.lock().clear();
    }

    #[test]
    fn classification_and_pick_order() {
        // Run on a dedicated thread so the queues start empty and the thread
        // is never the main thread.
        let _guard = QUEUE_TEST_LOCK.lock();
        std::thread::spawn(|| {
            drain_shared_queue();
            let sched = Scheduler::new(false);

            let service = service_fiber();
            let unpinned = task_fiber();
            let pinned = task_fiber();
            pinned.props().pin_to(std::thread::current().id());

            sched.on_awakened(service.clone());
            sched.on_awakened(unpinned.clone());
            sched.on_awakened(pinned.clone());

            assert!(sched.has_ready_fibers());

            // pinned > shared > local
            let first = sched.pick_next().expect("pinned first");
            assert!(StdArc::ptr_eq(&first, &pinned));
            let second = sched.pick_next().expect("shared second");
            assert!(StdArc::ptr_eq(&second, &unpinned));
            let third = sched.pick_next().expect("local last");
            assert!(StdArc::ptr_eq(&third, &service));
            assert!(sched.pick_next().is_none());
            assert!(!sched.has_ready_fibers());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn main_thread_serves_only_its_local_queue() {
        let _guard = QUEUE_TEST_LOCK.lock();
        // The only test in this binary that claims the main thread; its
        // thread id is never reused, so other tests stay unaffected.
        registry::set_main_thread(std::thread::current().id());
        assert!(registry::is_main_thread());

        // A second claim is ignored.
        let other = std::thread::spawn(std::thread::current)
            .join()
            .unwrap()
            .id();
        registry::set_main_thread(other);
        assert!(registry::is_main_thread());

        drain_shared_queue();
        let sched = Scheduler::new(false);
        let task = task_fiber();
        let service = service_fiber();
        sched.on_awakened(task); // unpinned: shared queue
        sched.on_awakened(service.clone()); // service: local queue

        // Only the local queue is eligible here; the shared entry is left
        // for the workers.
        let picked = sched.pick_next().expect("local context");
        assert!(StdArc::ptr_eq(&picked, &service));
        assert!(sched.pick_next().is_none());
        assert!(!sched.has_ready_fibers());
        assert_eq!(READY_QUEUE.lock().len(), 1);
        drain_shared_queue();
    }

    #[test]
    fn shared_queue_is_fifo() {
        let _guard = QUEUE_TEST_LOCK.lock();
        std::thread::spawn(|| {
            drain_shared_queue();
            let sched = Scheduler::new(false);
            let a = task_fiber();
            let b = task_fiber();
            sched.on_awakened(a.clone());
            sched.on_awakened(b.clone());
            assert!(StdArc::ptr_eq(&sched.pick_next().unwrap(), &a));
            assert!(StdArc::ptr_eq(&sched.pick_next().unwrap(), &b));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn property_change_relinks_queued_fiber() {
        let _guard = QUEUE_TEST_LOCK.lock();
        std::thread::spawn(|| {
            drain_shared_queue();
            let sched = Scheduler::new(false);
            let fiber = task_fiber();
            sched.on_awakened(fiber.clone());
            // Now sitting in the shared queue; pin it and reclassify.
            fiber.props().pin_to(std::thread::current().id());
            sched.on_property_change(&fiber);
            assert!(READY_QUEUE.lock().iter().all(|f| !StdArc::ptr_eq(f, &fiber)));
            let picked = sched.pick_next().unwrap();
            assert!(StdArc::ptr_eq(&picked, &fiber));

            // Not queued at all: a no-op.
            let loose = task_fiber();
            loose.props().pin_to(std::thread::current().id());
            sched.on_property_change(&loose);
            assert!(sched.pick_next().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn remote_inbox_feeds_the_pinned_queue() {
        let _guard = QUEUE_TEST_LOCK.lock();
        std::thread::spawn(|| {
            drain_shared_queue();
            let sched = Scheduler::new(false);
            let fiber = task_fiber();
            fiber.props().pin_to(std::thread::current().id());
            sched.shared.push_remote(fiber.clone());

            assert!(sched.has_ready_fibers());
            let picked = sched.pick_next().unwrap();
            assert!(StdArc::ptr_eq(&picked, &fiber));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn sleepers_wake_in_deadline_order() {
        let _guard = QUEUE_TEST_LOCK.lock();
        std::thread::spawn(|| {
            drain_shared_queue();
            let sched = Scheduler::new(false);
            let late = task_fiber();
            let early = task_fiber();
            let now = Instant::now();
            sched.push_sleeper(now + Duration::from_millis(5), late.clone());
            sched.push_sleeper(now + Duration::from_millis(1), early.clone());
            assert_eq!(sched.next_deadline(), Some(now + Duration::from_millis(1)));

            std::thread::sleep(Duration::from_millis(10));
            assert!(StdArc::ptr_eq(&sched.pick_next().unwrap(), &early));
            assert!(StdArc::ptr_eq(&sched.pick_next().unwrap(), &late));
            assert!(sched.is_drained());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn suspend_until_honors_notify_and_deadline() {
        let shared = StdArc::new(SchedulerShared::for_tests(true));

        // Deadline path returns.
        let started = Instant::now();
        shared.suspend_until(Some(Instant::now() + Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(15));

        // Notify path returns promptly and clears the flag.
        let waker = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                shared.notify();
            })
        };
        shared.suspend_until(None);
        waker.join().unwrap();
        assert!(!shared.wake_pending());

        // Suspension disabled: immediate return.
        let spin = SchedulerShared::for_tests(false);
        let started = Instant::now();
        spin.suspend_until(None);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn spawned_fibers_land_on_the_shared_queue_and_run() {
        let _guard = QUEUE_TEST_LOCK.lock();
        std::thread::spawn(|| {
            drain_shared_queue();
            let sched = Scheduler::new(false);
            let ran = StdArc::new(AtomicUsize::new(0));
            let ran_in = ran.clone();
            let fiber = sched.spawn(
                FiberKind::Task,
                Box::new(Closure::new(move || {
                    ran_in.fetch_add(1, Ordering::SeqCst);
                })),
            );
            let picked = sched.pick_next().unwrap();
            assert!(StdArc::ptr_eq(&picked, &fiber));
            assert!(matches!(picked.resume(), crate::fiber::RunOutcome::Completed));
            assert_eq!(ran.load(Ordering::SeqCst), 1);
            assert!(fiber.props().finished());
        })
        .join()
        .unwrap();
    }
}
