//! The fiber pool: lifecycle state machine, worker threads and submission.
//!
//! A pool owns a fixed set of worker threads that collectively drain the
//! process-wide shared ready queue. Submissions are accepted only while the
//! pool is `Running`; `shutdown` moves through `Waiting` (drain) and
//! `Cleaning` (discard) to `Stopped`. The thread that constructs the first
//! pool becomes the process's "main thread" and never executes user fibers.

use crate::error::PoolError;
use crate::fiber::FiberKind;
use crate::future::{PackagedTask, TaskFuture};
use crate::handle::FiberHandle;
use crate::registry;
use crate::runnable::{self, Closure};
use crate::scheduler::{self, Scheduler};
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pool lifecycle states, strictly ordered: a pool only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    /// Accepting submissions; workers run fibers.
    Running = 0,
    /// Shutting down gracefully: no submissions, queued fibers still run.
    Waiting = 1,
    /// Shutting down promptly: queued fibers are discarded unrun.
    Cleaning = 2,
    /// All workers joined; the pool is inert.
    Stopped = 3,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Running,
            1 => State::Waiting,
            2 => State::Cleaning,
            _ => State::Stopped,
        }
    }
}

/// How often the shutdown loop re-examines the live fiber count while
/// waiting for workers to exit.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct PoolShared {
    state: AtomicU8,
    /// Number of workers that have not yet exited their run loop.
    live_workers: Mutex<usize>,
    cv: Condvar,
}

impl PoolShared {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Monotonic state advance; regressions are ignored.
    fn advance_state(&self, to: State) {
        self.state.fetch_max(to as u8, Ordering::SeqCst);
    }
}

lazy_static! {
    /// The pool consulted by the ambient interruption queries. Claimed by
    /// the first live pool and held until that pool drops; pools built while
    /// another is live never repoint it.
    static ref ACTIVE_POOL: Mutex<Weak<PoolShared>> = Mutex::new(Weak::new());
}

fn active_state() -> Option<State> {
    ACTIVE_POOL.lock().upgrade().map(|shared| shared.state())
}

/// True once shutdown has begun: ambient `is_interrupted()` reports true so
/// cooperative fibers wind down even while queued work is still draining.
pub(crate) fn shutdown_in_progress() -> bool {
    active_state().map_or(false, |state| state > State::Running)
}

/// True once the pool discards not-yet-started work: the runnable boundary
/// skips bodies from `Cleaning` on.
pub(crate) fn shutdown_discards_work() -> bool {
    active_state().map_or(false, |state| state >= State::Cleaning)
}

/// Default worker count when none is configured.
fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
        * 2
}

/// Configures and builds a [`Pool`].
pub struct PoolBuilder {
    threads: Option<usize>,
    core_affinity: bool,
}

impl PoolBuilder {
    /// Number of worker threads; defaults to
    /// `max(available_parallelism, 2) * 2`.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Pins each worker thread to a CPU core (round-robin) for cache
    /// locality. Off by default. This pins kernel threads to cores and is
    /// unrelated to fiber-to-thread pinning.
    pub fn worker_core_affinity(mut self, enabled: bool) -> Self {
        self.core_affinity = enabled;
        self
    }

    pub fn build(self) -> Pool {
        // The constructing thread of the first pool is the process's main
        // thread; user fibers are never scheduled onto it.
        registry::set_main_thread(thread::current().id());

        let shared = Arc::new(PoolShared {
            state: AtomicU8::new(State::Running as u8),
            live_workers: Mutex::new(0),
            cv: Condvar::new(),
        });
        {
            // First pool wins: fibers of a live pool must never observe the
            // lifecycle of a pool built later elsewhere.
            let mut active = ACTIVE_POOL.lock();
            if active.upgrade().is_none() {
                *active = Arc::downgrade(&shared);
            }
        }

        let threads = self.threads.unwrap_or_else(default_worker_count).max(1);
        let core_ids = if self.core_affinity {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = shared.clone();
            let core = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[index % core_ids.len()])
            };
            *shared.live_workers.lock() += 1;
            workers.push(thread::spawn(move || worker_main(shared, core)));
        }
        log::debug!("fiber pool started with {} workers", threads);

        Pool {
            shared,
            workers: Mutex::new(workers),
        }
    }
}

/// A pooled fiber runtime over a fixed set of worker threads.
pub struct Pool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder {
            threads: None,
            core_affinity: false,
        }
    }

    /// A pool with the default worker count.
    pub fn new() -> Pool {
        Pool::builder().build()
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Number of tasks accepted but not yet finished and released. The count
    /// is eventually consistent; synchronize through `join` or a future.
    pub fn fiber_count(&self) -> usize {
        runnable::live_count()
    }

    pub fn worker_count(&self) -> usize {
        *self.shared.live_workers.lock()
    }

    /// Posts a callable for execution as a new fiber and returns its handle.
    ///
    /// Fails with [`PoolError::SubmitAfterShutdown`] unless the pool is
    /// `Running`.
    pub fn post<F>(&self, f: F) -> Result<FiberHandle, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state() != State::Running {
            return Err(PoolError::SubmitAfterShutdown);
        }
        let fiber = scheduler::with_current(|sched| {
            sched.spawn(FiberKind::Task, Box::new(Closure::new(f)))
        });
        Ok(FiberHandle::new(fiber))
    }

    /// Posts a callable and returns a future carrying its result or panic.
    ///
    /// Unlike [`post`](Pool::post) the caller cannot interrupt the task
    /// through the returned future; use `post` when cancellation matters.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskFuture<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (task, future) = PackagedTask::new(f);
        self.post(move || task.run())?;
        Ok(future)
    }

    /// Shuts the pool down; never fails and may be called repeatedly.
    ///
    /// With `wait = true` the pool drains: queued and in-flight fibers run
    /// to completion (cooperatively interrupted — `is_interrupted()` already
    /// reports true), and the state degrades to `Cleaning` once the live
    /// fiber count reaches zero. With `wait = false` the pool moves straight
    /// to `Cleaning`: fibers not yet started are discarded unrun.
    pub fn shutdown(&self, wait: bool) {
        {
            let _coord = self.shared.live_workers.lock();
            self.shared
                .advance_state(if wait { State::Waiting } else { State::Cleaning });
            self.shared.cv.notify_all();
        }
        registry::notify_all(None);

        // Degrade loop: poll the fiber count at a fixed cadence; once no
        // runnables remain, release parked workers by forcing `Cleaning`.
        loop {
            if self.shared.state() == State::Waiting && runnable::live_count() == 0 {
                let _coord = self.shared.live_workers.lock();
                self.shared.advance_state(State::Cleaning);
                self.shared.cv.notify_all();
                drop(_coord);
                registry::notify_all(None);
            }
            let mut live = self.shared.live_workers.lock();
            if *live == 0 {
                break;
            }
            self.shared
                .cv
                .wait_for(&mut live, SHUTDOWN_POLL_INTERVAL);
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                log::error!("a fiber pool worker thread panicked");
            }
        }

        {
            let _coord = self.shared.live_workers.lock();
            self.shared.advance_state(State::Stopped);
            self.shared.cv.notify_all();
        }
        log::debug!("fiber pool stopped");
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.state() != State::Stopped {
            // Destructor violation: shutdown() must run before the pool is
            // dropped. Recover with a prompt shutdown rather than aborting.
            log::error!(
                "fiber pool dropped while {:?}; forcing shutdown(false)",
                self.state()
            );
            self.shutdown(false);
        }
        let mut active = ACTIVE_POOL.lock();
        if active
            .upgrade()
            .map_or(false, |shared| Arc::ptr_eq(&shared, &self.shared))
        {
            *active = Weak::new();
        }
    }
}

/// The worker thread body: install a scheduler, then run fibers until the
/// pool reaches `Cleaning` and nothing owned by this scheduler remains.
fn worker_main(shared: Arc<PoolShared>, core: Option<core_affinity::CoreId>) {
    if let Some(core) = core {
        core_affinity::set_for_current(core);
    }
    let sched = Scheduler::install(true);
    log::trace!("fiber worker started");

    loop {
        if let Some(fiber) = sched.pick_next() {
            run_fiber(&sched, fiber);
            continue;
        }
        if shared.state() >= State::Cleaning && sched.is_drained() {
            break;
        }
        if sched.has_ready_fibers() {
            continue;
        }
        sched.suspend_until(sched.next_deadline());
    }

    log::trace!("fiber worker exiting");
    let mut live = shared.live_workers.lock();
    *live -= 1;
    shared.cv.notify_all();
}

/// Resumes one fiber and files it according to its suspension intent.
fn run_fiber(sched: &Scheduler, fiber: crate::fiber::FiberRef) {
    use crate::fiber::{RunOutcome, Suspend};

    match fiber.resume() {
        RunOutcome::Suspended(Suspend::Yielded) => sched.on_awakened(fiber),
        RunOutcome::Suspended(Suspend::Sleeping(deadline)) => sched.push_sleeper(deadline, fiber),
        RunOutcome::Suspended(Suspend::Parked) => sched.fiber_parked(fiber),
        RunOutcome::Completed => {
            #[cfg(feature = "metrics")]
            crate::metrics::global()
                .fibers_completed
                .fetch_add(1, Ordering::Relaxed);
            fiber.complete();
        }
    }
}

static POOL: OnceLock<Pool> = OnceLock::new();

/// The process-wide pool singleton.
///
/// The first call constructs the pool (fixing the main thread identity) with
/// `threads` workers, or the default count when `None`. Later calls return
/// the same pool and ignore `threads`.
pub fn get_pool(threads: Option<usize>) -> &'static Pool {
    POOL.get_or_init(|| {
        let mut builder = Pool::builder();
        if let Some(threads) = threads {
            builder = builder.threads(threads);
        }
        builder.build()
    })
}
