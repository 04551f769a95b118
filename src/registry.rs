//! Process-wide scheduler registry.
//!
//! Tracks the "main thread" (the thread that first constructed a pool; user
//! fibers never run there) and every live per-thread scheduler, so that a
//! scheduler making work available can wake parked workers anywhere in the
//! process. Schedulers register on construction and deregister on drop; the
//! registry holds weak references, so destruction order never dangles.

use crate::fiber::FiberRef;
use crate::scheduler::SchedulerShared;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

struct RegistryInner {
    main_thread: Option<ThreadId>,
    schedulers: HashMap<ThreadId, Weak<SchedulerShared>>,
}

lazy_static! {
    static ref REGISTRY: Mutex<RegistryInner> = Mutex::new(RegistryInner {
        main_thread: None,
        schedulers: HashMap::new(),
    });
}

/// Fixes the main thread identity. The first call wins; later calls are
/// ignored.
pub(crate) fn set_main_thread(thread: ThreadId) {
    let mut inner = REGISTRY.lock();
    if inner.main_thread.is_none() {
        inner.main_thread = Some(thread);
    }
}

/// True when the calling thread is the registered main thread.
pub(crate) fn is_main_thread() -> bool {
    REGISTRY.lock().main_thread == Some(std::thread::current().id())
}

pub(crate) fn register(shared: &Arc<SchedulerShared>) {
    REGISTRY
        .lock()
        .schedulers
        .insert(shared.thread(), Arc::downgrade(shared));
}

/// Removes the scheduler for `thread`; absent entries are ignored (the
/// registry may already have dropped its weak slot).
pub(crate) fn deregister(thread: ThreadId) {
    REGISTRY.lock().schedulers.remove(&thread);
}

/// Wakes every live scheduler except the one on `except` (conventionally the
/// caller's own thread, which is awake by definition).
pub(crate) fn notify_all(except: Option<ThreadId>) {
    let targets: Vec<Arc<SchedulerShared>> = {
        let inner = REGISTRY.lock();
        inner
            .schedulers
            .iter()
            .filter(|(thread, _)| Some(**thread) != except)
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    };
    for shared in targets {
        shared.notify();
    }
}

/// Wakes a single live scheduler, preferring one other than the caller's.
#[allow(dead_code)] // broadcast is the hot path; kept for single-wake callers
pub(crate) fn notify_one() {
    let caller = std::thread::current().id();
    let target: Option<Arc<SchedulerShared>> = {
        let inner = REGISTRY.lock();
        let mut fallback = None;
        let mut pick = None;
        for (thread, weak) in inner.schedulers.iter() {
            if let Some(shared) = weak.upgrade() {
                if *thread == caller {
                    fallback = Some(shared);
                } else {
                    pick = Some(shared);
                    break;
                }
            }
        }
        pick.or(fallback)
    };
    if let Some(shared) = target {
        shared.notify();
    }
}

/// Delivers a ready pinned fiber to its owning worker's inbox and wakes it.
/// Returns false when that scheduler no longer exists (worker already gone).
pub(crate) fn route_to_owner(owner: ThreadId, fiber: FiberRef) -> Result<(), FiberRef> {
    let shared = REGISTRY
        .lock()
        .schedulers
        .get(&owner)
        .and_then(Weak::upgrade);
    match shared {
        Some(shared) => {
            shared.push_remote(fiber);
            shared.notify();
            Ok(())
        }
        None => Err(fiber),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerShared;

    #[test]
    fn deregister_tolerates_absent_entries() {
        let id = std::thread::spawn(std::thread::current).join().unwrap().id();
        deregister(id);
        deregister(id);
    }

    #[test]
    fn notify_all_skips_the_excluded_scheduler() {
        let _guard = crate::test_sync::GLOBAL_LOCK.lock();
        // Dedicated thread ids that no live scheduler uses.
        let a = Arc::new(SchedulerShared::for_tests(true));
        let b = Arc::new(SchedulerShared::for_tests(true));
        register(&a);
        register(&b);

        notify_all(Some(a.thread()));
        assert!(!a.wake_pending());
        assert!(b.wake_pending());

        b.clear_wake();
        notify_all(None);
        assert!(a.wake_pending());
        assert!(b.wake_pending());

        deregister(a.thread());
        deregister(b.thread());
    }

    #[test]
    fn dead_schedulers_are_skipped() {
        let _guard = crate::test_sync::GLOBAL_LOCK.lock();
        let a = Arc::new(SchedulerShared::for_tests(true));
        let thread = a.thread();
        register(&a);
        drop(a);
        // Upgrade fails; must not panic or wake anything.
        notify_all(None);
        notify_one();
        deregister(thread);
    }
}
