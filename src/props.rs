//! Per-fiber scheduling properties.
//!
//! Every fiber carries a small block of atomic flags consulted by the
//! scheduler and the interruption protocol. All flag transitions are
//! monotonic: `interrupted` and `finished` only ever go false -> true, and a
//! pinned fiber never becomes unpinned.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::ThreadId;

/// Scheduling properties attached to each fiber.
pub(crate) struct FiberProps {
    interrupted: AtomicBool,
    finished: AtomicBool,
    pinned: AtomicBool,
    /// Worker thread the fiber was pinned to; set once, together with
    /// `pinned`.
    pinned_to: Mutex<Option<ThreadId>>,
    /// Reserved priority slot; has no scheduling effect.
    priority: AtomicI32,
}

impl FiberProps {
    pub(crate) fn new() -> Self {
        FiberProps {
            interrupted: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            pinned_to: Mutex::new(None),
            priority: AtomicI32::new(0),
        }
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Requests cooperative cancellation. Observed at the next
    /// `is_interrupted()` call or at the runnable boundary.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Marks the fiber's body as done (returned or skipped). A finished
    /// fiber must never be re-enqueued.
    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub(crate) fn pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    /// Pins the fiber to `thread`. The first pin wins; pinning is
    /// irrevocable.
    pub(crate) fn pin_to(&self, thread: ThreadId) {
        let mut owner = self.pinned_to.lock();
        if owner.is_none() {
            *owner = Some(thread);
        }
        self.pinned.store(true, Ordering::SeqCst);
    }

    /// The worker thread this fiber is pinned to, if any.
    pub(crate) fn pinned_to(&self) -> Option<ThreadId> {
        *self.pinned_to.lock()
    }

    /// Reserved; stored but never consulted by the scheduler.
    pub(crate) fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let props = FiberProps::new();
        assert!(!props.interrupted());
        assert!(!props.finished());
        assert!(!props.pinned());
        assert_eq!(props.pinned_to(), None);
        assert_eq!(props.priority(), 0);
    }

    #[test]
    fn flag_transitions_are_monotonic() {
        let props = FiberProps::new();

        props.interrupt();
        props.interrupt();
        assert!(props.interrupted());

        props.finish();
        assert!(props.finished());

        let here = std::thread::current().id();
        props.pin_to(here);
        assert!(props.pinned());
        assert_eq!(props.pinned_to(), Some(here));
    }

    #[test]
    fn first_pin_owner_wins() {
        let props = FiberProps::new();
        let here = std::thread::current().id();
        props.pin_to(here);

        let other = std::thread::spawn(std::thread::current)
            .join()
            .unwrap()
            .id();
        props.pin_to(other);
        assert_eq!(props.pinned_to(), Some(here));
    }

    #[test]
    fn priority_is_a_plain_slot() {
        let props = FiberProps::new();
        props.set_priority(7);
        assert_eq!(props.priority(), 7);
    }
}
