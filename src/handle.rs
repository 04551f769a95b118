//! Shareable handles over spawned fibers.
//!
//! A [`FiberHandle`] is what `Pool::post` returns: a cheap, cloneable view
//! of one fiber that can query completion, join, and request cooperative
//! interruption. All clones share one underlying record; when the last
//! clone is dropped the fiber is detached (never joined), after requesting
//! an interrupt if the handle was armed with `interrupt_on_destruct`.

use crate::fiber::{self, FiberId, FiberRef};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct HandleRecord {
    fiber: FiberRef,
    interrupt_on_drop: AtomicBool,
    joined: AtomicBool,
}

impl Drop for HandleRecord {
    fn drop(&mut self) {
        // Last handle gone: optionally interrupt, then detach by releasing
        // the reference. Never join here.
        if self.interrupt_on_drop.load(Ordering::SeqCst) {
            self.fiber.props().interrupt();
        }
    }
}

/// A detachable, shareable handle over a spawned fiber.
///
/// The default value is the empty handle: no fiber, `finished() == true`.
#[derive(Clone, Default)]
pub struct FiberHandle {
    record: Option<Arc<HandleRecord>>,
}

impl FiberHandle {
    pub(crate) fn new(fiber: FiberRef) -> Self {
        FiberHandle {
            record: Some(Arc::new(HandleRecord {
                fiber,
                interrupt_on_drop: AtomicBool::new(false),
                joined: AtomicBool::new(false),
            })),
        }
    }

    /// Identity of the underlying fiber, or `None` for the empty handle.
    pub fn id(&self) -> Option<FiberId> {
        self.record.as_ref().map(|r| r.fiber.id())
    }

    /// True while the underlying fiber has not been joined or detached.
    pub fn joinable(&self) -> bool {
        self.record
            .as_ref()
            .map_or(false, |r| !r.joined.load(Ordering::SeqCst))
    }

    /// Whether the fiber's body has returned or been skipped. The empty
    /// handle reports true.
    pub fn finished(&self) -> bool {
        self.record
            .as_ref()
            .map_or(true, |r| r.fiber.props().finished())
    }

    /// Blocks until the fiber ends. Inside a fiber this parks the calling
    /// fiber; from a plain thread it blocks the thread.
    ///
    /// # Panics
    ///
    /// Panics when a fiber joins itself.
    pub fn join(&self) {
        let Some(record) = &self.record else { return };
        if let Some(current) = fiber::current() {
            assert!(
                !Arc::ptr_eq(&current, &record.fiber),
                "a fiber cannot join itself"
            );
        }
        record
            .fiber
            .waiters
            .wait_until(|| record.fiber.props().finished());
        record.joined.store(true, Ordering::SeqCst);
    }

    /// Requests cooperative interruption: the fiber observes it at its next
    /// `is_interrupted()` call or at the runnable boundary. Already-finished
    /// fibers are unaffected.
    pub fn interrupt(&self) {
        if let Some(record) = &self.record {
            record.fiber.props().interrupt();
        }
    }

    /// Arms the handle so dropping the last clone requests an interrupt.
    pub fn interrupt_on_destruct(&self) {
        if let Some(record) = &self.record {
            record.interrupt_on_drop.store(true, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.id())
            .field("finished", &self.finished())
            .finish()
    }
}
