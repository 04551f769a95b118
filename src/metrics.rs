//! Optional runtime counters, enabled with the `metrics` feature.

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;
#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Global counters for the fiber runtime.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Fibers created through `post`/`submit`.
    pub fibers_spawned: AtomicU64,
    /// Fibers whose body returned or was skipped.
    pub fibers_completed: AtomicU64,
    /// Pushes to the process-wide shared ready queue.
    pub shared_queue_pushes: AtomicU64,
    /// Pops from the shared ready queue.
    pub shared_queue_pops: AtomicU64,
    /// Pushes to per-worker pinned queues.
    pub pinned_queue_pushes: AtomicU64,
    /// When metrics collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    fn new() -> Self {
        Metrics {
            fibers_spawned: AtomicU64::new(0),
            fibers_completed: AtomicU64::new(0),
            shared_queue_pushes: AtomicU64::new(0),
            shared_queue_pops: AtomicU64::new(0),
            pinned_queue_pushes: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fibers_spawned: self.fibers_spawned.load(Ordering::Relaxed),
            fibers_completed: self.fibers_completed.load(Ordering::Relaxed),
            shared_queue_pushes: self.shared_queue_pushes.load(Ordering::Relaxed),
            shared_queue_pops: self.shared_queue_pops.load(Ordering::Relaxed),
            pinned_queue_pushes: self.pinned_queue_pushes.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
lazy_static! {
    static ref METRICS: Metrics = Metrics::new();
}

/// The process-wide metrics instance.
#[cfg(feature = "metrics")]
pub fn global() -> &'static Metrics {
    &METRICS
}

/// Snapshot of [`Metrics`] at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub fibers_spawned: u64,
    pub fibers_completed: u64,
    pub shared_queue_pushes: u64,
    pub shared_queue_pops: u64,
    pub pinned_queue_pushes: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Completed fibers per second since startup.
    pub fn completions_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.fibers_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Approximate shared-queue depth (pushes minus pops).
    pub fn shared_queue_depth(&self) -> i64 {
        self.shared_queue_pushes as i64 - self.shared_queue_pops as i64
    }
}
