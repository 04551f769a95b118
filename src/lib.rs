//! # fiberpool - Pooled User-Space Fiber Runtime
//!
//! A fixed set of worker threads collectively executes an unbounded,
//! dynamically growing population of lightweight user-mode fibers, each with
//! its own stack, scheduled cooperatively. A process-wide pool accepts
//! submissions from any thread and hands back either a cancellable
//! [`FiberHandle`] or a [`TaskFuture`] carrying the task's result.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful execution contexts (backed by `corosensei`) that
//!   suspend at explicit points: yield, sleep, park, join, future wait
//! - **Scheduler**: one per worker thread; a process-wide shared ready
//!   queue plus per-worker pinned and local queues
//! - **Pool**: the lifecycle state machine (`Running` → `Waiting` →
//!   `Cleaning` → `Stopped`) driving submission gating and shutdown
//! - **Interruption**: cooperative; a flag polled via [`is_interrupted`]
//!   and checked at every runnable boundary
//!
//! The thread that creates the first pool becomes the process's "main
//! thread"; user fibers never execute there, and fibers cannot be pinned to
//! it.
//!
//! ## Example
//!
//! ```no_run
//! use fiberpool::get_pool;
//!
//! let pool = get_pool(Some(4));
//!
//! pool.post(|| {
//!     println!("hello from a fiber");
//! })
//! .unwrap();
//!
//! let future = pool.submit(|| 6).unwrap();
//! assert_eq!(future.get().unwrap(), 6);
//!
//! pool.shutdown(true);
//! ```

pub mod error;
pub mod fiber;
mod future;
mod handle;
pub mod metrics;
mod pool;
mod props;
mod registry;
mod runnable;
mod scheduler;
mod wait;


pub use error::{PinError, PoolError, TaskError};
pub use fiber::{bind_to_this_thread, fiber_local, is_interrupted, sleep, yield_now, FiberId};
pub use future::TaskFuture;
pub use handle::FiberHandle;
pub use pool::{get_pool, Pool, PoolBuilder, State};
