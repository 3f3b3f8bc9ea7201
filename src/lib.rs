//! `taskloom` is a toolbox for parallel execution: a work-stealing thread
//! pool, task sets with joint wait and cooperative cancellation, single
//! assignment futures with continuation chaining, dependency-tracked task
//! graphs, a timed task scheduler, and the low-level synchronization
//! primitives (completion event, latch, reader/writer lock, single-slot
//! async request) that the higher layers are built from.
//!
//! This is an in-process, single-address-space scheduler. It does not
//! persist state, does not provide cross-process synchronization, and does
//! not preempt running tasks — cancellation is always cooperative.
//!
//! The layers compose bottom-up, matching the module list below:
//!
//! * [`time`], [`thread_id`], [`priority`] — platform utilities.
//! * [`alloc`] — thread-local small-buffer allocator backing [`once_fn`].
//! * [`sync`] — completion event, latch, reader/writer lock, async request.
//! * [`pool`] — the worker thread pool and exclusive/concurrent task sets.
//! * [`future`] — single-assignment futures with `then`/`when_all`.
//! * [`graph`] — dependency-counted task graphs and their executors.
//! * [`timed_task`] — the periodic/delayed task scheduler.
//! * [`resource_pool`] — a semaphore-guarded pool of reusable resources.
//! * [`schedulable`] — the `Schedulable` contract plus `ImmediateInvoker`
//!   and `NewThreadInvoker`.
//! * [`error`] — the small `Copy` error enums operational (as opposed to
//!   programmer-error) failures return.
//!
//! Worker lifecycle, pool shutdown, work stealing, timed-task firing and
//! self-cancellation, and graph executor level transitions emit `log`
//! records (`trace`/`debug`); this crate never installs a subscriber
//! itself, so pull in `env_logger` or similar in the consuming binary to
//! see them.

pub mod alloc;
pub mod error;
pub mod future;
pub mod graph;
pub mod once_fn;
pub mod pool;
pub mod priority;
pub mod resource_pool;
pub mod schedulable;
pub mod sync;
pub mod thread_id;
pub mod time;
pub mod timed_task;

pub use error::{PoolShutDown, Timeout};
pub use future::{async_on, make_ready_future, when_all, Future};
pub use once_fn::OnceFunction;
pub use pool::{TaskSet, ThreadPool};
pub use priority::ThreadPriority;
pub use schedulable::{ImmediateInvoker, NewThreadInvoker, Schedulable};

/// A safe number of bytes (and alignment) to avoid false sharing between
/// cores. Mirrors the teacher's `kCacheLineSize`/`CachePadded` usage.
pub const CACHE_LINE_SIZE: usize = 64;
