//! A work-stealing thread pool with per-worker bounded mailboxes, grounded
//! on `dispenso/ThreadPool.h` + `dispenso/detail/PoolDetail.h` for the
//! scheduling discipline, and on `shadow-shadow`'s
//! `pools/unbounded.rs::work_loop` for the thread-spawn/join/poison-on-panic
//! shape (named worker threads, a shared-state struct, a panic flag other
//! workers can observe).
//!
//! Unlike the teacher's "run the same closure on every thread" pool, this
//! one schedules independent closures: each worker owns a bounded
//! [`crossbeam::queue::ArrayQueue`] mailbox, siblings steal from each other
//! when their own mailbox is empty, and a shared
//! [`crossbeam::queue::SegQueue`] overflow queue catches anything that
//! doesn't fit (the same reservoir pattern `alloc.rs` uses for its global
//! free lists). Workers park on an epoch counter using the same raw futex
//! wait/wake primitives as [`crate::sync`], rather than a condvar.

mod task_set;

pub use task_set::{ConcurrentTaskSet, TaskSet};

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::{ArrayQueue, SegQueue};
use rand::{Rng, SeedableRng};

use crate::once_fn::OnceFunction;
use crate::priority::ThreadPriority;
use crate::schedulable::{ForceQueuingTag, Schedulable};
use crate::sync::{futex_wait, futex_wake_all};

/// Capacity of each worker's local mailbox before pushes overflow to the
/// shared queue.
const MAILBOX_CAPACITY: usize = 256;

struct WorkerCtx {
    shared: Arc<Shared>,
    index: usize,
}

thread_local! {
    static WORKER_CTX: RefCell<Option<WorkerCtx>> = const { RefCell::new(None) };
    static IN_PARALLEL_FOR: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

pub(crate) struct Shared {
    mailboxes: Vec<ArrayQueue<OnceFunction>>,
    overflow: SegQueue<OnceFunction>,
    epoch: AtomicU32,
    shutdown: AtomicBool,
    next_rr: AtomicUsize,
}

impl Shared {
    fn wake(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
        futex_wake_all(&self.epoch);
    }

    fn push_local(&self, idx: usize, f: OnceFunction) {
        if let Err(f) = self.mailboxes[idx].push(f) {
            self.overflow.push(f);
        }
        self.wake();
    }

    fn push_round_robin(&self, f: OnceFunction) {
        let idx = self.next_rr.fetch_add(1, Ordering::Relaxed) % self.mailboxes.len();
        if let Err(f) = self.mailboxes[idx].push(f) {
            self.overflow.push(f);
        }
        self.wake();
    }

    fn try_take(&self, idx: usize, rng: &mut impl Rng) -> Option<OnceFunction> {
        if let Some(f) = self.mailboxes[idx].pop() {
            return Some(f);
        }
        let n = self.mailboxes.len();
        if n > 1 {
            let start = rng.random_range(0..n);
            for offset in 0..n {
                let victim = (start + offset) % n;
                if victim == idx {
                    continue;
                }
                if let Some(f) = self.mailboxes[victim].pop() {
                    log::trace!("taskloom worker {idx} stole work from worker {victim}");
                    return Some(f);
                }
            }
        }
        self.overflow.pop()
    }

    /// Runs one pending task chosen from any mailbox/overflow, used by
    /// waiters that want to help drain the pool instead of blocking idle.
    /// Not tied to a specific worker index since the caller may not be a
    /// worker thread at all.
    fn try_run_one(&self) -> bool {
        if let Some(f) = self.overflow.pop() {
            f.invoke();
            return true;
        }
        for mailbox in &self.mailboxes {
            if let Some(f) = mailbox.pop() {
                f.invoke();
                return true;
            }
        }
        false
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize, priority: ThreadPriority) {
    crate::priority::set_current_thread_priority(priority);
    WORKER_CTX.with(|ctx| {
        *ctx.borrow_mut() = Some(WorkerCtx {
            shared: Arc::clone(&shared),
            index,
        })
    });
    log::trace!("taskloom worker {index} starting");

    let seed = crate::thread_id::thread_id() ^ ((index as u64) << 32);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    loop {
        if let Some(f) = shared.try_take(index, &mut rng) {
            f.invoke();
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            log::trace!("taskloom worker {index} exiting: shutdown observed, mailbox empty");
            return;
        }
        let observed_epoch = shared.epoch.load(Ordering::Acquire);
        // Re-check after reading the epoch to close the race where work
        // arrives (and the epoch bumps) between our last `try_take` and
        // this point.
        if let Some(f) = shared.try_take(index, &mut rng) {
            f.invoke();
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            log::trace!("taskloom worker {index} exiting: shutdown observed, mailbox empty");
            return;
        }
        futex_wait(&shared.epoch, observed_epoch);
    }
}

/// A fixed-size pool of worker threads that steal work from each other.
pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `num_threads` workers named `taskloom-worker-{i}`, each
    /// attempting to run at `priority`.
    pub fn new(num_threads: usize, priority: ThreadPriority) -> Self {
        assert!(num_threads > 0, "thread pool needs at least one worker");

        let shared = Arc::new(Shared {
            mailboxes: (0..num_threads)
                .map(|_| ArrayQueue::new(MAILBOX_CAPACITY))
                .collect(),
            overflow: SegQueue::new(),
            epoch: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            next_rr: AtomicUsize::new(0),
        });

        let threads = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("taskloom-worker-{i}"))
                    .spawn(move || worker_loop(shared, i, priority))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        log::debug!("taskloom pool starting {num_threads} workers at {priority:?} priority");
        ThreadPool { shared, threads }
    }

    /// Number of worker threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.shared.mailboxes.len()
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    fn schedule_inner(shared: &Shared, f: OnceFunction) {
        let on_this_pool = WORKER_CTX.with(|ctx| {
            ctx.borrow()
                .as_ref()
                .filter(|ctx| std::ptr::eq(Arc::as_ptr(&ctx.shared), shared as *const Shared))
                .map(|ctx| ctx.index)
        });
        match on_this_pool {
            Some(idx) => shared.push_local(idx, f),
            None => shared.push_round_robin(f),
        }
    }

    /// Runs `body` over `0..len` in chunks of `chunk_size`, distributing
    /// chunks across the pool via a [`ConcurrentTaskSet`] and blocking
    /// until all chunks complete.
    ///
    /// If called from a worker already executing inside a `parallel_for`,
    /// runs sequentially on the calling thread instead of submitting new
    /// work: the only worker that could help drain a nested parallel-for
    /// is often the current one, and submitting anyway risks deadlock if
    /// the pool is saturated with outer-level chunks waiting on this one.
    pub fn parallel_for<F>(&self, len: usize, chunk_size: usize, body: F)
    where
        F: Fn(std::ops::Range<usize>) + Send + Sync + 'static,
    {
        if len == 0 {
            return;
        }
        let chunk_size = chunk_size.max(1);

        if IN_PARALLEL_FOR.with(|f| f.get()) {
            body(0..len);
            return;
        }

        let task_set = ConcurrentTaskSet::new(self);
        let body = Arc::new(body);
        let mut start = 0;
        while start < len {
            let end = (start + chunk_size).min(len);
            let body = Arc::clone(&body);
            task_set.schedule(move || {
                IN_PARALLEL_FOR.with(|f| f.set(true));
                body(start..end);
                IN_PARALLEL_FOR.with(|f| f.set(false));
            });
            start = end;
        }
        task_set.wait();
    }
}

impl Schedulable for ThreadPool {
    fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        Self::schedule_inner(&self.shared, OnceFunction::new(f));
    }

    fn schedule_force_queuing(&self, f: impl FnOnce() + Send + 'static, _tag: ForceQueuingTag) {
        self.shared.push_round_robin(OnceFunction::new(f));
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        log::debug!(
            "taskloom pool shutting down {} workers",
            self.threads.len()
        );
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
