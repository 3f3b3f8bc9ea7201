//! Exclusive and concurrent task sets: a group of scheduled closures with
//! an outstanding counter, a `wait` that helps drain the pool rather than
//! blocking idle, and cooperative cancellation — grounded on
//! `dispenso/TaskSet.h` / `dispenso/ConcurrentTaskSet.h`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::pool::{Shared, ThreadPool};
use crate::schedulable::{ForceQueuingTag, Schedulable};
use crate::sync::CompletionEvent;

struct Inner {
    shared: Arc<Shared>,
    outstanding: AtomicUsize,
    cancelled: AtomicBool,
    done: CompletionEvent,
}

impl Inner {
    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.notify();
        }
    }

    fn wait(&self) {
        loop {
            if self.outstanding.load(Ordering::Acquire) == 0 {
                // Reset the one-shot word before returning: nothing can
                // still be waiting on or notifying `done` once every
                // outstanding task has reported in, so this is safe, and it
                // lets a later `schedule`/`wait` round on this same
                // instance see a fresh event rather than the stale
                // already-notified word from this round.
                self.done.reset();
                return;
            }
            if !self.shared.try_run_one() {
                // Nothing immediately available to help with; a short
                // blocking wait avoids a hot spin while still re-checking
                // promptly once the last task finishes.
                self.done.wait_for(std::time::Duration::from_micros(200));
            }
        }
    }
}

/// A task set only the owning thread may schedule onto. Cheaper than
/// [`ConcurrentTaskSet`] since the outstanding counter never needs to be
/// observed cross-thread by a scheduler (only by completing workers).
pub struct TaskSet {
    inner: Arc<Inner>,
    owner: std::thread::ThreadId,
}

impl TaskSet {
    pub fn new(pool: &ThreadPool) -> Self {
        TaskSet {
            inner: Arc::new(Inner {
                shared: pool.shared(),
                outstanding: AtomicUsize::new(0),
                cancelled: AtomicBool::new(false),
                done: CompletionEvent::new(),
            }),
            owner: std::thread::current().id(),
        }
    }

    fn assert_owner(&self) {
        assert_eq!(
            std::thread::current().id(),
            self.owner,
            "TaskSet scheduled from a thread other than its owner"
        );
    }

    /// Schedules `f` onto the pool, wrapped with a finalizer that
    /// decrements the outstanding counter. Skipped (without running `f`)
    /// if the set has been cancelled.
    ///
    /// # Panics
    /// Panics if called from any thread other than the one that created
    /// this `TaskSet`.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.assert_owner();
        if self.inner.cancelled.load(Ordering::Relaxed) {
            return;
        }
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        crate::pool::ThreadPool::schedule_inner(
            &inner.shared,
            crate::once_fn::OnceFunction::new(move || {
                f();
                inner.finish_one();
            }),
        );
    }

    /// Sets the cancellation flag. Already-scheduled tasks are not
    /// recalled; they must poll [`canceled`](Self::canceled) to exit
    /// cooperatively.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether `cancel` has been called.
    pub fn canceled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Blocks until every scheduled task has completed, helping execute
    /// pool work in the meantime rather than idling.
    pub fn wait(&self) {
        self.inner.wait();
    }

    /// Number of tasks scheduled but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.outstanding(),
            0,
            "TaskSet dropped with outstanding tasks"
        );
    }
}

impl Schedulable for TaskSet {
    fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        TaskSet::schedule(self, f);
    }

    fn schedule_force_queuing(&self, f: impl FnOnce() + Send + 'static, _tag: ForceQueuingTag) {
        self.assert_owner();
        if self.inner.cancelled.load(Ordering::Relaxed) {
            return;
        }
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        inner.shared.push_round_robin(crate::once_fn::OnceFunction::new(move || {
            f();
            inner.finish_one();
        }));
    }
}

/// Same contract as [`TaskSet`], but schedulable from any thread: the
/// outstanding counter is atomic and cancellation is visible across
/// threads under acquire/release ordering.
#[derive(Clone)]
pub struct ConcurrentTaskSet {
    inner: Arc<Inner>,
}

impl ConcurrentTaskSet {
    pub fn new(pool: &ThreadPool) -> Self {
        ConcurrentTaskSet {
            inner: Arc::new(Inner {
                shared: pool.shared(),
                outstanding: AtomicUsize::new(0),
                cancelled: AtomicBool::new(false),
                done: CompletionEvent::new(),
            }),
        }
    }

    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        crate::pool::ThreadPool::schedule_inner(
            &inner.shared,
            crate::once_fn::OnceFunction::new(move || {
                f();
                inner.finish_one();
            }),
        );
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn canceled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn wait(&self) {
        self.inner.wait();
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

impl Schedulable for ConcurrentTaskSet {
    fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        ConcurrentTaskSet::schedule(self, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::ThreadPriority;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    #[test]
    fn exclusive_task_set_waits_for_all() {
        let pool = ThreadPool::new(4, ThreadPriority::Normal);
        let ts = TaskSet::new(&pool);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let c = Arc::clone(&counter);
            ts.schedule(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        ts.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn concurrent_task_set_schedulable_from_other_threads() {
        let pool = Arc::new(ThreadPool::new(4, ThreadPriority::Normal));
        let ts = ConcurrentTaskSet::new(&pool);
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ts = ts.clone();
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let c = Arc::clone(&c);
                        ts.schedule(move || {
                            c.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        ts.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn exclusive_task_set_wait_is_reusable_after_a_notified_round() {
        let pool = ThreadPool::new(2, ThreadPriority::Normal);
        let ts = TaskSet::new(&pool);

        // First round: block long enough in `wait()` to actually hit the
        // `done.wait_for` path and get notified, so `done`'s word is left
        // set unless `wait()` resets it.
        ts.schedule(|| std::thread::sleep(Duration::from_millis(30)));
        ts.wait();

        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        ts.schedule(move || {
            std::thread::sleep(Duration::from_millis(60));
            done2.store(true, Ordering::SeqCst);
        });
        let start = Instant::now();
        ts.wait();
        assert!(
            done.load(Ordering::SeqCst),
            "wait() returned before round 2's task finished"
        );
        assert!(
            start.elapsed() >= Duration::from_millis(50),
            "elapsed = {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn concurrent_task_set_wait_is_reusable_after_a_notified_round() {
        let pool = Arc::new(ThreadPool::new(2, ThreadPriority::Normal));
        let ts = ConcurrentTaskSet::new(&pool);

        ts.schedule(|| std::thread::sleep(Duration::from_millis(30)));
        ts.wait();

        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        ts.schedule(move || {
            std::thread::sleep(Duration::from_millis(60));
            done2.store(true, Ordering::SeqCst);
        });
        let start = Instant::now();
        ts.wait();
        assert!(
            done.load(Ordering::SeqCst),
            "wait() returned before round 2's task finished"
        );
        assert!(
            start.elapsed() >= Duration::from_millis(50),
            "elapsed = {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn cancel_stops_further_scheduling() {
        let pool = ThreadPool::new(2, ThreadPriority::Normal);
        let ts = TaskSet::new(&pool);
        let counter = Arc::new(AtomicU32::new(0));
        ts.cancel();
        assert!(ts.canceled());
        let c = Arc::clone(&counter);
        ts.schedule(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        ts.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
