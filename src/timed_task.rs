//! A single dispatcher thread that fires delayed and periodic tasks,
//! grounded on `dispenso/timed_task.h` + `dispenso/timed_task.cpp` for the
//! adaptive spin/yield/sleep run loop and on
//! `dispenso/detail/timed_task_impl.h` for the per-task cancellation and
//! in-progress bookkeeping. The epoch-wait handoff reuses the same raw futex
//! primitives as [`crate::pool`] and [`crate::sync`] rather than a condvar.
//!
//! Unlike the teacher, which stores a `std::function<void(shared_ptr<Impl>)>`
//! closed over a reference to an arbitrary `Schedulable`, each task here
//! erases its schedulable once at construction time into a boxed submit
//! function (see [`erase_schedulable`]) so the scheduler's heap can hold
//! tasks bound to different pools/task sets side by side.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::once_fn::OnceFunction;
use crate::priority::ThreadPriority;
use crate::schedulable::{ForceQueuingTag, Schedulable};
use crate::sync::{futex_wait, futex_wait_timeout, futex_wake_all};

/// Below this time-to-next-fire, just pop and run; sub-microsecond
/// precision isn't worth another loop iteration.
const SMALL_TIME_BUFFER: f64 = 10e-6;
/// Below this, spin without yielding the CPU.
const SPIN_BUFFER: f64 = 50e-6;
/// Below this, yield in a loop rather than spinning or sleeping.
const SPIN_YIELD_BUFFER: f64 = 500e-6;

/// Sentinel for "run until cancelled" rather than a fixed invocation count.
pub const RUN_FOREVER: u64 = u64::MAX;

type SubmitFn = Box<dyn Fn(OnceFunction) + Send + Sync>;

/// Erases a [`Schedulable`] into a boxed submit function, so tasks bound to
/// different executors can share one scheduler's heap.
fn erase_schedulable<S>(schedulable: S) -> SubmitFn
where
    S: Schedulable + Send + Sync + 'static,
{
    Box::new(move |f: OnceFunction| {
        schedulable.schedule_force_queuing(move || f.invoke(), ForceQueuingTag);
    })
}

struct TaskState {
    /// Remaining invocations; `RUN_FOREVER` for unbounded periodic tasks.
    /// Monotonically non-increasing to zero.
    times_to_run: AtomicU64,
    cancelled: AtomicBool,
    in_progress: AtomicU32,
}

impl TaskState {
    fn done(&self) -> bool {
        self.times_to_run.load(Ordering::Acquire) == 0
    }
}

/// A handle to a scheduled task. Dropping it does not cancel the task — use
/// [`cancel`](Self::cancel) explicitly, matching the teacher's
/// shared-ownership `TimedTaskImpl` (the scheduler's heap entry keeps the
/// task alive independent of any handle).
#[derive(Clone)]
pub struct TimedTaskHandle {
    state: Arc<TaskState>,
}

impl TimedTaskHandle {
    /// Prevents any future firing. A firing already in flight (its functor
    /// already dispatched to the executor) is not interrupted — cancellation
    /// here is the same cooperative, best-effort contract as everywhere else
    /// in this crate.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.times_to_run.store(0, Ordering::Release);
    }

    /// Whether the task has been cancelled (explicitly, or because its
    /// functor returned `false`).
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Whether the task has no remaining invocations (cancelled, or a
    /// finite task that ran out its count).
    pub fn is_done(&self) -> bool {
        self.state.done()
    }

    /// Remaining invocation count, or `RUN_FOREVER`.
    pub fn times_to_run(&self) -> u64 {
        self.state.times_to_run.load(Ordering::Acquire)
    }

    /// Busy-waits (yielding between polls) until no firing of this task is
    /// in progress. Intended for callers that need to know the functor will
    /// never run again before they tear down state it captures — the same
    /// join discipline the teacher's `inProgress` counter exists for.
    pub fn join(&self) {
        while self.state.in_progress.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
    }

    /// Same as [`join`](Self::join), but gives up and returns
    /// [`crate::error::Timeout`] if no firing finishes within `timeout`.
    pub fn join_for(&self, timeout: Duration) -> Result<(), crate::error::Timeout> {
        let deadline = crate::time::now() + timeout.as_secs_f64();
        while self.state.in_progress.load(Ordering::Acquire) != 0 {
            if crate::time::duration_until(deadline).is_zero() {
                return Err(crate::error::Timeout);
            }
            std::thread::yield_now();
        }
        Ok(())
    }
}

struct HeapEntry {
    next_abs_time: f64,
    period: f64,
    steady: bool,
    state: Arc<TaskState>,
    submit: SubmitFn,
    functor: Box<dyn FnMut() -> bool + Send>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.next_abs_time == other.next_abs_time
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: `BinaryHeap` is a max-heap, and we want the task with
        // the smallest `next_abs_time` on top.
        other
            .next_abs_time
            .partial_cmp(&self.next_abs_time)
            .unwrap_or(CmpOrdering::Equal)
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    epoch: AtomicU32,
    running: AtomicBool,
}

impl Shared {
    fn wake(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
        futex_wake_all(&self.epoch);
    }
}

/// One dispatcher thread serving a min-heap of due times. Construct once
/// (typically as a long-lived value owned by the application), schedule
/// tasks onto it, and let it drop to join the dispatcher.
pub struct TimedTaskScheduler {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TimedTaskScheduler {
    /// Spawns the dispatcher thread at the given priority.
    pub fn new(priority: ThreadPriority) -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            epoch: AtomicU32::new(0),
            running: AtomicBool::new(true),
        });
        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("taskloom-timed-task".to_string())
            .spawn(move || run_loop(worker_shared, priority))
            .expect("failed to spawn timed-task dispatcher thread");

        log::debug!("taskloom timed-task dispatcher starting at {priority:?} priority");
        TimedTaskScheduler {
            shared,
            thread: Some(thread),
        }
    }

    /// Schedules `functor` to run once, after `delay`, on `schedulable`.
    ///
    /// `schedulable` is cloned (not consumed) into the task, the same way
    /// [`crate::future::Future::then_on`] takes its executor — pass an
    /// `Arc<ThreadPool>` or a [`crate::pool::ConcurrentTaskSet`] (both cheap
    /// to clone) rather than a bare pool, since a one-shot task's clone is
    /// dropped the instant it fires.
    pub fn schedule_once<S, F>(&self, schedulable: &S, delay: Duration, f: F) -> TimedTaskHandle
    where
        S: Schedulable + Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        let mut f = Some(f);
        self.schedule_periodic(schedulable, delay, Duration::ZERO, 1, true, move || {
            if let Some(f) = f.take() {
                f();
            }
            true
        })
    }

    /// Schedules `functor` to run every `period` starting after `delay`, up
    /// to `times_to_run` invocations (use [`RUN_FOREVER`] for unbounded).
    ///
    /// `steady` selects phase-locked firing (`next = prev_due + period`, no
    /// drift) versus elapsed firing (`next = now + period`, which slips
    /// under load but never "catches up" with a burst of overdue firings).
    /// `functor` returning `false` self-cancels the task.
    pub fn schedule_periodic<S, F>(
        &self,
        schedulable: &S,
        delay: Duration,
        period: Duration,
        times_to_run: u64,
        steady: bool,
        functor: F,
    ) -> TimedTaskHandle
    where
        S: Schedulable + Clone + Send + Sync + 'static,
        F: FnMut() -> bool + Send + 'static,
    {
        let state = Arc::new(TaskState {
            times_to_run: AtomicU64::new(times_to_run),
            cancelled: AtomicBool::new(false),
            in_progress: AtomicU32::new(0),
        });
        let entry = HeapEntry {
            next_abs_time: crate::time::now() + delay.as_secs_f64(),
            period: period.as_secs_f64(),
            steady,
            state: Arc::clone(&state),
            submit: erase_schedulable(schedulable.clone()),
            functor: Box::new(functor),
        };

        let cur_time = crate::time::now();
        let time_remaining = entry.next_abs_time - cur_time;
        if time_remaining < SMALL_TIME_BUFFER {
            fire(&self.shared, entry, cur_time);
        } else {
            self.shared.heap.lock().unwrap().push(entry);
        }
        self.shared.wake();

        TimedTaskHandle { state }
    }
}

impl Drop for TimedTaskScheduler {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Fires one due entry: decrements its remaining count, dispatches the
/// functor-wrapping closure with force-queuing (so a dispatcher that's
/// itself a worker on the target pool never recurses through its own
/// stack), and reinserts it if it's periodic and has invocations left.
fn fire(shared: &Shared, mut entry: HeapEntry, cur_time: f64) {
    let remaining = entry.state.times_to_run.load(Ordering::Acquire);
    if remaining == 0 {
        return;
    }
    if remaining != RUN_FOREVER {
        entry.state.times_to_run.fetch_sub(1, Ordering::AcqRel);
    }

    let state = Arc::clone(&entry.state);
    state.in_progress.fetch_add(1, Ordering::AcqRel);
    log::trace!("taskloom timed task firing, {remaining} invocation(s) were remaining");
    let mut functor = entry.functor;
    let wrapped = OnceFunction::new(move || {
        if !state.cancelled.load(Ordering::Acquire) {
            if !functor() {
                state.times_to_run.store(0, Ordering::Release);
                state.cancelled.store(true, Ordering::Release);
                log::debug!("taskloom timed task self-cancelled: functor returned false");
            }
        }
        state.in_progress.fetch_sub(1, Ordering::Release);
    });
    (entry.submit)(wrapped);

    let remaining_after = entry.state.times_to_run.load(Ordering::Acquire);
    if remaining_after != 0 && entry.period > 0.0 {
        entry.next_abs_time = if entry.steady {
            entry.next_abs_time + entry.period
        } else {
            cur_time + entry.period
        };
        shared.heap.lock().unwrap().push(entry);
    }
}

fn run_loop(shared: Arc<Shared>, priority: ThreadPriority) {
    crate::priority::set_current_thread_priority(priority);
    let mut cur_epoch = shared.epoch.load(Ordering::Acquire);

    loop {
        if !shared.running.load(Ordering::Acquire) {
            return;
        }

        if crate::priority::current_thread_priority() != priority {
            crate::priority::set_current_thread_priority(priority);
        }

        let is_empty = shared.heap.lock().unwrap().is_empty();
        if is_empty {
            futex_wait(&shared.epoch, cur_epoch);
            cur_epoch = shared.epoch.load(Ordering::Acquire);
            continue;
        }

        let cur_time = crate::time::now();
        let time_remaining = {
            let heap = shared.heap.lock().unwrap();
            heap.peek().map(|top| top.next_abs_time - cur_time)
        };
        let Some(time_remaining) = time_remaining else {
            continue;
        };

        if time_remaining < SMALL_TIME_BUFFER {
            let next = shared.heap.lock().unwrap().pop();
            if let Some(next) = next {
                fire(&shared, next, cur_time);
            }
        } else if time_remaining < SPIN_BUFFER {
            crate::time::cpu_relax();
        } else if time_remaining < SPIN_YIELD_BUFFER {
            std::thread::yield_now();
        } else {
            let wait_for = Duration::from_secs_f64(time_remaining - SPIN_BUFFER);
            futex_wait_timeout(&shared.epoch, cur_epoch, wait_for);
            cur_epoch = shared.epoch.load(Ordering::Acquire);
        }
    }
}
