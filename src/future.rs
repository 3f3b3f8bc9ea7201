//! A single-assignment future bound to a [`Schedulable`] executor,
//! grounded on `dispenso/Future.h` (`ConcurrentFuture<T>`) and the
//! continuation-chaining discipline from `dispenso/detail/FutureImpl.h`.
//!
//! `T` is required to be `Clone` so that a ready value can be read by
//! `get`, handed to a `then` continuation, and folded into a `when_all`
//! result without each caller racing to move the one stored copy out —
//! the shared-future half of the C++ original's unique/shared split,
//! generalized to cover both (a unique future is simply one whose
//! `Future` handle nobody else cloned).
//!
//! `when_all` returns `Future<Vec<T>>` rather than a heterogeneous tuple:
//! Rust has no variadic generics, and a `Vec` of same-typed futures is the
//! common case for parallel work anyway (see `DESIGN.md` for the tradeoff).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::once_fn::OnceFunction;
use crate::schedulable::{ImmediateInvoker, NewThreadInvoker, Schedulable};
use crate::sync::CompletionEvent;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const READY: u8 = 2;
const CANCELLED: u8 = 3;

struct Inner<T> {
    state: AtomicU8,
    value: Mutex<Option<T>>,
    done: CompletionEvent,
    continuations: Mutex<Vec<OnceFunction>>,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Inner {
            state: AtomicU8::new(PENDING),
            value: Mutex::new(None),
            done: CompletionEvent::new(),
            continuations: Mutex::new(Vec::new()),
        }
    }

    fn complete(self: &Arc<Self>, value: T) {
        *self.value.lock().unwrap() = Some(value);
        self.state.store(READY, Ordering::Release);
        self.done.notify();
        self.drain_continuations();
    }

    fn drain_continuations(self: &Arc<Self>) {
        let pending = std::mem::take(&mut *self.continuations.lock().unwrap());
        for cont in pending {
            cont.invoke();
        }
    }

    /// Registers `cont` to run once this future settles (ready or
    /// cancelled), or immediately if it already has. Matches the "first
    /// thread observing the terminal state performs the drain" rule: the
    /// lock ensures a continuation added concurrently with
    /// `complete`/`cancel` is either seen by the drain or run
    /// synchronously right here, never both and never neither.
    fn on_ready(self: &Arc<Self>, cont: OnceFunction) {
        fn is_terminal(state: u8) -> bool {
            state == READY || state == CANCELLED
        }

        if is_terminal(self.state.load(Ordering::Acquire)) {
            cont.invoke();
            return;
        }
        let mut pending = self.continuations.lock().unwrap();
        if is_terminal(self.state.load(Ordering::Acquire)) {
            drop(pending);
            cont.invoke();
            return;
        }
        pending.push(cont);
    }
}

/// A single-assignment future. Cloning shares the same underlying cell
/// (the "shared future" variant): every clone observes the same value or
/// cancellation outcome.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Blocks until ready or cancelled, then returns the value
    /// (`Some`) or `None` if the future was cancelled before running.
    /// Cancellation is a terminal success outcome, not an error — callers
    /// that need to tell "cancelled" apart from "not yet produced" should
    /// rely on `get` only ever being called after the future settles,
    /// which it always does by the time `get` returns.
    pub fn get(&self) -> Option<T> {
        self.wait();
        match self.inner.state.load(Ordering::Acquire) {
            READY => self.inner.value.lock().unwrap().clone(),
            _ => None,
        }
    }

    /// Blocks until the future is ready or cancelled.
    fn wait(&self) {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                READY | CANCELLED => return,
                _ => self.inner.done.wait(),
            }
            // CompletionEvent is notified on both ready and (nothing
            // notifies on cancellation — see `cancel`), so loop back and
            // recheck state rather than assuming a single wait suffices.
        }
    }

    /// Blocks until ready/cancelled or `timeout` elapses; returns whether
    /// the future settled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                READY | CANCELLED => return true,
                _ => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return matches!(
                    self.inner.state.load(Ordering::Acquire),
                    READY | CANCELLED
                );
            }
            if self.inner.done.wait_for(remaining.min(Duration::from_millis(5))) {
                return true;
            }
        }
    }

    /// Blocks until ready/cancelled or the monotonic deadline `t` (seconds
    /// since process start, per [`crate::time::now`]) passes.
    pub fn wait_until(&self, t: f64) -> bool {
        self.wait_for(crate::time::duration_until(t))
    }

    /// Whether the future has reached a terminal state (ready or
    /// cancelled), without blocking.
    pub fn is_ready(&self) -> bool {
        matches!(
            self.inner.state.load(Ordering::Acquire),
            READY | CANCELLED
        )
    }

    /// Attempts to cancel the future. Succeeds (returns `true`) iff the
    /// future was still pending at the moment of the attempt — the
    /// tightened contract from the "best-effort" cancellation note: a
    /// future already running or ready cannot be cancelled out from under
    /// its functor.
    pub fn cancel(&self) -> bool {
        let won = self
            .inner
            .state
            .compare_exchange(
                PENDING,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.inner.done.notify();
            self.inner.drain_continuations();
        }
        won
    }

    /// Whether `cancel` has won the race and this future will never
    /// produce a value.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Registers `cont` to run on `schedulable` once this future is
    /// ready. Returns a new future for the continuation's result. If this
    /// future was cancelled, the continuation never runs and the returned
    /// future is also cancelled.
    pub fn then_on<U, S, F>(&self, schedulable: &S, cont: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        S: Schedulable + Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let next = Future {
            inner: Arc::new(Inner::new()),
        };
        let next_inner = Arc::clone(&next.inner);
        let source = Arc::clone(&self.inner);
        let schedulable = schedulable.clone();

        // Registered as a continuation on the source: runs once the
        // source settles, either inline (if it was already ready when
        // `then_on` was called) or from whichever thread drains the
        // source's continuation list.
        let fire = OnceFunction::new(move || {
            let value = match source.state.load(Ordering::Acquire) {
                READY => source.value.lock().unwrap().clone(),
                _ => None,
            };
            match value {
                Some(v) => {
                    let next_inner = Arc::clone(&next_inner);
                    schedulable.schedule(move || next_inner.complete(cont(v)));
                }
                None => {
                    next_inner.state.store(CANCELLED, Ordering::Release);
                    next_inner.done.notify();
                }
            }
        });

        self.inner.on_ready(fire);
        next
    }

    /// Registers `cont` to run inline (via [`ImmediateInvoker`]) once this
    /// future is ready — the common case when the continuation is cheap
    /// enough not to need its own scheduling decision.
    pub fn then<U, F>(&self, cont: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_on(&ImmediateInvoker, cont)
    }
}

/// Schedules `f` on `schedulable` and returns a future for its result.
pub fn async_on<T, S, F>(schedulable: &S, f: F) -> Future<T>
where
    T: Clone + Send + 'static,
    S: Schedulable,
    F: FnOnce() -> T + Send + 'static,
{
    let fut = Future {
        inner: Arc::new(Inner::new()),
    };
    let inner = Arc::clone(&fut.inner);

    schedulable.schedule(move || {
        if inner
            .state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Lost to a concurrent cancel; never run the functor.
            return;
        }
        let value = f();
        inner.complete(value);
    });

    fut
}

/// Returns a future that is already ready with `value`, with no
/// scheduling involved.
pub fn make_ready_future<T: Clone + Send + 'static>(value: T) -> Future<T> {
    let inner = Arc::new(Inner::new());
    inner.complete(value);
    Future { inner }
}

/// Returns a future that becomes ready once every future in `futures` is
/// ready, with a value containing each input's result in order. If any
/// input future was cancelled, the combined future is cancelled too.
pub fn when_all<T: Clone + Send + 'static>(futures: Vec<Future<T>>) -> Future<Vec<T>> {
    if futures.is_empty() {
        return make_ready_future(Vec::new());
    }

    let combined = Future {
        inner: Arc::new(Inner::new()),
    };
    let combined_inner = Arc::clone(&combined.inner);
    let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(futures.len()));
    let any_cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let results: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; futures.len()]));

    for (idx, f) in futures.into_iter().enumerate() {
        let remaining = Arc::clone(&remaining);
        let any_cancelled = Arc::clone(&any_cancelled);
        let results = Arc::clone(&results);
        let combined_inner = Arc::clone(&combined_inner);

        let finish = OnceFunction::new(move || {
            match f.get() {
                Some(v) => results.lock().unwrap()[idx] = Some(v),
                None => {
                    any_cancelled.store(true, Ordering::Relaxed);
                }
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                if any_cancelled.load(Ordering::Relaxed) {
                    combined_inner.state.store(CANCELLED, Ordering::Release);
                    combined_inner.done.notify();
                } else {
                    let values = std::mem::take(&mut *results.lock().unwrap())
                        .into_iter()
                        .map(|v| v.expect("when_all: missing result for settled future"))
                        .collect();
                    combined_inner.complete(values);
                }
            }
        });

        // Each input gets a dedicated watcher thread that blocks on `get`
        // until that input settles. Routed through `NewThreadInvoker` (not
        // a raw `std::thread::spawn`) so these watchers are counted by
        // `wait_for_new_thread_invokers()` like every other detached
        // invocation in the crate.
        NewThreadInvoker.schedule(move || finish.invoke());
    }

    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ThreadPool;
    use crate::priority::ThreadPriority;

    #[test]
    fn ready_future_resolves_immediately() {
        let f = make_ready_future(5);
        assert_eq!(f.get(), Some(5));
    }

    #[test]
    fn async_on_runs_on_pool() {
        let pool = ThreadPool::new(2, ThreadPriority::Normal);
        let f = async_on(&pool, || 2 + 2);
        assert_eq!(f.get(), Some(4));
    }

    #[test]
    fn then_chains_transformations() {
        let pool = ThreadPool::new(2, ThreadPriority::Normal);
        let f = async_on(&pool, || 16.0_f64)
            .then(|v| v.sqrt())
            .then(|v| v * 2.0);
        assert_eq!(f.get(), Some(8.0));
    }

    #[test]
    fn cancel_before_running_prevents_functor() {
        let pool = ThreadPool::new(1, ThreadPriority::Normal);
        // Occupy the single worker so the future stays pending long enough
        // to cancel before it starts running.
        let gate = Arc::new(CompletionEvent::new());
        let gate2 = Arc::clone(&gate);
        pool.schedule(move || gate2.wait());

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let f = async_on(&pool, move || {
            ran2.store(true, Ordering::SeqCst);
            1
        });

        let cancelled = f.cancel();
        gate.notify();

        assert!(cancelled);
        assert_eq!(f.get(), None);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn when_all_collects_all_values() {
        let pool = ThreadPool::new(4, ThreadPriority::Normal);
        let futures: Vec<_> = (0..10).map(|i| async_on(&pool, move || i * i)).collect();
        let combined = when_all(futures);
        let values = combined.get().unwrap();
        let expected: Vec<i32> = (0..10).map(|i| i * i).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn shared_future_allows_repeated_get() {
        let pool = ThreadPool::new(2, ThreadPriority::Normal);
        let f = async_on(&pool, || 7);
        let f2 = f.clone();
        assert_eq!(f.get(), Some(7));
        assert_eq!(f2.get(), Some(7));
        assert_eq!(f.get(), Some(7));
    }
}
