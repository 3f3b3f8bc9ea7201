//! The `Schedulable` concept: anything that accepts a `FnOnce() + Send`
//! closure to run asynchronously, grounded on `dispenso::ConcurrentFuture`'s
//! executor parameter and `dispenso/detail/ImmediateInvoker.h` /
//! `NewThreadInvoker.h`.
//!
//! [`crate::pool::ThreadPool`] and the task set types also implement this
//! trait; anything generic over "how do I run this later" should bound on
//! `Schedulable` rather than hard-coding a pool reference.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::once_fn::OnceFunction;

/// Marker passed to [`Schedulable::schedule_force_queuing`] to request that
/// a closure never run inline even if the calling context could run it
/// immediately. The timed-task dispatcher uses this to avoid recursing
/// through its own stack when a task's due time has already passed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceQueuingTag;

/// Anything that can run a `FnOnce() + Send + 'static` closure, now or
/// later, possibly on another thread.
pub trait Schedulable {
    /// Schedules `f`. May run inline, depending on the implementation.
    fn schedule(&self, f: impl FnOnce() + Send + 'static);

    /// Schedules `f`, guaranteeing it is queued rather than run inline.
    /// Implementations that are always queued (e.g. [`ImmediateInvoker`] is
    /// the one exception — it always runs inline regardless of the tag,
    /// since it has no queue to defer to) can forward to `schedule`.
    fn schedule_force_queuing(&self, f: impl FnOnce() + Send + 'static, _tag: ForceQueuingTag) {
        self.schedule(f);
    }
}

/// Lets an `Arc`-wrapped pool/task set be passed around as a cheaply
/// cloneable `Schedulable`, e.g. when a continuation needs to carry its
/// own owned handle to the executor it runs on (see
/// [`crate::future::Future::then_on`]).
impl<S: Schedulable + ?Sized> Schedulable for std::sync::Arc<S> {
    fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        (**self).schedule(f);
    }

    fn schedule_force_queuing(&self, f: impl FnOnce() + Send + 'static, tag: ForceQueuingTag) {
        (**self).schedule_force_queuing(f, tag);
    }
}

/// Runs every scheduled closure immediately, on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateInvoker;

impl Schedulable for ImmediateInvoker {
    fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        f();
    }

    fn schedule_force_queuing(&self, f: impl FnOnce() + Send + 'static, _tag: ForceQueuingTag) {
        // There is nothing to queue onto; running inline is the closest
        // approximation, matching the original's behavior of simply
        // invoking the functor synchronously regardless of the tag.
        f();
    }
}

/// Spawns a detached thread per scheduled closure.
///
/// Detached threads outlive this invoker, so a process-wide waiter tracks
/// how many are outstanding and blocks process teardown from racing past
/// them — otherwise a `NewThreadInvoker`-spawned thread could still be
/// running when `main` returns and global state it touches has already
/// been torn down.
#[derive(Debug, Default, Clone, Copy)]
pub struct NewThreadInvoker;

static OUTSTANDING: AtomicUsize = AtomicUsize::new(0);
static WAITER: OnceLock<Mutex<()>> = OnceLock::new();

impl Schedulable for NewThreadInvoker {
    fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        OUTSTANDING.fetch_add(1, Ordering::SeqCst);
        std::thread::spawn(move || {
            f();
            OUTSTANDING.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// Blocks until every thread spawned by any [`NewThreadInvoker`] has
/// finished. Intended to be called near the end of `main` before process
/// exit, not from library code.
pub fn wait_for_new_thread_invokers() {
    let _guard = WAITER.get_or_init(|| Mutex::new(())).lock().unwrap();
    while OUTSTANDING.load(Ordering::SeqCst) != 0 {
        std::thread::yield_now();
    }
}

/// Schedules a [`OnceFunction`] onto any `Schedulable`, bridging the
/// type-erased closure storage with the generic trait bound.
pub(crate) fn schedule_once(s: &impl Schedulable, f: OnceFunction) {
    s.schedule(move || f.invoke());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn immediate_invoker_runs_inline() {
        let ran = std::cell::Cell::new(false);
        ImmediateInvoker.schedule(|| ran.set(true));
        assert!(ran.get());
    }

    #[test]
    fn new_thread_invoker_runs_eventually() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        NewThreadInvoker.schedule(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        wait_for_new_thread_invokers();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
