//! A move-only, type-erased `FnOnce() + Send` handle whose backing storage
//! comes from the small-buffer allocator, grounded on
//! `dispenso/once_function.h` + `dispenso/detail/once_callable_impl.h`.
//!
//! The C++ original has to document "operator() must be called exactly
//! once" as a runtime contract enforced by a debug-only assert, because
//! `OnceFunction::operator()` takes `this` by reference. Rust's ownership
//! system lets us do better: [`OnceFunction::invoke`] takes `self` by value,
//! so calling it twice is a compile error, not a debug-mode assertion. This
//! is the "tighten best-effort to a real guarantee" move spec §9's Open
//! Questions ask for, applied to invariant #1 in spec §8 rather than to
//! `Future` cancellation (see `future.rs` for that one).

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::alloc;

/// Where a `OnceFunction`'s storage came from, so it can be released
/// correctly regardless of which path allocated it.
#[derive(Clone, Copy)]
enum Storage {
    SmallBuffer { class: usize },
    System { layout: Layout },
}

impl Storage {
    /// # Safety
    /// `data` must be a chunk obtained from the allocator path this
    /// `Storage` describes, not yet released.
    unsafe fn release(self, data: NonNull<u8>) {
        match self {
            Storage::SmallBuffer { class } => unsafe { alloc::dealloc(class, data) },
            Storage::System { layout } => {
                if layout.size() != 0 {
                    unsafe { std::alloc::dealloc(data.as_ptr(), layout) };
                }
            }
        }
    }
}

struct Inner {
    data: NonNull<u8>,
    storage: Storage,
    /// Invokes the embedded `F`, drops it, and releases `data`, all in one
    /// step. Set to `run::<F>` at construction time.
    run: unsafe fn(NonNull<u8>, Storage),
    /// Drops the embedded `F` in place (without invoking it) and releases
    /// `data`. Used only when a `OnceFunction` is dropped without having
    /// been invoked, e.g. because a task set discarded pending work under
    /// its cancel policy.
    drop_glue: unsafe fn(NonNull<u8>, Storage),
}

unsafe impl Send for Inner {}

/// A type-erased callable invoked exactly once, enforced by `invoke`
/// consuming `self`. Construction allocates a trampoline from the
/// small-buffer allocator when the closure fits (see
/// [`alloc::MAX_SMALL_BUFFER`]), falling back to the system allocator
/// otherwise.
pub struct OnceFunction {
    // `None` only momentarily, inside `invoke`/`Drop`; see those for why an
    // `Option` is needed despite `invoke` taking `self` by value.
    inner: Option<Inner>,
}

impl OnceFunction {
    /// Wraps `f` for exactly-once invocation.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let size = std::mem::size_of::<F>();
        let align = std::mem::align_of::<F>();

        let (data, storage) = match alloc::class_for(size, align) {
            Some(class) => (alloc::alloc(class), Storage::SmallBuffer { class }),
            None => {
                let layout = Layout::new::<F>();
                let ptr = if layout.size() == 0 {
                    NonNull::dangling()
                } else {
                    let raw = unsafe { std::alloc::alloc(layout) };
                    NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout))
                };
                (ptr, Storage::System { layout })
            }
        };

        // SAFETY: `data` points to storage sized/aligned for `F` that
        // nothing else observes until `run::<F>`/`drop_glue::<F>` reads it.
        unsafe { data.cast::<F>().as_ptr().write(f) };

        OnceFunction {
            inner: Some(Inner {
                data,
                storage,
                run: run::<F>,
                drop_glue: drop_glue::<F>,
            }),
        }
    }

    /// Invokes the wrapped functor and releases its storage. Ownership of
    /// `self` makes a second call impossible to express.
    pub fn invoke(mut self) {
        let inner = self.inner.take().expect("OnceFunction invariant");
        // SAFETY: `inner.data` holds a live `F` written by `new`, matched
        // with `inner.run = run::<F>`.
        unsafe { (inner.run)(inner.data, inner.storage) };
    }
}

impl Drop for OnceFunction {
    fn drop(&mut self) {
        // Only reached if `invoke` was never called. We must still release
        // the backing storage and run `F`'s destructor, but must not invoke
        // `F` itself (that would violate "exactly once" by running work
        // whose scheduling was abandoned).
        if let Some(inner) = self.inner.take() {
            unsafe { (inner.drop_glue)(inner.data, inner.storage) };
        }
    }
}

/// # Safety
/// Must be called with a `NonNull<u8>`/`Storage` pair produced by
/// `OnceFunction::new::<F>` for this same `F`, exactly once.
unsafe fn run<F: FnOnce()>(data: NonNull<u8>, storage: Storage) {
    let f_ptr = data.cast::<F>().as_ptr();
    // Move the functor out before running it and before releasing the
    // chunk, so the chunk is only freed after nothing references it.
    let f = unsafe { f_ptr.read() };
    f();
    unsafe { storage.release(data) };
}

/// # Safety
/// Must be called with a `NonNull<u8>`/`Storage` pair produced by
/// `OnceFunction::new::<F>` for this same `F`, exactly once, and only when
/// `F` was never moved out via `run`.
unsafe fn drop_glue<F: FnOnce()>(data: NonNull<u8>, storage: Storage) {
    let f_ptr = data.cast::<F>().as_ptr();
    unsafe { std::ptr::drop_in_place(f_ptr) };
    unsafe { storage.release(data) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn invoke_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let f = OnceFunction::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        f.invoke();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn large_closure_falls_back_to_system_alloc() {
        let big = [0u8; 4096];
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let f = OnceFunction::new(move || {
            c.fetch_add(big.iter().map(|&b| b as usize).sum(), Ordering::SeqCst);
        });
        f.invoke();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_without_invoke_releases_storage_without_running() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let f = OnceFunction::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(f);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_without_invoke_still_drops_captured_state() {
        struct DropBomb(Arc<AtomicUsize>);
        impl Drop for DropBomb {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let dropped = Arc::new(AtomicUsize::new(0));
        let bomb = DropBomb(Arc::clone(&dropped));
        let f = OnceFunction::new(move || {
            let _keep_alive = &bomb;
        });
        drop(f);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn move_transfers_ownership() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let f = OnceFunction::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let moved = f;
        moved.invoke();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_across_threads() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let f = OnceFunction::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let handle = std::thread::spawn(move || f.invoke());
        handle.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
