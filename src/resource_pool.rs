//! A fixed-size pool of pre-initialized resources, grounded on
//! `dispenso/resource_pool.h`: "syntactic sugar over what is essentially a
//! set of semaphore guarded resources." The original backs that semaphore
//! with a `moodycamel::BlockingConcurrentQueue<T*>` and placement-news `T`
//! into an aligned buffer because C++ needs that to support non-movable,
//! non-copyable types. Rust's ownership model makes the pointer dance
//! unnecessary; this counts resources the same way
//! [`crate::sync::completion_event`] and [`crate::sync::latch`] count
//! down — an `AtomicU32` word with futex wait/wake — and stores the `T`
//! values themselves in a plain `Mutex<Vec<T>>` stack, reusing the
//! completion-word discipline (spec §4.3) rather than introducing a new
//! primitive.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{PoolShutDown, Timeout};
use crate::sync::{futex_wait, futex_wait_timeout, futex_wake_all};
use crate::time;

/// A counting semaphore built on the same raw futex primitives as
/// [`crate::sync::CompletionEvent`]/[`crate::sync::Latch`], specialized to
/// `ResourcePool`'s acquire/release pattern (including a shutdown state
/// that wakes every blocked waiter with an error instead of a count).
struct Semaphore {
    count: AtomicU32,
    shutdown: AtomicBool,
}

impl Semaphore {
    fn new(initial: u32) -> Self {
        Semaphore {
            count: AtomicU32::new(initial),
            shutdown: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self) -> Result<bool, PoolShutDown> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(PoolShutDown);
            }
            let cur = self.count.load(Ordering::Acquire);
            if cur == 0 {
                return Ok(false);
            }
            if self
                .count
                .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(true);
            }
        }
    }

    fn acquire(&self) -> Result<(), PoolShutDown> {
        loop {
            if self.try_acquire()? {
                return Ok(());
            }
            futex_wait(&self.count, 0);
        }
    }

    fn acquire_for(&self, timeout: Duration) -> Result<bool, PoolShutDown> {
        let deadline = time::now() + timeout.as_secs_f64();
        loop {
            if self.try_acquire()? {
                return Ok(true);
            }
            let remaining = time::duration_until(deadline);
            if remaining.is_zero() {
                return Ok(false);
            }
            futex_wait_timeout(&self.count, 0, remaining);
        }
    }

    fn release(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        futex_wake_all(&self.count);
    }

    /// Wakes every blocked (or future) `acquire` with [`PoolShutDown`].
    fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        futex_wake_all(&self.count);
    }
}

/// A pool of `size` pre-built `T` instances, acquired one at a time and
/// returned automatically when the [`Resource`] guard drops.
pub struct ResourcePool<T> {
    slots: Mutex<Vec<T>>,
    available: Semaphore,
    size: usize,
}

impl<T> ResourcePool<T> {
    /// Builds a pool of `size` resources, each produced by calling `init`
    /// once. `init` runs eagerly, `size` times, during construction.
    pub fn new<F>(size: usize, mut init: F) -> Self
    where
        F: FnMut() -> T,
    {
        let slots = (0..size).map(|_| init()).collect();
        ResourcePool {
            slots: Mutex::new(slots),
            available: Semaphore::new(size as u32),
            size,
        }
    }

    /// Acquires a resource, blocking until one is available.
    ///
    /// # Panics
    /// Panics if the pool has been [`shut_down`](Self::shut_down) — callers
    /// that need to handle shutdown gracefully should use
    /// [`try_acquire_for`](Self::try_acquire_for) instead.
    pub fn acquire(&self) -> Resource<'_, T> {
        self.available
            .acquire()
            .expect("ResourcePool::acquire called after shut_down");
        self.take_slot()
    }

    /// Acquires a resource, returning [`Timeout`] if none becomes available
    /// within `timeout`, or [`PoolShutDown`] if the pool was shut down
    /// while waiting.
    pub fn try_acquire_for(
        &self,
        timeout: Duration,
    ) -> Result<Resource<'_, T>, AcquireError> {
        match self.available.acquire_for(timeout) {
            Ok(true) => Ok(self.take_slot()),
            Ok(false) => Err(AcquireError::Timeout(Timeout)),
            Err(e) => Err(AcquireError::ShutDown(e)),
        }
    }

    fn take_slot(&self) -> Resource<'_, T> {
        let value = self
            .slots
            .lock()
            .unwrap()
            .pop()
            .expect("ResourcePool: semaphore granted a permit with no slot available");
        Resource {
            value: Some(value),
            pool: self,
        }
    }

    fn recycle(&self, value: T) {
        self.slots.lock().unwrap().push(value);
        self.available.release();
    }

    /// Wakes every thread currently blocked in [`acquire`](Self::acquire)
    /// or [`try_acquire_for`](Self::try_acquire_for) with an error instead
    /// of a resource, and fails every future call the same way. There is no
    /// un-shutdown: this is a one-way terminal state, matching
    /// [`crate::sync::CompletionEvent`]'s one-shot `notify`.
    pub fn shut_down(&self) {
        self.available.shut_down();
    }

    /// Number of resources in the pool (checked out or not).
    pub fn size(&self) -> usize {
        self.size
    }
}

impl<T> Drop for ResourcePool<T> {
    fn drop(&mut self) {
        // Mirrors the original's destructor assert: the user must ensure
        // every `Resource` has been returned before the pool itself goes
        // away. This is the programmer-error class from spec §7 (fatal in
        // debug), not something worth blocking here to collect stragglers.
        debug_assert_eq!(
            self.slots.lock().unwrap().len(),
            self.size,
            "ResourcePool dropped with resources still checked out"
        );
    }
}

/// Why [`ResourcePool::try_acquire_for`] failed to return a resource.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AcquireError {
    Timeout(Timeout),
    ShutDown(PoolShutDown),
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquireError::Timeout(e) => e.fmt(f),
            AcquireError::ShutDown(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for AcquireError {}

/// An RAII handle on one resource from a [`ResourcePool`]. Recycles the
/// resource back to its pool on drop.
pub struct Resource<'a, T> {
    value: Option<T>,
    pool: &'a ResourcePool<T>,
}

impl<T> Resource<'_, T> {
    /// Borrows the underlying resource.
    pub fn get(&self) -> &T {
        self.value.as_ref().expect("Resource: value taken twice")
    }

    /// Mutably borrows the underlying resource.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("Resource: value taken twice")
    }
}

impl<T> std::ops::Deref for Resource<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T> std::ops::DerefMut for Resource<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.get_mut()
    }
}

impl<T> Drop for Resource<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.recycle(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn acquire_and_release_roundtrip() {
        let pool = ResourcePool::new(2, || Vec::<u8>::with_capacity(16));
        {
            let mut r1 = pool.acquire();
            r1.push(1);
            assert_eq!(r1.get().len(), 1);
        }
        let r2 = pool.acquire();
        assert!(r2.get().len() <= 1);
    }

    #[test]
    fn acquire_blocks_until_a_resource_is_returned() {
        let pool = Arc::new(ResourcePool::new(1, || 0u32));
        let first = pool.acquire();

        let pool2 = Arc::clone(&pool);
        let waiting = std::thread::spawn(move || {
            let start = Instant::now();
            let _second = pool2.acquire();
            start.elapsed()
        });

        std::thread::sleep(Duration::from_millis(40));
        drop(first);
        let elapsed = waiting.join().unwrap();
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn try_acquire_for_times_out_when_pool_is_empty() {
        let pool = ResourcePool::new(1, || ());
        let _held = pool.acquire();
        let result = pool.try_acquire_for(Duration::from_millis(20));
        assert_eq!(result.err(), Some(AcquireError::Timeout(Timeout)));
    }

    #[test]
    fn shut_down_wakes_blocked_acquires_with_an_error() {
        let pool = Arc::new(ResourcePool::new(1, || ()));
        let _held = pool.acquire();

        let pool2 = Arc::clone(&pool);
        let waiting = std::thread::spawn(move || pool2.try_acquire_for(Duration::from_secs(5)));

        std::thread::sleep(Duration::from_millis(30));
        pool.shut_down();

        let result = waiting.join().unwrap();
        assert_eq!(result.err(), Some(AcquireError::ShutDown(PoolShutDown)));
    }

    #[test]
    fn concurrent_acquire_never_exceeds_pool_size() {
        let pool = Arc::new(ResourcePool::new(3, || ()));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let concurrent = Arc::clone(&concurrent);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    let _r = pool.acquire();
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }
}
