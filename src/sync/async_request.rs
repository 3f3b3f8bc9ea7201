//! SPSC async-update cell, grounded on `dispenso::AsyncRequest<T>`.
//!
//! A consumer requests a fresh value; a producer fills it in whenever it
//! gets around to it; the consumer picks it up once ready. Safe under MPMC
//! use (every transition is a CAS) but only tuned for single-producer,
//! single-consumer traffic.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};

const NONE: u8 = 0;
const NEEDS_UPDATE: u8 = 1;
const UPDATING: u8 = 2;
const READY: u8 = 3;

/// A single-slot request/response cell between one consumer and one
/// producer.
pub struct AsyncRequest<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for AsyncRequest<T> {}
unsafe impl<T: Send> Sync for AsyncRequest<T> {}

impl<T> AsyncRequest<T> {
    pub fn new() -> Self {
        AsyncRequest {
            state: AtomicU8::new(NONE),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Consumer side: asks the producer for a fresh value. No-op (returns
    /// `false`) unless the cell is currently idle.
    pub fn request_update(&self) -> bool {
        self.state
            .compare_exchange(NONE, NEEDS_UPDATE, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Producer side: if a request is outstanding, computes and stores
    /// `f()` as the new value and marks it ready. Returns `false` without
    /// calling `f` if no request is outstanding (a "superfluous producer
    /// call").
    pub fn try_emplace_update(&self, f: impl FnOnce() -> T) -> bool {
        if self
            .state
            .compare_exchange(
                NEEDS_UPDATE,
                UPDATING,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }
        let value = f();
        // SAFETY: we hold the sole `Updating` state; the consumer cannot
        // observe or touch `value` until we store `Ready`.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        true
    }

    /// Consumer side: if the value is ready, moves it out and resets the
    /// cell to idle.
    pub fn get_update(&self) -> Option<T> {
        if self.state.load(Ordering::Acquire) != READY {
            return None;
        }
        // SAFETY: `Ready` means the producer's write happened-before this
        // load via release/acquire on `state`, and we are the only
        // consumer permitted to read it.
        let value = unsafe { (*self.value.get()).assume_init_read() };
        self.state.store(NONE, Ordering::Release);
        Some(value)
    }

    /// Returns whether a value is waiting to be picked up, without
    /// consuming it.
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }
}

impl<T> Default for AsyncRequest<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for AsyncRequest<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            unsafe { (*self.value.get()).assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn full_round_trip() {
        let req: AsyncRequest<i32> = AsyncRequest::new();
        assert!(req.get_update().is_none());
        assert!(req.request_update());
        assert!(req.try_emplace_update(|| 42));
        assert_eq!(req.get_update(), Some(42));
        assert!(req.get_update().is_none());
    }

    #[test]
    fn superfluous_producer_call_returns_false() {
        let req: AsyncRequest<i32> = AsyncRequest::new();
        assert!(!req.try_emplace_update(|| 1));
    }

    #[test]
    fn duplicate_request_is_noop() {
        let req: AsyncRequest<i32> = AsyncRequest::new();
        assert!(req.request_update());
        assert!(!req.request_update());
    }

    #[test]
    fn drop_without_consuming_runs_destructor() {
        struct Bomb(Arc<AtomicUsize>);
        impl Drop for Bomb {
            fn drop(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let dropped = Arc::new(AtomicUsize::new(0));
        let req: AsyncRequest<Bomb> = AsyncRequest::new();
        req.request_update();
        req.try_emplace_update(|| Bomb(Arc::clone(&dropped)));
        drop(req);
        assert_eq!(dropped.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn spsc_sum_across_threads() {
        let req = Arc::new(AsyncRequest::<u64>::new());
        let total_requests = 500u64;

        let producer_req = Arc::clone(&req);
        let producer = std::thread::spawn(move || {
            let mut served = 0u64;
            while served < total_requests {
                if producer_req.try_emplace_update(|| served) {
                    served += 1;
                }
                std::thread::yield_now();
            }
        });

        let mut sum = 0u64;
        let mut received = 0u64;
        while received < total_requests {
            req.request_update();
            if let Some(v) = req.get_update() {
                sum += v;
                received += 1;
            }
            std::thread::yield_now();
        }
        producer.join().unwrap();
        let expected: u64 = (0..total_requests).sum();
        assert_eq!(sum, expected);
    }
}
