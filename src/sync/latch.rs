//! A count-down latch built on the same intrusive-word discipline as
//! [`super::completion_event`], grounded on `dispenso/Latch.h` (the counting
//! cousin of `CompletionEvent`) with the futex plumbing shared with
//! `shadow-shadow`'s `simple_latch.rs`.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::sync::{futex_wait, futex_wake_all};

/// A latch initialized with a count; `count_down` decrements it and wakes
/// all waiters once it reaches zero. Unlike the teacher's generational
/// `Latch`, this one is single-shot: once it reaches zero it stays there.
#[derive(Debug)]
pub struct Latch {
    count: AtomicU32,
}

impl Latch {
    /// Creates a latch that opens after `count` decrements.
    pub fn new(count: u32) -> Self {
        Latch {
            count: AtomicU32::new(count),
        }
    }

    /// Subtracts `k` from the count. Wakes all waiters if this call drives
    /// the count to zero.
    ///
    /// # Panics
    /// Panics if `k` is larger than the remaining count (an underflow,
    /// which indicates a caller bug rather than a race to handle).
    pub fn count_down(&self, k: u32) {
        let mut cur = self.count.load(Ordering::Relaxed);
        loop {
            let next = cur.checked_sub(k).expect("Latch count underflow");
            match self.count.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if next == 0 {
                        futex_wake_all(&self.count);
                    }
                    return;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// Returns whether the count has reached zero, without blocking.
    pub fn try_wait(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        loop {
            let cur = self.count.load(Ordering::Acquire);
            if cur == 0 {
                return;
            }
            futex_wait(&self.count, cur);
        }
    }

    /// Decrements by one and then blocks until the count reaches zero,
    /// combining the two most common call sites into one step.
    pub fn arrive_and_wait(&self) {
        self.count_down(1);
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn zero_count_is_already_open() {
        let latch = Latch::new(0);
        assert!(latch.try_wait());
        latch.wait();
    }

    #[test]
    fn count_down_to_zero_opens_latch() {
        let latch = Latch::new(3);
        assert!(!latch.try_wait());
        latch.count_down(2);
        assert!(!latch.try_wait());
        latch.count_down(1);
        assert!(latch.try_wait());
    }

    #[test]
    #[should_panic]
    fn count_down_past_zero_panics() {
        let latch = Latch::new(1);
        latch.count_down(2);
    }

    #[test]
    fn waiters_wake_when_count_reaches_zero() {
        let latch = Arc::new(Latch::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                std::thread::spawn(move || {
                    let start = Instant::now();
                    latch.wait();
                    start.elapsed()
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(30));
        for _ in 0..4 {
            latch.count_down(1);
        }

        for h in handles {
            let elapsed = h.join().unwrap();
            assert!(elapsed < Duration::from_secs(2));
        }
    }

    #[test]
    fn arrive_and_wait_barrier() {
        let latch = Arc::new(Latch::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                std::thread::spawn(move || latch.arrive_and_wait())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(latch.try_wait());
    }
}
