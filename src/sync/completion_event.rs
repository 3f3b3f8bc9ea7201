//! One-shot, single-publisher, many-waiter completion signal, grounded on
//! `dispenso/CompletionEvent.h`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::sync::{futex_wait, futex_wait_timeout, futex_wake_all};
use crate::time;

/// A one-shot event: `notify` stores a non-zero word and wakes every
/// waiter; `wait` blocks until the word is non-zero. Safe to call `notify`
/// before any `wait` begins — waiters always re-check the word before
/// blocking, so there is no lost-wakeup window.
///
/// `reset` is provided for reuse across rounds but must not race with
/// concurrent waiters or notifiers; callers are responsible for their own
/// external synchronization around reuse, exactly as the original
/// documents.
#[derive(Debug, Default)]
pub struct CompletionEvent {
    word: AtomicU32,
}

impl CompletionEvent {
    pub fn new() -> Self {
        CompletionEvent {
            word: AtomicU32::new(0),
        }
    }

    /// Marks the event complete and wakes all current and future waiters
    /// that observe the store.
    pub fn notify(&self) {
        self.word.store(1, Ordering::Release);
        futex_wake_all(&self.word);
    }

    /// Returns whether the event has been notified, without blocking.
    pub fn is_set(&self) -> bool {
        self.word.load(Ordering::Acquire) != 0
    }

    /// Blocks until [`notify`](Self::notify) has been called.
    pub fn wait(&self) {
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur != 0 {
                return;
            }
            futex_wait(&self.word, cur);
        }
    }

    /// Blocks until notified or `timeout` elapses, returning whether the
    /// event fired.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = time::now() + timeout.as_secs_f64();
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur != 0 {
                return true;
            }
            let remaining = time::duration_until(deadline);
            if remaining.is_zero() {
                return self.is_set();
            }
            futex_wait_timeout(&self.word, cur, remaining);
        }
    }

    /// Resets the word to zero for reuse. Must not be called concurrently
    /// with any in-flight `wait`/`notify`.
    pub fn reset(&self) {
        self.word.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wait_returns_immediately_if_already_notified() {
        let ev = CompletionEvent::new();
        ev.notify();
        ev.wait();
    }

    #[test]
    fn notify_wakes_blocked_waiter() {
        let ev = Arc::new(CompletionEvent::new());
        let ev2 = Arc::clone(&ev);
        let t = std::thread::spawn(move || {
            let start = Instant::now();
            ev2.wait();
            start.elapsed()
        });
        std::thread::sleep(Duration::from_millis(50));
        ev.notify();
        let elapsed = t.join().unwrap();
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn wait_for_times_out_when_never_notified() {
        let ev = CompletionEvent::new();
        assert!(!ev.wait_for(Duration::from_millis(20)));
    }

    #[test]
    fn reset_allows_reuse() {
        let ev = CompletionEvent::new();
        ev.notify();
        assert!(ev.is_set());
        ev.reset();
        assert!(!ev.is_set());
        ev.notify();
        ev.wait();
    }
}
