//! A reader/writer lock packed into a single 32-bit atomic, grounded on
//! `dispenso/detail/RWLockImpl.h`. Optimized for short critical sections:
//! no OS-wait escalation, no fairness. Spinning between probes uses
//! [`crate::time::cpu_relax`], the same relax primitive the allocator and
//! scheduler reach for.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::time::cpu_relax;

const WRITE_BIT: u32 = 0x8000_0000;

/// The shared algorithm, reusable by both the cacheline-aligned and
/// unaligned lock wrappers below.
#[derive(Debug, Default)]
struct RwLockWord(AtomicU32);

impl RwLockWord {
    const fn new() -> Self {
        RwLockWord(AtomicU32::new(0))
    }

    fn lock_shared(&self) {
        loop {
            let prev = self.0.fetch_add(1, Ordering::Acquire);
            if prev & WRITE_BIT == 0 {
                return;
            }
            // A writer holds (or is racing for) the lock; back out and
            // spin until it clears before retrying.
            self.0.fetch_sub(1, Ordering::Relaxed);
            while self.0.load(Ordering::Relaxed) & WRITE_BIT != 0 {
                cpu_relax();
            }
        }
    }

    fn unlock_shared(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }

    fn lock(&self) {
        loop {
            let prev = self.0.fetch_or(WRITE_BIT, Ordering::Acquire);
            if prev & WRITE_BIT == 0 {
                // We won the writer bit; now drain any readers that were
                // already in the critical section.
                while self.0.load(Ordering::Acquire) & !WRITE_BIT != 0 {
                    cpu_relax();
                }
                return;
            }
            while self.0.load(Ordering::Relaxed) & WRITE_BIT != 0 {
                cpu_relax();
            }
        }
    }

    fn unlock(&self) {
        self.0.fetch_and(!WRITE_BIT, Ordering::Release);
    }

    /// Upgrades a held shared lock to exclusive. Only correct if at most
    /// one thread can attempt this concurrently (the spec's "power user"
    /// caveat): two concurrent upgraders would both set the writer bit and
    /// both wait for each other's reader count to drain.
    fn lock_upgrade(&self) {
        loop {
            let prev = self.0.fetch_or(WRITE_BIT, Ordering::Acquire);
            if prev & WRITE_BIT == 0 {
                break;
            }
            while self.0.load(Ordering::Relaxed) & WRITE_BIT != 0 {
                cpu_relax();
            }
        }
        // Release our own reader count now that we hold the writer bit.
        self.0.fetch_sub(1, Ordering::Relaxed);
        while self.0.load(Ordering::Acquire) & !WRITE_BIT != 0 {
            cpu_relax();
        }
    }

    fn lock_downgrade(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
        self.0.fetch_and(!WRITE_BIT, Ordering::Release);
    }
}

/// A cacheline-aligned reader/writer spinlock: pad it so independent locks
/// in an array never share a cache line with each other.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct RwSpinLock(RwLockWord);

impl RwSpinLock {
    pub const fn new() -> Self {
        RwSpinLock(RwLockWord::new())
    }

    pub fn lock_shared(&self) {
        self.0.lock_shared();
    }

    pub fn unlock_shared(&self) {
        self.0.unlock_shared();
    }

    pub fn lock(&self) {
        self.0.lock();
    }

    pub fn unlock(&self) {
        self.0.unlock();
    }

    pub fn lock_upgrade(&self) {
        self.0.lock_upgrade();
    }

    pub fn lock_downgrade(&self) {
        self.0.lock_downgrade();
    }
}

/// An unaligned variant for packing many locks densely, e.g. one per
/// element of a large array where cacheline padding would be wasteful.
#[derive(Debug, Default)]
pub struct RwSpinLockPacked(RwLockWord);

impl RwSpinLockPacked {
    pub const fn new() -> Self {
        RwSpinLockPacked(RwLockWord::new())
    }

    pub fn lock_shared(&self) {
        self.0.lock_shared();
    }

    pub fn unlock_shared(&self) {
        self.0.unlock_shared();
    }

    pub fn lock(&self) {
        self.0.lock();
    }

    pub fn unlock(&self) {
        self.0.unlock();
    }

    pub fn lock_upgrade(&self) {
        self.0.lock_upgrade();
    }

    pub fn lock_downgrade(&self) {
        self.0.lock_downgrade();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn exclusive_excludes_readers() {
        let lock = RwSpinLock::new();
        lock.lock();
        lock.unlock();
        lock.lock_shared();
        lock.unlock_shared();
    }

    #[test]
    fn multiple_readers_concurrent() {
        let lock = Arc::new(RwSpinLock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    lock.lock_shared();
                    std::thread::sleep(Duration::from_millis(10));
                    lock.unlock_shared();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn writer_excludes_everyone() {
        let lock = Arc::new(RwSpinLock::new());
        let shared_state = Arc::new(std::sync::Mutex::new(0));

        lock.lock();
        let l2 = Arc::clone(&lock);
        let s2 = Arc::clone(&shared_state);
        let t = std::thread::spawn(move || {
            l2.lock_shared();
            *s2.lock().unwrap() += 1;
            l2.unlock_shared();
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*shared_state.lock().unwrap(), 0);
        lock.unlock();
        t.join().unwrap();
        assert_eq!(*shared_state.lock().unwrap(), 1);
    }

    #[test]
    fn upgrade_then_downgrade_roundtrip() {
        let lock = RwSpinLock::new();
        lock.lock_shared();
        lock.lock_upgrade();
        lock.lock_downgrade();
        lock.unlock_shared();
    }
}
