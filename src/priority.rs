//! Thread priority: a small cross-platform-ish enum plus get/set on the
//! calling thread, grounded on `dispenso/priority.h` and the note in
//! SPEC_FULL §10.6 that `setCurrentThreadPriority` failing is an operational
//! outcome, not a panic (Realtime typically needs elevated privileges).

use std::cell::Cell;

/// A thread priority setting, in increasing order of priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadPriority {
    Low,
    Normal,
    High,
    Realtime,
}

impl Default for ThreadPriority {
    fn default() -> Self {
        ThreadPriority::Normal
    }
}

thread_local! {
    // Tracks what *we* last set, since reading the OS's notion back out
    // reliably across platforms is its own can of worms (the original notes
    // this too: "If the current thread priority has been set via a
    // platform-specific mechanism, this may return an incorrect value").
    static CURRENT: Cell<ThreadPriority> = const { Cell::new(ThreadPriority::Normal) };
}

/// Returns the priority last set on the current thread via
/// [`set_current_thread_priority`], defaulting to `Normal`.
pub fn current_thread_priority() -> ThreadPriority {
    CURRENT.with(|c| c.get())
}

/// Attempts to set the current thread's scheduling priority.
///
/// Returns `false` (without panicking) if the OS denies the request — most
/// commonly `Realtime` without `CAP_SYS_NICE` on Linux. This is the
/// documented "operational, reported" failure mode from spec §7: callers
/// that need a guarantee should check the return value, not assume success.
pub fn set_current_thread_priority(prio: ThreadPriority) -> bool {
    let ok = imp::set(prio);
    if ok {
        CURRENT.with(|c| c.set(prio));
    }
    ok
}

#[cfg(unix)]
mod imp {
    use super::ThreadPriority;

    pub(super) fn set(prio: ThreadPriority) -> bool {
        // Realtime uses SCHED_FIFO via sched_setscheduler; everything else
        // stays on the default scheduler and adjusts the `nice` value via
        // setpriority(2), which is per-thread on Linux when applied to the
        // calling thread's tid.
        unsafe {
            if prio == ThreadPriority::Realtime {
                let param = libc::sched_param {
                    sched_priority: 1,
                };
                let rc = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
                return rc == 0;
            }

            // Dropping back out of realtime scheduling before adjusting nice.
            let param = libc::sched_param { sched_priority: 0 };
            libc::sched_setscheduler(0, libc::SCHED_OTHER, &param);

            let nice = match prio {
                ThreadPriority::Low => 10,
                ThreadPriority::Normal => 0,
                ThreadPriority::High => -10,
                ThreadPriority::Realtime => unreachable!(),
            };
            *libc::__errno_location() = 0;
            let rc = libc::setpriority(libc::PRIO_PROCESS, 0, nice);
            rc == 0 && *libc::__errno_location() == 0
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::ThreadPriority;

    pub(super) fn set(_prio: ThreadPriority) -> bool {
        false
    }
}
