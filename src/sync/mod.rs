//! Low-level synchronization primitives built on a single intrusive status
//! word each, grounded on `dispenso/CompletionEvent.h`,
//! `dispenso/detail/CompletionSignal.h`, and `dispenso/detail/RWLockImpl.h`,
//! with the futex-wait discipline borrowed from
//! `shadow-shadow/src/lib/scheduler/sync/simple_latch.rs`.
//!
//! These are intentionally not OS-escalating: no fairness guarantees, no
//! priority inheritance. They exist to make short critical sections and
//! SPSC handoffs cheap, not to replace `std::sync::Mutex` for long holds.

pub mod async_request;
pub mod completion_event;
pub mod latch;
pub mod rwlock;

pub use async_request::AsyncRequest;
pub use completion_event::CompletionEvent;
pub use latch::Latch;
pub use rwlock::RwSpinLock;

/// Performs a raw Linux futex syscall, shared by every primitive in this
/// module that needs to block without pulling in a condvar.
///
/// # Safety
/// `uaddr` must stay valid for the duration of the call; callers only ever
/// pass `&AtomicU32` fields embedded in `'static` or otherwise pinned
/// storage, so in practice this is always safe to call.
pub(crate) fn futex_wait(uaddr: &std::sync::atomic::AtomicU32, expected: u32) {
    let rv = unsafe {
        libc::syscall(
            libc::SYS_futex,
            uaddr.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null_mut::<u32>(),
            0,
        )
    };
    if rv < 0 {
        let errno = nix::errno::Errno::last();
        assert!(
            matches!(
                errno,
                nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR
            ),
            "FUTEX_WAIT failed with {errno:?}"
        );
    }
}

pub(crate) fn futex_wake_all(uaddr: &std::sync::atomic::AtomicU32) {
    let rv = unsafe {
        libc::syscall(
            libc::SYS_futex,
            uaddr.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX as u32,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null_mut::<u32>(),
            0,
        )
    };
    assert!(rv >= 0, "FUTEX_WAKE failed");
}

/// Like [`futex_wait`], but gives up after `timeout` even if never woken.
/// Used by [`crate::timed_task`]'s dispatcher to sleep until either a
/// reschedule bumps the epoch or the next due time arrives, whichever is
/// first.
pub(crate) fn futex_wait_timeout(
    uaddr: &std::sync::atomic::AtomicU32,
    expected: u32,
    timeout: std::time::Duration,
) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as i64,
    };
    let rv = unsafe {
        libc::syscall(
            libc::SYS_futex,
            uaddr.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null_mut::<u32>(),
            0,
        )
    };
    if rv < 0 {
        let errno = nix::errno::Errno::last();
        assert!(
            matches!(
                errno,
                nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR | nix::errno::Errno::ETIMEDOUT
            ),
            "FUTEX_WAIT (timed) failed with {errno:?}"
        );
    }
}
